use serde_json::{Map, Value};

/// Resolve a dotted path such as `step.items.0.name` against a map.
/// Numeric segments index into arrays.
pub fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = split(path);
    let first = segments.next()?;
    let value = root.get(first)?;
    descend(value, segments)
}

pub fn descend<'a, 's>(
    mut value: &'a Value,
    segments: impl Iterator<Item = &'s str>,
) -> Option<&'a Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

pub fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').map(str::trim).filter(|s| !s.is_empty())
}
