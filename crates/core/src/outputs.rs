use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::context::ResultMap;
use crate::error::ExtractionError;
use crate::path;

/// One entry of a nested step's `outputs` declaration.
///
/// ```json
/// ["summary", { "path": "analysis.score", "as": "score" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    Key(String),
    Path {
        path: String,
        #[serde(default, alias = "as", skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl OutputSpec {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn path(path: impl Into<String>, alias: Option<&str>) -> Self {
        Self::Path {
            path: path.into(),
            alias: alias.map(ToString::to_string),
        }
    }

    fn target_key(&self) -> &str {
        match self {
            Self::Key(key) => key,
            Self::Path { path, alias } => alias.as_deref().unwrap_or(path),
        }
    }
}

/// Shape a child's results for its parent.
///
/// Without a spec the results pass through untouched. With one, every entry
/// must resolve; the first one that does not aborts the whole extraction.
pub fn extract_outputs(
    child_results: &ResultMap,
    output_spec: Option<&[OutputSpec]>,
) -> Result<ResultMap, ExtractionError> {
    let spec = match output_spec {
        Some(spec) if !spec.is_empty() => spec,
        _ => return Ok(child_results.clone()),
    };

    let mut extracted = Map::new();
    for entry in spec {
        let value = match entry {
            OutputSpec::Key(key) => child_results
                .get(key)
                .ok_or_else(|| ExtractionError::MissingKey { key: key.clone() })?,
            OutputSpec::Path { path, .. } => path::lookup(child_results, path)
                .ok_or_else(|| ExtractionError::MissingPath { path: path.clone() })?,
        };
        extracted.insert(entry.target_key().to_string(), value.clone());
    }

    Ok(extracted)
}
