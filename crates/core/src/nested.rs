//! Construction of child execution contexts for nested pipeline steps.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{LimitOverrides, LimitsConfig};
use crate::context::{ExecutionContext, ResultMap};
use crate::error::NestingError;
use crate::guard;
use crate::outputs::OutputSpec;
use crate::path;

const PLACEHOLDER_OPEN: &str = "{{";
const PLACEHOLDER_CLOSE: &str = "}}";

/// Declaration of a nested pipeline invocation inside a parent step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSpec {
    #[serde(alias = "pipeline_id")]
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub inherit_context: bool,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitOverrides>,
}

impl InvocationSpec {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            step_name: None,
            inherit_context: false,
            inputs: Map::new(),
            outputs: None,
            timeout_seconds: None,
            limits: None,
        }
    }

    pub fn with_step_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn inheriting(mut self) -> Self {
        self.inherit_context = true;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, template: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), template.into());
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn display_step_name(&self) -> &str {
        self.step_name.as_deref().unwrap_or(&self.pipeline)
    }
}

#[derive(Debug)]
pub struct NestedContext<'p> {
    pub context: ExecutionContext<'p>,
    pub inputs: ResultMap,
}

/// Build the context a nested pipeline runs in.
///
/// Cycle and depth violations are returned before anything is constructed.
/// Inputs are best effort: a template that cannot be resolved is handed to
/// the child verbatim.
pub fn create_nested_context<'p>(
    parent: &'p ExecutionContext<'p>,
    spec: &InvocationSpec,
    limits: &LimitsConfig,
) -> Result<NestedContext<'p>, NestingError> {
    guard::check_cycle(parent, &spec.pipeline)?;
    guard::check_depth(parent, limits.max_depth)?;

    let inputs = resolve_inputs(parent, &spec.inputs);

    let (global_vars, functions, providers) = if spec.inherit_context {
        (
            Arc::clone(&parent.global_vars),
            Arc::clone(&parent.functions),
            Arc::clone(&parent.providers),
        )
    } else {
        (
            Arc::new(Map::new()),
            Arc::new(Map::new()),
            Arc::new(Map::new()),
        )
    };

    let context = ExecutionContext {
        pipeline_id: spec.pipeline.clone(),
        nesting_depth: parent.nesting_depth + 1,
        step_count: 0,
        results: Map::new(),
        inputs: inputs.clone(),
        global_vars,
        functions,
        providers,
        parent: Some(parent),
        start_time: Some(Utc::now()),
        current_step: None,
        step_index: None,
        trace_id: parent.trace_id.clone(),
        span_id: None,
    };

    debug!(
        parent = %parent.pipeline_id,
        pipeline_id = %context.pipeline_id,
        depth = context.nesting_depth,
        inherit_context = spec.inherit_context,
        inputs = inputs.len(),
        "Created nested execution context"
    );

    Ok(NestedContext { context, inputs })
}

pub fn resolve_inputs(parent: &ExecutionContext<'_>, templates: &Map<String, Value>) -> ResultMap {
    templates
        .iter()
        .map(|(name, template)| (name.clone(), resolve_template(parent, template)))
        .collect()
}

/// Resolve one input template against the parent context.
///
/// A string that is a single placeholder yields the referenced value with its
/// JSON type intact; other strings are interpolated as text. Arrays and
/// objects are resolved element-wise and scalars pass through.
pub fn resolve_template(parent: &ExecutionContext<'_>, template: &Value) -> Value {
    match template {
        Value::String(text) => resolve_string(parent, text),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_template(parent, item))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_template(parent, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(parent: &ExecutionContext<'_>, text: &str) -> Value {
    if !text.contains(PLACEHOLDER_OPEN) {
        return Value::String(text.to_string());
    }

    if let Some(expr) = single_placeholder(text) {
        return match resolve_reference(parent, expr) {
            Some(value) => value.clone(),
            None => unresolved(parent, text, expr),
        };
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find(PLACEHOLDER_OPEN) {
        let after_open = &rest[open + PLACEHOLDER_OPEN.len()..];
        let Some(close) = after_open.find(PLACEHOLDER_CLOSE) else {
            break;
        };
        let expr = after_open[..close].trim();
        let Some(value) = resolve_reference(parent, expr) else {
            return unresolved(parent, text, expr);
        };

        output.push_str(&rest[..open]);
        match value {
            Value::String(s) => output.push_str(s),
            other => output.push_str(&other.to_string()),
        }
        rest = &after_open[close + PLACEHOLDER_CLOSE.len()..];
    }
    output.push_str(rest);

    Value::String(output)
}

fn unresolved(parent: &ExecutionContext<'_>, template: &str, expr: &str) -> Value {
    debug!(
        pipeline_id = %parent.pipeline_id,
        template,
        reference = expr,
        "Input template did not resolve; passing it through literally"
    );
    Value::String(template.to_string())
}

fn single_placeholder(text: &str) -> Option<&str> {
    let inner = text
        .trim()
        .strip_prefix(PLACEHOLDER_OPEN)?
        .strip_suffix(PLACEHOLDER_CLOSE)?;
    if inner.contains(PLACEHOLDER_OPEN) || inner.contains(PLACEHOLDER_CLOSE) {
        return None;
    }
    Some(inner.trim())
}

fn resolve_reference<'a>(parent: &'a ExecutionContext<'_>, expr: &str) -> Option<&'a Value> {
    let segments: Vec<&str> = path::split(expr).collect();
    let (&root, rest) = segments.split_first()?;

    match root {
        "steps" => {
            let (&step, mut rest) = rest.split_first()?;
            let value = parent.results.get(step)?;
            if rest.first() == Some(&"result") && value.get("result").is_none() {
                rest = &rest[1..];
            }
            path::descend(value, rest.iter().copied())
        }
        "global_vars" | "global" => {
            let (&name, rest) = rest.split_first()?;
            path::descend(parent.global_vars.get(name)?, rest.iter().copied())
        }
        "inputs" => {
            let (&name, rest) = rest.split_first()?;
            path::descend(parent.inputs.get(name)?, rest.iter().copied())
        }
        step => path::descend(parent.results.get(step)?, rest.iter().copied()),
    }
}
