use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Ordered step-name → value map.
pub type ResultMap = Map<String, Value>;

/// State threaded through one pipeline run.
///
/// A nested context borrows its parent for its whole lifetime, so the parent
/// stays suspended (and unmodified) while the child runs, and the ancestor
/// chain can never close into a cycle.
#[derive(Debug, Clone)]
pub struct ExecutionContext<'p> {
    pub pipeline_id: String,
    pub nesting_depth: u32,
    pub step_count: u64,
    pub results: ResultMap,
    pub inputs: ResultMap,
    pub global_vars: Arc<ResultMap>,
    pub functions: Arc<ResultMap>,
    pub providers: Arc<ResultMap>,
    pub parent: Option<&'p ExecutionContext<'p>>,
    pub start_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub step_index: Option<usize>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl ExecutionContext<'static> {
    pub fn root(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            nesting_depth: 0,
            step_count: 0,
            results: Map::new(),
            inputs: Map::new(),
            global_vars: Arc::new(Map::new()),
            functions: Arc::new(Map::new()),
            providers: Arc::new(Map::new()),
            parent: None,
            start_time: Some(Utc::now()),
            current_step: None,
            step_index: None,
            trace_id: Some(uuid::Uuid::new_v4().to_string()),
            span_id: None,
        }
    }
}

impl<'p> ExecutionContext<'p> {
    pub fn with_global_vars(mut self, vars: ResultMap) -> Self {
        self.global_vars = Arc::new(vars);
        self
    }

    pub fn with_functions(mut self, functions: ResultMap) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    pub fn with_providers(mut self, providers: ResultMap) -> Self {
        self.providers = Arc::new(providers);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Mark `step_name` as the step currently executing.
    pub fn begin_step(&mut self, step_name: impl Into<String>) {
        self.current_step = Some(step_name.into());
        self.step_index = Some(self.step_count as usize);
    }

    /// Store a finished step's output and count it against the step budget.
    pub fn record_step(&mut self, step_name: impl Into<String>, value: Value) {
        self.results.insert(step_name.into(), value);
        self.step_count += 1;
    }

    /// Milliseconds since the context started, 0 when the start is unknown
    /// or lies in the future of `now`.
    pub fn elapsed_ms_at(&self, now: DateTime<Utc>) -> u64 {
        self.start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn ancestors(&self) -> Ancestors<'_, 'p> {
        Ancestors {
            next: Some(self),
        }
    }
}

/// Iterator from a context up to the root, starting with the context itself.
pub struct Ancestors<'a, 'p> {
    next: Option<&'a ExecutionContext<'p>>,
}

impl<'a, 'p> Iterator for Ancestors<'a, 'p> {
    type Item = &'a ExecutionContext<'p>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    #[test]
    fn root_context_starts_empty() {
        let ctx = ExecutionContext::root("main");

        assert_eq!(ctx.pipeline_id, "main");
        assert_eq!(ctx.nesting_depth, 0);
        assert_eq!(ctx.step_count, 0);
        assert!(ctx.results.is_empty());
        assert!(ctx.is_root());
        assert!(ctx.start_time.is_some());
        assert!(ctx.trace_id.is_some());
    }

    #[test]
    fn record_step_keeps_insertion_order() {
        let mut ctx = ExecutionContext::root("main");
        ctx.record_step("zeta", json!(1));
        ctx.record_step("alpha", json!(2));

        let keys: Vec<_> = ctx.results.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(ctx.step_count, 2);
    }

    #[test]
    fn begin_step_tracks_index() {
        let mut ctx = ExecutionContext::root("main");
        ctx.record_step("first", json!(null));
        ctx.begin_step("second");

        assert_eq!(ctx.current_step.as_deref(), Some("second"));
        assert_eq!(ctx.step_index, Some(1));
    }

    #[test]
    fn elapsed_defaults_to_zero_without_start_time() {
        let mut ctx = ExecutionContext::root("main");
        let start = ctx.start_time.expect("start time");
        assert_eq!(ctx.elapsed_ms_at(start + Duration::milliseconds(1500)), 1500);
        assert_eq!(ctx.elapsed_ms_at(start - Duration::milliseconds(10)), 0);

        ctx.start_time = None;
        assert_eq!(ctx.elapsed_ms_at(Utc::now()), 0);
    }

    #[test]
    fn ancestors_walk_to_root() {
        let root = ExecutionContext::root("a");
        let mut child = root.clone();
        child.pipeline_id = "b".to_string();
        child.nesting_depth = 1;
        child.parent = Some(&root);

        let ids: Vec<_> = child.ancestors().map(|c| c.pipeline_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
