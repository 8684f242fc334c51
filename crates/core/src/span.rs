use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Running,
    Completed,
    Failed,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One recorded pipeline or step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub depth: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the recorder knew the failure's category; older traces and
    /// opaque failures leave it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl Span {
    pub fn new(pipeline_id: impl Into<String>, depth: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: None,
            trace_id: None,
            pipeline_id: pipeline_id.into(),
            step_name: None,
            step_type: None,
            status: SpanStatus::Running,
            duration_ms: None,
            depth,
            start_time: Utc::now(),
            error: None,
            category: None,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        self.step_name.is_none()
    }

    pub fn duration_or_zero(&self) -> u64 {
        self.duration_ms.unwrap_or(0)
    }

    /// Recorded category, falling back to classifying the error text.
    pub fn error_category(&self) -> ErrorCategory {
        self.category
            .unwrap_or_else(|| ErrorCategory::classify(self.error.as_deref().unwrap_or_default()))
    }
}

/// Concurrent in-memory span store fed by whoever executes pipelines.
///
/// Recording is best effort: bad transitions are logged and ignored so a
/// tracing problem never turns into an execution failure.
#[derive(Debug, Default, Clone)]
pub struct SpanRecorder {
    spans: Arc<DashMap<String, Span>>,
}

impl SpanRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pipeline span for `ctx`, parented to `parent_span_id`.
    pub fn start_pipeline(&self, ctx: &ExecutionContext<'_>, parent_span_id: Option<&str>) -> String {
        let mut span = Span::new(ctx.pipeline_id.clone(), ctx.nesting_depth);
        span.parent_span_id = parent_span_id.map(ToString::to_string);
        span.trace_id = ctx.trace_id.clone();
        self.insert(span)
    }

    /// Open a step span under the pipeline span of `ctx`.
    pub fn start_step(
        &self,
        ctx: &ExecutionContext<'_>,
        step_name: impl Into<String>,
        step_type: Option<&str>,
    ) -> String {
        let mut span = Span::new(ctx.pipeline_id.clone(), ctx.nesting_depth);
        span.parent_span_id = ctx.span_id.clone();
        span.trace_id = ctx.trace_id.clone();
        span.step_name = Some(step_name.into());
        span.step_type = step_type.map(ToString::to_string);
        self.insert(span)
    }

    pub fn complete(&self, span_id: &str) {
        self.finish(span_id, SpanStatus::Completed, None, None);
    }

    pub fn fail(&self, span_id: &str, error: impl Into<String>) {
        self.finish(span_id, SpanStatus::Failed, Some(error.into()), None);
    }

    /// Like [`fail`](Self::fail), keeping the category of a typed failure.
    pub fn fail_with(&self, span_id: &str, error: impl Into<String>, category: ErrorCategory) {
        self.finish(span_id, SpanStatus::Failed, Some(error.into()), Some(category));
    }

    pub fn get(&self, span_id: &str) -> Option<Span> {
        self.spans.get(span_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Copy of every span recorded so far, ordered by start time.
    pub fn snapshot(&self) -> Vec<Span> {
        let mut spans: Vec<Span> = self.spans.iter().map(|entry| entry.value().clone()).collect();
        spans.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        spans
    }

    fn insert(&self, span: Span) -> String {
        let id = span.id.clone();
        debug!(
            span_id = %id,
            pipeline_id = %span.pipeline_id,
            step = span.step_name.as_deref().unwrap_or("-"),
            depth = span.depth,
            "Span started"
        );
        self.spans.insert(id.clone(), span);
        id
    }

    fn finish(
        &self,
        span_id: &str,
        status: SpanStatus,
        error: Option<String>,
        category: Option<ErrorCategory>,
    ) {
        let Some(mut entry) = self.spans.get_mut(span_id) else {
            warn!(span_id, "Attempted to finish an unknown span");
            return;
        };
        let span = entry.value_mut();
        if span.status.is_terminal() {
            warn!(
                span_id,
                current = span.status.as_str(),
                requested = status.as_str(),
                "Span already finished; ignoring transition"
            );
            return;
        }

        let elapsed = (Utc::now() - span.start_time).num_milliseconds().max(0) as u64;
        span.status = status;
        span.duration_ms = Some(elapsed);
        span.error = error;
        span.category = category;
        debug!(
            span_id,
            pipeline_id = %span.pipeline_id,
            status = status.as_str(),
            duration_ms = elapsed,
            "Span finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_and_step_spans_link_through_context() {
        let recorder = SpanRecorder::new();
        let mut ctx = ExecutionContext::root("main");
        let root_span = recorder.start_pipeline(&ctx, None);
        ctx.span_id = Some(root_span.clone());

        let step_span = recorder.start_step(&ctx, "fetch", Some("http"));
        let step = recorder.get(&step_span).expect("step span");

        assert_eq!(step.parent_span_id.as_deref(), Some(root_span.as_str()));
        assert_eq!(step.step_type.as_deref(), Some("http"));
        assert_eq!(step.trace_id, ctx.trace_id);
        assert_eq!(step.status, SpanStatus::Running);
        assert!(step.duration_ms.is_none());
    }

    #[test]
    fn spans_transition_to_terminal_state_once() {
        let recorder = SpanRecorder::new();
        let ctx = ExecutionContext::root("main");
        let id = recorder.start_pipeline(&ctx, None);

        recorder.fail(&id, "boom");
        recorder.complete(&id);

        let span = recorder.get(&id).expect("span");
        assert_eq!(span.status, SpanStatus::Failed);
        assert_eq!(span.error.as_deref(), Some("boom"));
        assert!(span.duration_ms.is_some());
    }

    #[test]
    fn typed_failure_category_wins_over_error_text() {
        let recorder = SpanRecorder::new();
        let ctx = ExecutionContext::root("memory_report");
        let typed = recorder.start_pipeline(&ctx, None);
        let opaque = recorder.start_pipeline(&ctx, None);

        recorder.fail_with(
            &typed,
            "nested pipeline 'memory_report' failed: boom",
            ErrorCategory::Unknown,
        );
        recorder.fail(&opaque, "upstream resource not found");

        let typed = recorder.get(&typed).expect("typed span");
        assert_eq!(typed.category, Some(ErrorCategory::Unknown));
        assert_eq!(typed.error_category(), ErrorCategory::Unknown);

        let opaque = recorder.get(&opaque).expect("opaque span");
        assert_eq!(opaque.category, None);
        assert_eq!(opaque.error_category(), ErrorCategory::NotFound);
    }

    #[test]
    fn finishing_unknown_span_is_ignored() {
        let recorder = SpanRecorder::new();
        recorder.complete("does-not-exist");
        assert!(recorder.is_empty());
    }

    #[test]
    fn span_json_uses_lowercase_status_and_skips_empty_fields() {
        let span = Span::new("main", 0);
        let value = serde_json::to_value(&span).expect("serialize");

        assert_eq!(value["status"], "running");
        assert!(value.get("error").is_none());
        assert!(value.get("duration_ms").is_none());
        assert!(value.get("category").is_none());

        let decoded: Span = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, span);
    }
}
