//! Guarded execution of root and nested pipelines.
//!
//! [`NestedExecutor`] is the glue between a host's [`PipelineRunner`] and the
//! safety components: every nested invocation is checked by the recursion
//! guard, gets its own child context, is recorded as a span and has its
//! outputs extracted. Failures come back as [`InvocationFailure`], which
//! carries both the typed error and the formatted report.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, LimitsConfig};
use crate::context::{ExecutionContext, ResultMap};
use crate::error::NestingError;
use crate::guard;
use crate::nested::{create_nested_context, InvocationSpec};
use crate::outputs::extract_outputs;
use crate::report::{format_execution_error, format_nesting_error, format_timeout_error};
use crate::span::SpanRecorder;

/// Executes the steps of one pipeline against `ctx`.
///
/// Implementations call [`NestedExecutor::invoke`] (passing `ctx` as the
/// parent) for steps that run another pipeline, and
/// [`NestedExecutor::record_step`] for every finished step.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, executor: &NestedExecutor, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()>;
}

/// A failed invocation. Displays as the formatted report.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct InvocationFailure {
    pub error: NestingError,
    pub report: String,
}

impl InvocationFailure {
    fn new(error: NestingError, ctx: &ExecutionContext<'_>) -> Self {
        let report = format_nesting_error(&error, ctx);
        Self { error, report }
    }
}

type MemoryProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Clone)]
pub struct NestedExecutor {
    limits: LimitsConfig,
    recorder: SpanRecorder,
    memory_probe: Option<MemoryProbe>,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for NestedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedExecutor")
            .field("limits", &self.limits)
            .field("spans", &self.recorder.len())
            .field("memory_probe", &self.memory_probe.is_some())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl NestedExecutor {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits: limits.clamped(),
            recorder: SpanRecorder::new(),
            memory_probe: None,
            cancel: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.limits)
    }

    /// Share an existing recorder, e.g. one owned by the host.
    pub fn with_recorder(mut self, recorder: SpanRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Sample current memory usage in MB before each nested invocation.
    pub fn with_memory_probe(mut self, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.memory_probe = Some(Arc::new(probe));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn recorder(&self) -> &SpanRecorder {
        &self.recorder
    }

    /// Run a root pipeline inside its own span.
    pub async fn run_root(
        &self,
        runner: &dyn PipelineRunner,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), InvocationFailure> {
        let span_id = self.recorder.start_pipeline(ctx, None);
        ctx.span_id = Some(span_id.clone());
        info!(pipeline_id = %ctx.pipeline_id, span_id = %span_id, "Running root pipeline");

        let failure = match self.cancellable(runner.run(self, ctx)).await {
            Some(Ok(())) => {
                self.recorder.complete(&span_id);
                info!(
                    pipeline_id = %ctx.pipeline_id,
                    steps = ctx.step_count,
                    "Root pipeline completed"
                );
                return Ok(());
            }
            Some(Err(err)) => self.failure_from_child(err, ctx),
            None => InvocationFailure::new(
                NestingError::Cancelled {
                    pipeline_id: ctx.pipeline_id.clone(),
                },
                ctx,
            ),
        };

        self.recorder
            .fail_with(&span_id, failure.error.to_string(), failure.error.category());
        warn!(
            pipeline_id = %ctx.pipeline_id,
            category = failure.error.category().as_str(),
            "Root pipeline failed"
        );
        Err(failure)
    }

    /// Run the nested pipeline described by `spec` as a child of `parent` and
    /// return its extracted outputs.
    pub async fn invoke<'a>(
        &self,
        runner: &dyn PipelineRunner,
        parent: &'a ExecutionContext<'a>,
        spec: &InvocationSpec,
    ) -> Result<ResultMap, InvocationFailure> {
        let limits = self.limits.apply_overrides(spec.limits.as_ref());

        let mut child = create_nested_context(parent, spec, &limits)
            .map_err(|err| self.rejected(err, parent, spec))?;
        guard::check_step_budget(parent, limits.max_total_steps)
            .map_err(|err| self.rejected(err, parent, spec))?;
        if let Some(probe) = &self.memory_probe {
            guard::check_memory(probe(), limits.max_memory_mb)
                .map_err(|err| self.rejected(err, parent, spec))?;
        }

        let ctx = &mut child.context;
        let span_id = self.recorder.start_pipeline(ctx, parent.span_id.as_deref());
        ctx.span_id = Some(span_id.clone());
        info!(
            parent = %parent.pipeline_id,
            pipeline_id = %ctx.pipeline_id,
            step = spec.display_step_name(),
            depth = ctx.nesting_depth,
            span_id = %span_id,
            "Invoking nested pipeline"
        );

        let started = Instant::now();
        let timeout = spec.timeout_seconds.map(Duration::from_secs);
        let run = runner.run(self, ctx);
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let failure = match self.cancellable(bounded).await {
            Some(Some(Ok(()))) => match extract_outputs(&ctx.results, spec.outputs.as_deref()) {
                Ok(outputs) => {
                    self.recorder.complete(&span_id);
                    debug!(
                        pipeline_id = %ctx.pipeline_id,
                        outputs = outputs.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Nested pipeline completed"
                    );
                    return Ok(outputs);
                }
                Err(err) => InvocationFailure::new(err.into(), ctx),
            },
            Some(Some(Err(err))) => self.failure_from_child(err, ctx),
            Some(None) => {
                let limit_seconds = spec.timeout_seconds.unwrap_or_default();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                InvocationFailure {
                    error: NestingError::Timeout {
                        pipeline_id: ctx.pipeline_id.clone(),
                        limit_seconds,
                        elapsed_ms,
                    },
                    report: format_timeout_error(limit_seconds, ctx, elapsed_ms),
                }
            }
            None => InvocationFailure::new(
                NestingError::Cancelled {
                    pipeline_id: ctx.pipeline_id.clone(),
                },
                ctx,
            ),
        };

        self.recorder
            .fail_with(&span_id, failure.error.to_string(), failure.error.category());
        warn!(
            pipeline_id = %ctx.pipeline_id,
            depth = ctx.nesting_depth,
            category = failure.error.category().as_str(),
            "Nested pipeline failed"
        );
        Err(failure)
    }

    /// Run sibling invocations concurrently. Each sibling gets its own child
    /// context; results come back in `specs` order.
    pub async fn invoke_parallel<'a>(
        &self,
        runner: &dyn PipelineRunner,
        parent: &'a ExecutionContext<'a>,
        specs: &[InvocationSpec],
    ) -> Vec<Result<ResultMap, InvocationFailure>> {
        debug!(
            parent = %parent.pipeline_id,
            siblings = specs.len(),
            "Invoking nested pipelines in parallel"
        );
        join_all(specs.iter().map(|spec| self.invoke(runner, parent, spec))).await
    }

    /// Record a finished step on `ctx` and enforce the step budget across the
    /// whole chain. A step that pushes the total over the limit is still
    /// recorded, and its span is marked failed.
    pub fn record_step(
        &self,
        ctx: &mut ExecutionContext<'_>,
        step_name: &str,
        step_type: Option<&str>,
        value: Value,
    ) -> Result<(), NestingError> {
        ctx.begin_step(step_name);
        let span_id = self.recorder.start_step(ctx, step_name, step_type);
        ctx.record_step(step_name, value);

        match guard::check_step_budget(ctx, self.limits.max_total_steps) {
            Ok(()) => {
                self.recorder.complete(&span_id);
                Ok(())
            }
            Err(err) => {
                self.recorder
                    .fail_with(&span_id, err.to_string(), err.category());
                Err(err)
            }
        }
    }

    /// `None` when the host's token fires first.
    async fn cancellable<F: Future>(&self, run: F) -> Option<F::Output> {
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = run => Some(output),
            },
            None => Some(run.await),
        }
    }

    fn rejected(&self, error: NestingError, parent: &ExecutionContext<'_>, spec: &InvocationSpec) -> InvocationFailure {
        warn!(
            parent = %parent.pipeline_id,
            pipeline_id = %spec.pipeline,
            depth = parent.nesting_depth,
            category = error.category().as_str(),
            "Nested invocation rejected"
        );
        InvocationFailure::new(error, parent)
    }

    /// A failure already reported by a deeper invocation is passed up as is,
    /// since its report carries the longest chain. Guard errors raised by the
    /// runner keep their variant.
    fn failure_from_child(&self, err: anyhow::Error, ctx: &ExecutionContext<'_>) -> InvocationFailure {
        let err = match err.downcast::<InvocationFailure>() {
            Ok(inner) => return inner,
            Err(err) => err,
        };
        match err.downcast::<NestingError>() {
            Ok(error) => InvocationFailure::new(error, ctx),
            Err(err) => {
                let message = format!("{err:#}");
                let report = format_execution_error(&message, ctx).message;
                InvocationFailure {
                    error: NestingError::ExecutionFailure {
                        pipeline_id: ctx.pipeline_id.clone(),
                        message,
                    },
                    report,
                }
            }
        }
    }
}
