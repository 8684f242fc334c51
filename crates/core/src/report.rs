//! Human-readable failure reports for nested pipeline execution.
//!
//! Every report is built around the execution chain so a reader can see which
//! nested pipeline, at which depth, failed. Output is deterministic for a
//! given reference time; the plain functions use the current time.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{ErrorCategory, NestingError};
use crate::guard;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Depth,
    Steps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    /// Root-first pipeline ids.
    pub chain: Vec<String>,
    pub debug_info: DebugInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub pipeline_id: String,
    pub step_name: Option<String>,
    pub nesting_depth: u32,
    pub total_steps: u64,
    pub elapsed_ms: u64,
    pub step_index: Option<usize>,
    pub category: ErrorCategory,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

pub fn format_execution_error(error: &dyn std::fmt::Display, ctx: &ExecutionContext<'_>) -> ErrorReport {
    format_execution_error_at(error, ctx, Utc::now())
}

/// The category in the report is classified from the error text; use
/// [`nesting_error_report_at`] when the failure is a typed [`NestingError`].
pub fn format_execution_error_at(
    error: &dyn std::fmt::Display,
    ctx: &ExecutionContext<'_>,
    now: DateTime<Utc>,
) -> ErrorReport {
    let error_text = error.to_string();
    let category = ErrorCategory::classify(&error_text);
    build_execution_report(error_text, category, ctx, now)
}

/// Execution report for a typed failure, categorized by its variant.
pub fn nesting_error_report_at(
    error: &NestingError,
    ctx: &ExecutionContext<'_>,
    now: DateTime<Utc>,
) -> ErrorReport {
    build_execution_report(error.to_string(), error.category(), ctx, now)
}

fn build_execution_report(
    error_text: String,
    category: ErrorCategory,
    ctx: &ExecutionContext<'_>,
    now: DateTime<Utc>,
) -> ErrorReport {
    let chain = guard::display_chain(ctx);
    let total_steps = guard::count_total_steps(ctx);
    let elapsed_ms = ctx.elapsed_ms_at(now);

    let mut message = String::new();
    message.push_str("Pipeline execution failed in nested pipeline\n\n");
    push_hierarchy(&mut message, &chain);
    let _ = writeln!(message, "\nError: {error_text}\n");

    message.push_str("Context:\n");
    let _ = writeln!(message, "  Pipeline: {}", display_or_unknown(&ctx.pipeline_id));
    let _ = writeln!(
        message,
        "  Step: {}",
        ctx.current_step.as_deref().unwrap_or(UNKNOWN)
    );
    let _ = writeln!(message, "  Nesting depth: {}", ctx.nesting_depth);
    let _ = writeln!(message, "  Total steps executed: {total_steps}");
    let _ = writeln!(message, "  Elapsed: {elapsed_ms}ms");
    let _ = writeln!(
        message,
        "  Step index: {}",
        ctx.step_index
            .map(|i| i.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    );

    message.push_str("\nExecution stack:\n");
    for (position, ancestor) in ctx.ancestors().collect::<Vec<_>>().iter().rev().enumerate() {
        let _ = writeln!(
            message,
            "  {}. {} (depth: {})",
            position + 1,
            display_or_unknown(&ancestor.pipeline_id),
            ancestor.nesting_depth
        );
    }

    ErrorReport {
        message,
        chain,
        debug_info: DebugInfo {
            pipeline_id: ctx.pipeline_id.clone(),
            step_name: ctx.current_step.clone(),
            nesting_depth: ctx.nesting_depth,
            total_steps,
            elapsed_ms,
            step_index: ctx.step_index,
            category,
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
        },
    }
}

pub fn format_timeout_error(limit_seconds: u64, ctx: &ExecutionContext<'_>, elapsed_ms: u64) -> String {
    let actual_seconds = elapsed_ms as f64 / 1000.0;
    let overage = (actual_seconds - limit_seconds as f64).max(0.0);

    let mut message = String::new();
    let _ = writeln!(
        message,
        "Nested pipeline '{}' timed out\n",
        display_or_unknown(&ctx.pipeline_id)
    );
    let _ = writeln!(message, "Limit: {limit_seconds}s");
    let _ = writeln!(message, "Actual: {actual_seconds:.1}s");
    let _ = writeln!(message, "Exceeded by: {overage:.1}s\n");
    push_hierarchy(&mut message, &guard::display_chain(ctx));
    message.push_str("\nConsider raising timeout_seconds for this step or splitting the nested pipeline.\n");
    message
}

pub fn format_circular_dependency_error(cycle_chain: &[String], ctx: &ExecutionContext<'_>) -> String {
    let entering = cycle_chain
        .last()
        .map(String::as_str)
        .unwrap_or(UNKNOWN);

    let mut message = String::new();
    message.push_str("Circular dependency detected\n\n");
    let _ = writeln!(message, "Cycle: {}", cycle_chain.join(" → "));
    let _ = writeln!(message, "Entering pipeline: {entering}");
    let _ = writeln!(
        message,
        "Detected in: {} (depth: {})\n",
        display_or_unknown(&ctx.pipeline_id),
        ctx.nesting_depth
    );
    push_hierarchy(&mut message, &guard::display_chain(ctx));
    message.push_str("\nTo resolve:\n");
    message.push_str("  1. Inspect the dependency chain listed above\n");
    message.push_str("  2. Break the cycle by removing or restructuring one of the pipeline references\n");
    message.push_str("  3. Verify the pipeline reference configuration (pipeline ids and file paths)\n");
    message
}

pub fn format_resource_limit_error(
    kind: ResourceKind,
    current: u64,
    limit: u64,
    ctx: &ExecutionContext<'_>,
) -> String {
    let (violation, suggestions): (String, [&str; 3]) = match kind {
        ResourceKind::Memory => (
            format!("Memory limit exceeded: {current}MB used, limit is {limit}MB"),
            [
                "Process data in smaller batches",
                "Reduce the size of results passed between nested pipelines",
                "Raise max_memory_mb in the limits configuration",
            ],
        ),
        ResourceKind::Depth => (
            format!("Maximum nesting depth exceeded: depth {current}, limit is {limit}"),
            [
                "Reduce the number of nested pipeline levels",
                "Flatten the pipeline structure by inlining small sub-pipelines",
                "Raise max_depth in the limits configuration",
            ],
        ),
        ResourceKind::Steps => (
            format!("Step budget exceeded: {current} steps executed, limit is {limit}"),
            [
                "Reduce the number of steps in the nested pipelines",
                "Check for unintended loops or repeated nested invocations",
                "Raise max_total_steps in the limits configuration",
            ],
        ),
    };

    let mut message = String::new();
    let _ = writeln!(message, "{violation}\n");
    push_hierarchy(&mut message, &guard::display_chain(ctx));
    message.push_str("\nSuggestions:\n");
    for suggestion in suggestions {
        let _ = writeln!(message, "  - {suggestion}");
    }
    message
}

/// Render any [`NestingError`] with the formatter matching its variant.
pub fn format_nesting_error(error: &NestingError, ctx: &ExecutionContext<'_>) -> String {
    format_nesting_error_at(error, ctx, Utc::now())
}

pub fn format_nesting_error_at(
    error: &NestingError,
    ctx: &ExecutionContext<'_>,
    now: DateTime<Utc>,
) -> String {
    match error {
        NestingError::CircularDependency { chain } => format_circular_dependency_error(chain, ctx),
        NestingError::DepthExceeded { current, limit } => {
            format_resource_limit_error(ResourceKind::Depth, u64::from(*current), u64::from(*limit), ctx)
        }
        NestingError::StepBudgetExceeded { total, limit } => {
            format_resource_limit_error(ResourceKind::Steps, *total, *limit, ctx)
        }
        NestingError::MemoryExceeded {
            current_mb,
            limit_mb,
        } => format_resource_limit_error(ResourceKind::Memory, *current_mb, *limit_mb, ctx),
        NestingError::Timeout {
            limit_seconds,
            elapsed_ms,
            ..
        } => format_timeout_error(*limit_seconds, ctx, *elapsed_ms),
        NestingError::Extraction(_)
        | NestingError::Cancelled { .. }
        | NestingError::ExecutionFailure { .. } => {
            nesting_error_report_at(error, ctx, now).message
        }
    }
}

/// Indented root-first tree of the chain.
pub fn render_hierarchy(chain: &[String]) -> String {
    let mut out = String::new();
    push_hierarchy(&mut out, chain);
    out
}

fn push_hierarchy(out: &mut String, chain: &[String]) {
    out.push_str("Execution hierarchy:\n");
    if chain.is_empty() {
        let _ = writeln!(out, "  {UNKNOWN}");
        return;
    }
    for (level, pipeline_id) in chain.iter().enumerate() {
        let pipeline_id = display_or_unknown(pipeline_id);
        if level == 0 {
            let _ = writeln!(out, "  {pipeline_id}");
        } else {
            let indent = "   ".repeat(level - 1);
            let _ = writeln!(out, "  {indent}└─ {pipeline_id}");
        }
    }
}

fn display_or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        UNKNOWN
    } else {
        value
    }
}
