//! Recursion and resource guarding for nested pipeline invocations.
//!
//! Everything here is a pure function of an [`ExecutionContext`] snapshot.
//! Accounting walks the ancestor chain instead of sharing counters, so
//! concurrently running siblings never contend on anything.

use tracing::error;

use crate::config::{LimitsConfig, HARD_LIMITS};
use crate::context::ExecutionContext;
use crate::error::NestingError;

/// Pipeline ids from `ctx` up to the root, current first.
pub fn build_execution_chain(ctx: &ExecutionContext<'_>) -> Vec<String> {
    let max_links = HARD_LIMITS.max_depth as usize + 1;
    let mut chain = Vec::with_capacity(ctx.nesting_depth as usize + 1);
    let mut expected_depth = Some(ctx.nesting_depth);

    for ancestor in ctx.ancestors() {
        if chain.len() >= max_links {
            error!(
                pipeline_id = %ctx.pipeline_id,
                links = chain.len(),
                "Execution chain longer than the hard depth ceiling; truncating walk"
            );
            break;
        }
        if expected_depth != Some(ancestor.nesting_depth) {
            error!(
                pipeline_id = %ancestor.pipeline_id,
                depth = ancestor.nesting_depth,
                expected = ?expected_depth,
                "Execution chain depth is not contiguous"
            );
        }
        expected_depth = ancestor.nesting_depth.checked_sub(1);
        chain.push(ancestor.pipeline_id.clone());
    }

    chain
}

/// Root-first view of [`build_execution_chain`], used for display.
pub fn display_chain(ctx: &ExecutionContext<'_>) -> Vec<String> {
    let mut chain = build_execution_chain(ctx);
    chain.reverse();
    chain
}

pub fn count_total_steps(ctx: &ExecutionContext<'_>) -> u64 {
    ctx.ancestors().map(|c| c.step_count).sum()
}

pub fn check_depth(ctx: &ExecutionContext<'_>, max_depth: u32) -> Result<(), NestingError> {
    let next_depth = ctx.nesting_depth + 1;
    if next_depth > max_depth {
        return Err(NestingError::DepthExceeded {
            current: next_depth,
            limit: max_depth,
        });
    }
    Ok(())
}

pub fn check_cycle(ctx: &ExecutionContext<'_>, candidate: &str) -> Result<(), NestingError> {
    if !ctx.ancestors().any(|c| c.pipeline_id == candidate) {
        return Ok(());
    }

    let mut chain = display_chain(ctx);
    chain.push(candidate.to_string());
    Err(NestingError::CircularDependency { chain })
}

pub fn check_step_budget(ctx: &ExecutionContext<'_>, limit: u64) -> Result<(), NestingError> {
    let total = count_total_steps(ctx);
    if total > limit {
        return Err(NestingError::StepBudgetExceeded { total, limit });
    }
    Ok(())
}

/// Evaluate a pre-measured memory sample against the ceiling.
pub fn check_memory(current_mb: u64, limit_mb: u64) -> Result<(), NestingError> {
    if current_mb > limit_mb {
        return Err(NestingError::MemoryExceeded {
            current_mb,
            limit_mb,
        });
    }
    Ok(())
}

/// All checks, short-circuiting in the order cycle → depth → steps → memory.
/// The memory check is skipped when no sample is available.
pub fn check_invocation(
    ctx: &ExecutionContext<'_>,
    candidate: &str,
    limits: &LimitsConfig,
    memory_mb: Option<u64>,
) -> Result<(), NestingError> {
    check_cycle(ctx, candidate)?;
    check_depth(ctx, limits.max_depth)?;
    check_step_budget(ctx, limits.max_total_steps)?;
    if let Some(current_mb) = memory_mb {
        check_memory(current_mb, limits.max_memory_mb)?;
    }
    Ok(())
}
