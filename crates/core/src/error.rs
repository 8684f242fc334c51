use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single nested invocation, produced directly by the component
/// that detected it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NestingError {
    #[error("maximum nesting depth exceeded: depth {current} > limit {limit}")]
    DepthExceeded { current: u32, limit: u32 },

    #[error("circular dependency detected: {}", chain.join(" → "))]
    CircularDependency { chain: Vec<String> },

    #[error("step budget exceeded: {total} steps > limit {limit}")]
    StepBudgetExceeded { total: u64, limit: u64 },

    #[error("memory limit exceeded: {current_mb}MB > limit {limit_mb}MB")]
    MemoryExceeded { current_mb: u64, limit_mb: u64 },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("nested pipeline '{pipeline_id}' timed out after {elapsed_ms}ms (limit {limit_seconds}s)")]
    Timeout {
        pipeline_id: String,
        limit_seconds: u64,
        elapsed_ms: u64,
    },

    #[error("nested pipeline '{pipeline_id}' was cancelled")]
    Cancelled { pipeline_id: String },

    #[error("nested pipeline '{pipeline_id}' failed: {message}")]
    ExecutionFailure { pipeline_id: String, message: String },
}

impl NestingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DepthExceeded { .. }
            | Self::StepBudgetExceeded { .. }
            | Self::MemoryExceeded { .. } => ErrorCategory::ResourceLimit,
            Self::CircularDependency { .. } => ErrorCategory::CircularDependency,
            Self::Extraction(_) => ErrorCategory::NotFound,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            // Child failures are opaque, so their text is all we have.
            Self::ExecutionFailure { message, .. } => ErrorCategory::classify(message),
        }
    }
}

/// A child result set did not satisfy the parent's output contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("output key '{key}' not found in nested pipeline results")]
    MissingKey { key: String },

    #[error("output path '{path}' could not be resolved in nested pipeline results")]
    MissingPath { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("comparison requires at least 2 executions, got {actual}")]
    InsufficientExecutions { actual: usize },
}

/// Coarse failure classification used when only the error text is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    CircularDependency,
    ResourceLimit,
    NotFound,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        Self::Timeout,
        Self::CircularDependency,
        Self::ResourceLimit,
        Self::NotFound,
        Self::Cancelled,
        Self::Unknown,
    ];

    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("cancelled") || lower.contains("canceled") {
            Self::Cancelled
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("circular") || lower.contains("cycle") {
            Self::CircularDependency
        } else if lower.contains("limit exceeded")
            || lower.contains("budget exceeded")
            || lower.contains("depth exceeded")
            || lower.contains("memory")
        {
            Self::ResourceLimit
        } else if lower.contains("not found") || lower.contains("missing") {
            Self::NotFound
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::CircularDependency => "circular_dependency",
            Self::ResourceLimit => "resource_limit",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}
