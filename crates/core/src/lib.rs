//! Core crate for nested pipeline execution: recursion guarding, child
//! contexts, failure reports, span tracing and trace analysis.

pub mod analyzer;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod guard;
pub mod logging;
pub mod nested;
pub mod outputs;
pub mod path;
pub mod render;
pub mod report;
pub mod span;
pub mod tracer;

pub use context::{ExecutionContext, ResultMap};
pub use error::{AnalysisError, ErrorCategory, ExtractionError, NestingError};
pub use executor::{InvocationFailure, NestedExecutor, PipelineRunner};
pub use nested::InvocationSpec;
pub use outputs::OutputSpec;
