//! Error types for neval.

use thiserror::Error;

use crate::eval::EvalError;

/// Main error type for neval.
///
/// Per-path evaluation errors never surface here; the worker converts them
/// to result lines and keeps serving. Everything in this enum is fatal to
/// the run.
#[derive(Error, Debug)]
pub enum NevalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Eval(#[from] EvalError),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("evaluation interrupted")]
    Interrupted,
}

/// Result type alias for neval operations.
pub type Result<T> = std::result::Result<T, NevalError>;
