//! Typed errors shared across the workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A generated plan failed structural validation (missing dependency,
    /// cycle, or no entry point).
    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    /// The LLM returned something we could not parse into the expected
    /// structure.
    #[error("failed to parse model output: {0}")]
    Parse(String),

    #[error("filesystem error at '{path}': {message}")]
    Fs { path: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn fs(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Fs {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
