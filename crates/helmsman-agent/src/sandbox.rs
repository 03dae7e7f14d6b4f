//! Code sandbox seam.
//!
//! The runtime consumes a sandbox for model-generated code; it never
//! executes code in-process. The sandbox restricts the ambient library
//! set and has no filesystem or network egress beyond its allow-list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default execution bounds for model-generated code.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub timeout_secs: u64,
    pub max_memory_mb: u64,
}

impl ExecutionRequest {
    pub fn new(code: &str, language: &str) -> Self {
        Self {
            code: code.to_string(),
            language: language.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time: f64,
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome;
}
