//! Tools: named async callables, allow-list pruning, call parsing and
//! execution.
//!
//! Sub-modules:
//!   - `registry` — name → callable map with action-space pruning
//!   - `executor` — assistant-text parsing + parallel dispatch
//!   - `builtin`  — read_file / write_file / run_code / exit

mod builtin;
mod executor;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use builtin::{register_builtin_tools, ExitTool, ReadFileTool, RunCodeTool, WriteFileTool};
pub use executor::ToolCallExecutor;
pub use registry::{ToolRegistry, CORE_TOOL_NAMES};

/// A named invocation parsed from the assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub parameters: Value,
}

/// Outcome of one tool invocation. Exactly one result per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

impl ToolResult {
    pub fn ok(tool_name: &str, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            output: output.into(),
            error: None,
            metadata: None,
            execution_time: None,
        }
    }

    pub fn failed(tool_name: &str, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            metadata: None,
            execution_time: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A tool the model can call. Implementations are external; the runtime
/// references them by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, args: Value) -> ToolResult;
}
