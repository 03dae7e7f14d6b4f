//! Built-in tools: the unconditional core set.
//!
//! read_file and write_file go through the workspace filesystem seam,
//! run_code through the configured sandbox, and exit short-circuits the
//! loop via its result metadata.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use helmsman_core::WorkspaceFs;

use crate::sandbox::{CodeSandbox, ExecutionRequest, ExecutionStatus};

use super::{Tool, ToolRegistry, ToolResult};

pub struct ReadFileTool {
    fs: Arc<dyn WorkspaceFs>,
}

impl ReadFileTool {
    pub fn new(fs: Arc<dyn WorkspaceFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Args: {\"path\": string}"
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::failed("read_file", "invalid params: 'path' is required"),
        };
        match self.fs.read(path) {
            Ok(content) => ToolResult::ok("read_file", content),
            Err(e) => ToolResult::failed("read_file", format!("not found: {}", e)),
        }
    }
}

pub struct WriteFileTool {
    fs: Arc<dyn WorkspaceFs>,
}

impl WriteFileTool {
    pub fn new(fs: Arc<dyn WorkspaceFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file into the workspace. Args: {\"path\": string, \"content\": string}"
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::failed("write_file", "invalid params: 'path' is required"),
        };
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        match self.fs.write(path, content) {
            Ok(()) => ToolResult::ok("write_file", format!("wrote {} bytes to {}", content.len(), path)),
            Err(e) => ToolResult::failed("write_file", e.to_string()),
        }
    }
}

pub struct RunCodeTool {
    sandbox: Option<Arc<dyn CodeSandbox>>,
}

impl RunCodeTool {
    pub fn new(sandbox: Option<Arc<dyn CodeSandbox>>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute self-contained code in the sandbox. Args: {\"code\": string, \"language\": string?}"
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let sandbox = match &self.sandbox {
            Some(s) => s,
            None => return ToolResult::failed("run_code", "no code sandbox is configured"),
        };
        let code = match args.get("code").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::failed("run_code", "invalid params: 'code' is required"),
        };
        let language = args
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("python");

        let outcome = sandbox
            .execute(ExecutionRequest::new(code, language))
            .await;
        match outcome.status {
            ExecutionStatus::Success => {
                ToolResult::ok("run_code", outcome.output.unwrap_or_default())
            }
            ExecutionStatus::Timeout => ToolResult::failed("run_code", "sandbox execution timeout"),
            ExecutionStatus::Error => ToolResult::failed(
                "run_code",
                outcome.error.unwrap_or_else(|| "sandbox error".into()),
            ),
        }
    }
}

/// Exit tool: carries the requested exit code in its result metadata so
/// the engine can short-circuit the loop.
pub struct ExitTool;

#[async_trait]
impl Tool for ExitTool {
    fn name(&self) -> &str {
        "exit"
    }

    fn description(&self) -> &str {
        "Finish the session. Args: {\"exit_code\": int, \"message\": string?}"
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let exit_code = args.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(0);
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("session finished");
        ToolResult::ok("exit", message)
            .with_metadata(json!({ "exit_context": { "exit_code": exit_code } }))
    }
}

/// Register the core tool set.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    fs: Arc<dyn WorkspaceFs>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
) {
    registry.register(Arc::new(ReadFileTool::new(fs.clone())));
    registry.register(Arc::new(WriteFileTool::new(fs)));
    registry.register(Arc::new(RunCodeTool::new(sandbox)));
    registry.register(Arc::new(ExitTool));
}
