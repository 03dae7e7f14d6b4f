//! Tool-call parsing and execution.
//!
//! The wire format is fenced blocks in the assistant text:
//!
//! ````text
//! ```tool_call
//! {"tool": "web_search", "args": {"query": "rust"}}
//! ```
//! ````
//!
//! and a final answer as a ```final_answer fence. Parsing is
//! deterministic and idempotent; results are rendered as ```tool_result
//! fences, which the parser does not re-extract.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures_util::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::{ToolCall, ToolRegistry, ToolResult};

lazy_static! {
    static ref TOOL_CALL_RE: Regex =
        Regex::new(r"(?s)```tool_call\s*\n(.*?)```").expect("static regex");
    static ref FINAL_ANSWER_RE: Regex =
        Regex::new(r"(?s)```final_answer\s*\n(.*?)```").expect("static regex");
}

pub struct ToolCallExecutor {
    registry: Arc<RwLock<ToolRegistry>>,
}

impl ToolCallExecutor {
    pub fn new(registry: Arc<RwLock<ToolRegistry>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.registry
    }

    /// Extract structured tool calls from the assistant reply. Ids are
    /// positional, so parsing the same text twice yields the same calls.
    pub fn parse_tool_calls(&self, text: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        for (idx, cap) in TOOL_CALL_RE.captures_iter(text).enumerate() {
            let raw = cap[1].trim();
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    let tool_name = value
                        .get("tool")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if tool_name.is_empty() {
                        tracing::warn!("tool_call block without a tool name, skipping");
                        continue;
                    }
                    let parameters = value.get("args").cloned().unwrap_or_else(|| json!({}));
                    calls.push(ToolCall {
                        id: format!("call_{}", idx),
                        tool_name,
                        parameters,
                    });
                }
                Err(e) => {
                    tracing::warn!("unparseable tool_call block: {}", e);
                }
            }
        }
        calls
    }

    pub fn has_tool_calls(&self, text: &str) -> bool {
        !self.parse_tool_calls(text).is_empty()
    }

    pub fn has_final_answer(&self, text: &str) -> bool {
        FINAL_ANSWER_RE.is_match(text)
    }

    pub fn extract_answer(&self, text: &str) -> Option<String> {
        FINAL_ANSWER_RE
            .captures(text)
            .map(|cap| cap[1].trim().to_string())
    }

    /// Free text before the first fence, if any.
    pub fn extract_reasoning(&self, text: &str) -> Option<String> {
        let cut = text.find("```").unwrap_or(text.len());
        let reasoning = text[..cut].trim();
        if reasoning.is_empty() {
            None
        } else {
            Some(reasoning.to_string())
        }
    }

    /// Execute all calls, independent calls in parallel, preserving call
    /// order in the result list. A disallowed tool yields a failed
    /// result; the call itself never errors.
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let resolved: Vec<(ToolCall, Result<Arc<dyn super::Tool>, ToolResult>)> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            calls
                .iter()
                .map(|call| {
                    let outcome = if !registry.is_allowed(&call.tool_name) {
                        Err(ToolResult::failed(
                            &call.tool_name,
                            format!(
                                "permission denied: tool '{}' is outside the active allow-list",
                                call.tool_name
                            ),
                        ))
                    } else {
                        match registry.get(&call.tool_name) {
                            Some(tool) => Ok(tool),
                            None => Err(ToolResult::failed(
                                &call.tool_name,
                                format!("tool '{}' not found", call.tool_name),
                            )),
                        }
                    };
                    (call.clone(), outcome)
                })
                .collect()
        };

        let futures = resolved.into_iter().map(|(call, outcome)| async move {
            match outcome {
                Err(result) => result,
                Ok(tool) => {
                    let started = Instant::now();
                    let mut result = tool.execute(call.parameters.clone()).await;
                    result.tool_name = call.tool_name.clone();
                    result.execution_time = Some(started.elapsed().as_secs_f64());
                    result
                }
            }
        });

        join_all(futures).await
    }

    /// Render results as ```tool_result fences for the context. The
    /// parser does not extract these, so formatting then parsing is a
    /// no-op.
    pub fn format_tool_results(&self, results: &[ToolResult]) -> String {
        let mut parts = vec!["Tool results:".to_string()];
        for result in results {
            let body = json!({
                "tool": result.tool_name,
                "success": result.success,
                "output": if result.success { Some(result.output.as_str()) } else { None },
                "error": result.error,
            });
            parts.push(format!("```tool_result\n{}\n```", body));
        }
        parts.join("\n")
    }

    /// Exit-tool short circuit: the exit code carried in the result
    /// metadata, if an exit call was made.
    pub fn check_exit_code(calls: &[ToolCall], results: &[ToolResult]) -> Option<i32> {
        for (call, result) in calls.iter().zip(results.iter()) {
            if call.tool_name == "exit" {
                let code = result
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("exit_context"))
                    .and_then(|c| c.get("exit_code"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                return Some(code as i32);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok("echo", args.to_string())
        }
    }

    fn executor() -> ToolCallExecutor {
        let mut registry = ToolRegistry::new(true);
        registry.register(Arc::new(Echo));
        ToolCallExecutor::new(Arc::new(RwLock::new(registry)))
    }

    #[test]
    fn test_parse_tool_calls() {
        let executor = executor();
        let text = "Let me search.\n```tool_call\n{\"tool\": \"echo\", \"args\": {\"q\": 1}}\n```\nand\n```tool_call\n{\"tool\": \"echo\", \"args\": {}}\n```";
        let calls = executor.parse_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "echo");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].parameters["q"], 1);
        assert_eq!(calls[1].id, "call_1");
    }

    #[test]
    fn test_parse_is_deterministic_and_skips_garbage() {
        let executor = executor();
        let text = "```tool_call\nnot json\n```\n```tool_call\n{\"tool\": \"echo\"}\n```";
        let first = executor.parse_tool_calls(text);
        let second = executor.parse_tool_calls(text);
        assert_eq!(first.len(), 1);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_final_answer_extraction() {
        let executor = executor();
        let text = "I checked everything.\n```final_answer\n4\n```";
        assert!(executor.has_final_answer(text));
        assert_eq!(executor.extract_answer(text).as_deref(), Some("4"));
        assert_eq!(
            executor.extract_reasoning(text).as_deref(),
            Some("I checked everything.")
        );
    }

    #[test]
    fn test_formatted_results_do_not_reparse() {
        let executor = executor();
        let results = vec![ToolResult::ok("echo", "hi"), ToolResult::failed("echo", "no")];
        let formatted = executor.format_tool_results(&results);
        assert!(executor.parse_tool_calls(&formatted).is_empty());
        assert!(formatted.contains("tool_result"));
    }

    #[tokio::test]
    async fn test_execute_all_order_and_unknown_tool() {
        let executor = executor();
        let calls = vec![
            ToolCall {
                id: "call_0".into(),
                tool_name: "echo".into(),
                parameters: json!({"a": 1}),
            },
            ToolCall {
                id: "call_1".into(),
                tool_name: "missing".into(),
                parameters: json!({}),
            },
        ];
        let results = executor.execute_all(&calls).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(results[0].execution_time.is_some());
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_disallowed_tool_refused_with_permission_error() {
        let executor = executor();
        executor
            .registry()
            .write()
            .unwrap()
            .set_allowed_tools(&["other".to_string()]);
        let calls = vec![ToolCall {
            id: "call_0".into(),
            tool_name: "echo".into(),
            parameters: json!({}),
        }];
        let results = executor.execute_all(&calls).await;
        assert!(!results[0].success);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("permission denied"));
    }

    #[test]
    fn test_check_exit_code() {
        let calls = vec![ToolCall {
            id: "call_0".into(),
            tool_name: "exit".into(),
            parameters: json!({"exit_code": 3}),
        }];
        let results = vec![ToolResult::ok("exit", "bye")
            .with_metadata(json!({"exit_context": {"exit_code": 3}}))];
        assert_eq!(ToolCallExecutor::check_exit_code(&calls, &results), Some(3));
        assert_eq!(ToolCallExecutor::check_exit_code(&[], &[]), None);
    }
}
