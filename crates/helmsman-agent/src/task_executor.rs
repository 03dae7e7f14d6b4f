//! Per-task inner loop.
//!
//! Runs one task as its own reason/act cycle, isolated from siblings.
//! Emits THINKING, TOOL_CALL, and TOOL_RESULT events as it goes and
//! exactly one terminal DONE. The failure observer is shared with the
//! engine, so strikes accumulate per session, not per task.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;

use helmsman_core::{FailureSignal, Message, Plan, SseEvent, Task, ValidationLevel};

use crate::failure::FailureObserver;
use crate::llm::{self, LlmClient};
use crate::prompts;
use crate::tools::ToolCallExecutor;

/// Overflow-recovery retries before the loop gives up on the LLM call.
const MAX_CONTEXT_OVERFLOW_RETRIES: usize = 3;

/// Character cap for tool messages during overflow recovery.
const OVERFLOW_RECOVERY_MAX_CHARS: usize = 3_000;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecutorConfig {
    pub max_iterations: usize,
    pub timeout_seconds: u64,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeout_seconds: 300,
        }
    }
}

/// Per-task scratch passed into the inner loop. Isolated per task; the
/// outer context manager holds the shared history.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub session_id: String,
    pub workspace_id: String,
    pub plan: Option<Plan>,
    preamble: Vec<Message>,
}

impl ExecutionContext {
    pub fn new(session_id: &str, workspace_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            plan: None,
            preamble: Vec::new(),
        }
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.preamble.push(Message::system(content));
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.preamble.push(Message::user(content));
    }

    pub fn preamble(&self) -> &[Message] {
        &self.preamble
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskRunStatus,
    pub output: String,
    pub error: Option<String>,
    pub iterations: usize,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskRunStatus::Success
    }
}

pub struct TaskExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolCallExecutor>,
    observer: Arc<Mutex<FailureObserver>>,
    config: TaskExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolCallExecutor>,
        observer: Arc<Mutex<FailureObserver>>,
        config: TaskExecutorConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            observer,
            config,
        }
    }

    /// Non-streaming variant: same loop, events discarded.
    pub async fn execute(&self, task: &Task, context: &ExecutionContext) -> TaskResult {
        let (tx, mut rx) = mpsc::channel(64);
        let run = async {
            let result = self.execute_stream(task, context, &tx).await;
            drop(tx);
            result
        };
        let drain = async {
            while rx.recv().await.is_some() {}
        };
        let (result, ()) = tokio::join!(run, drain);
        result
    }

    /// Streaming variant. Emits inner THINKING/TOOL_CALL/TOOL_RESULT
    /// events and exactly one final DONE whose payload carries
    /// `{status, output, error?}`.
    pub async fn execute_stream(
        &self,
        task: &Task,
        context: &ExecutionContext,
        events: &mpsc::Sender<SseEvent>,
    ) -> TaskResult {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.config.timeout_seconds);

        let tool_descriptions = {
            let registry = self
                .tools
                .registry()
                .read()
                .unwrap_or_else(|e| e.into_inner());
            registry.descriptions()
        };
        let system = prompts::task_system_prompt(
            &task.title,
            &task.description,
            &task.acceptance_criteria,
            &task.tools_hint,
            &tool_descriptions,
        );

        let mut messages: Vec<Message> = context.preamble().to_vec();
        messages.push(Message::user(format!(
            "Work on this task now: {}",
            task.description
        )));

        let mut iterations = 0usize;
        let mut overflow_retries = 0usize;
        let mut validation_attempts = 0u32;
        let validation_budget = task.max_retries.saturating_sub(task.retry_count);

        let result = loop {
            if started.elapsed() >= deadline {
                tracing::warn!("task {} timed out after {:?}", task.id, deadline);
                let signal = FailureSignal::timeout(None, self.config.timeout_seconds);
                self.observe(signal);
                break TaskResult {
                    status: TaskRunStatus::Timeout,
                    output: String::new(),
                    error: Some(format!(
                        "task timed out after {}s",
                        self.config.timeout_seconds
                    )),
                    iterations,
                };
            }
            if iterations >= self.config.max_iterations {
                tracing::warn!(
                    "task {} reached max inner iterations ({})",
                    task.id,
                    self.config.max_iterations
                );
                break TaskResult {
                    status: TaskRunStatus::Failed,
                    output: String::new(),
                    error: Some(format!(
                        "max iterations reached: {}",
                        self.config.max_iterations
                    )),
                    iterations,
                };
            }
            iterations += 1;

            // ── LLM call, bounded by the remaining task budget ────────
            let remaining = deadline.saturating_sub(started.elapsed());
            let response = match tokio::time::timeout(
                remaining,
                self.llm.complete(&messages, Some(&system)),
            )
            .await
            {
                Err(_) => {
                    let signal = FailureSignal::timeout(None, self.config.timeout_seconds);
                    self.observe(signal);
                    break TaskResult {
                        status: TaskRunStatus::Timeout,
                        output: String::new(),
                        error: Some(format!(
                            "task timed out after {}s",
                            self.config.timeout_seconds
                        )),
                        iterations,
                    };
                }
                Ok(Ok(response)) => {
                    overflow_retries = 0;
                    response
                }
                Ok(Err(e)) => {
                    if llm::is_context_overflow_error(&e.to_string())
                        && overflow_retries < MAX_CONTEXT_OVERFLOW_RETRIES
                    {
                        overflow_retries += 1;
                        tracing::warn!(
                            "context overflow (attempt {}/{}), truncating tool messages",
                            overflow_retries,
                            MAX_CONTEXT_OVERFLOW_RETRIES
                        );
                        llm::truncate_tool_messages(&mut messages, OVERFLOW_RECOVERY_MAX_CHARS);
                        continue;
                    }
                    let signal =
                        FailureSignal::from_tool_result("llm", false, Some(&e.to_string()), "", None);
                    self.observe(signal);
                    break TaskResult {
                        status: TaskRunStatus::Failed,
                        output: String::new(),
                        error: Some(e.to_string()),
                        iterations,
                    };
                }
            };

            if let Some(reasoning) = self.tools.extract_reasoning(&response.content) {
                let _ = events.send(SseEvent::thinking(&reasoning)).await;
            }

            let tool_calls = self.tools.parse_tool_calls(&response.content);

            // ── Final answer (or a reply with nothing actionable) ─────
            if tool_calls.is_empty() {
                let answer = self
                    .tools
                    .extract_answer(&response.content)
                    .unwrap_or_else(|| response.content.trim().to_string());

                if let Some(critique) = validate_output(task, &answer) {
                    if validation_attempts < validation_budget {
                        validation_attempts += 1;
                        tracing::info!(
                            "task {} failed validation (attempt {}), re-entering loop",
                            task.id,
                            validation_attempts
                        );
                        messages.push(Message::assistant(response.content.clone()));
                        messages.push(Message::user(format!(
                            "Your answer did not pass validation: {}. Revise it.",
                            critique
                        )));
                        continue;
                    }
                    break TaskResult {
                        status: TaskRunStatus::Failed,
                        output: answer,
                        error: Some(format!("validation failed: {}", critique)),
                        iterations,
                    };
                }

                let _ = events.send(SseEvent::content(&answer)).await;
                break TaskResult {
                    status: TaskRunStatus::Success,
                    output: answer,
                    error: None,
                    iterations,
                };
            }

            // ── Tool execution ────────────────────────────────────────
            for call in &tool_calls {
                let _ = events
                    .send(SseEvent::tool_call(&call.tool_name, &call.parameters))
                    .await;
            }
            let results = self.tools.execute_all(&tool_calls).await;

            let mut strike_signal: Option<FailureSignal> = None;
            for (call, result) in tool_calls.iter().zip(results.iter()) {
                let _ = events
                    .send(SseEvent::tool_result(
                        &result.tool_name,
                        result.success,
                        if result.success {
                            Some(result.output.as_str())
                        } else {
                            None
                        },
                        result.error.as_deref(),
                        result.execution_time,
                    ))
                    .await;

                let signal = FailureSignal::from_tool_result(
                    &call.tool_name,
                    result.success,
                    result.error.as_deref(),
                    "",
                    Some(call.parameters.clone()),
                );
                let stop = {
                    let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
                    observer.observe(signal.clone());
                    !result.success && observer.should_stop_retry(&signal)
                };
                if stop {
                    strike_signal = Some(signal);
                }
            }

            // Exit tool short-circuits the loop with its exit code.
            if let Some(code) = ToolCallExecutor::check_exit_code(&tool_calls, &results) {
                let output = results
                    .iter()
                    .find(|r| r.tool_name == "exit")
                    .map(|r| r.output.clone())
                    .unwrap_or_default();
                break if code == 0 {
                    TaskResult {
                        status: TaskRunStatus::Success,
                        output,
                        error: None,
                        iterations,
                    }
                } else {
                    TaskResult {
                        status: TaskRunStatus::Failed,
                        output,
                        error: Some(format!("exit code {}", code)),
                        iterations,
                    }
                };
            }

            messages.push(Message::assistant(response.content.clone()));
            messages.push(Message::tool(self.tools.format_tool_results(&results)));

            if let Some(signal) = strike_signal {
                break TaskResult {
                    status: TaskRunStatus::Failed,
                    output: String::new(),
                    error: Some(format!(
                        "repeated failures ({}): {}",
                        signal.kind.as_str(),
                        signal.learning()
                    )),
                    iterations,
                };
            }
        };

        let mut done = json!({
            "status": result.status.as_str(),
            "output": result.output,
        });
        if let Some(error) = &result.error {
            done["error"] = json!(error);
        }
        let _ = events.send(SseEvent::done(done)).await;
        result
    }

    fn observe(&self, signal: FailureSignal) {
        let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        observer.observe(signal);
    }
}

/// Consult the task's validation level before accepting an answer.
/// Returns a critique when the answer is not acceptable.
fn validate_output(task: &Task, output: &str) -> Option<String> {
    if output.trim().is_empty() {
        return Some("the answer is empty".into());
    }
    match task.validation_level {
        ValidationLevel::Generic => None,
        ValidationLevel::Financial => {
            if output.chars().any(|c| c.is_ascii_digit()) {
                None
            } else {
                Some("financial answers must cite at least one concrete figure".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use crate::tools::{Tool, ToolRegistry, ToolResult};
    use anyhow::Result;
    use async_trait::async_trait;
    use helmsman_core::SseEventType;
    use std::sync::RwLock;

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _: &[Message], _: Option<&str>) -> Result<LlmResponse> {
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "```final_answer\nfallback\n```".into());
            Ok(LlmResponse {
                content,
                usage: None,
            })
        }
    }

    struct FailingUrlTool;

    #[async_trait]
    impl Tool for FailingUrlTool {
        fn name(&self) -> &str {
            "read_url"
        }
        fn description(&self) -> &str {
            "reads a URL"
        }
        async fn execute(&self, _args: serde_json::Value) -> ToolResult {
            ToolResult::failed("read_url", "network connection refused")
        }
    }

    fn executor(llm: ScriptedLlm, tools: Vec<Arc<dyn Tool>>) -> TaskExecutor {
        let mut registry = ToolRegistry::new(true);
        for tool in tools {
            registry.register(tool);
        }
        TaskExecutor::new(
            Arc::new(llm),
            Arc::new(ToolCallExecutor::new(Arc::new(RwLock::new(registry)))),
            Arc::new(Mutex::new(FailureObserver::new())),
            TaskExecutorConfig::default(),
        )
    }

    async fn run_collecting(
        executor: &TaskExecutor,
        task: &Task,
    ) -> (TaskResult, Vec<SseEvent>) {
        let context = ExecutionContext::new("s1", "w1");
        let (tx, mut rx) = mpsc::channel(64);
        let run = async {
            let result = executor.execute_stream(task, &context, &tx).await;
            drop(tx);
            result
        };
        let collect = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        tokio::join!(run, collect)
    }

    #[test]
    fn test_financial_validation() {
        let mut task = Task::new("t1", "compare", "compare revenue");
        task.validation_level = ValidationLevel::Financial;
        assert!(validate_output(&task, "revenue grew a lot").is_some());
        assert!(validate_output(&task, "revenue grew 12% to $3.1B").is_none());
        assert!(validate_output(&task, "  ").is_some());
    }

    #[tokio::test]
    async fn test_final_answer_emits_content_and_done() {
        let executor = executor(
            ScriptedLlm::new(vec!["The sum is trivial.\n```final_answer\n4\n```"]),
            vec![],
        );
        let task = Task::new("direct_task", "answer", "What is 2+2?");
        let (result, events) = run_collecting(&executor, &task).await;

        assert!(result.is_success());
        assert_eq!(result.output, "4");
        let types: Vec<SseEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![SseEventType::Thinking, SseEventType::Content, SseEventType::Done]
        );
        assert_eq!(events.last().unwrap().data["status"], "success");
    }

    #[tokio::test]
    async fn test_three_strikes_stop_the_loop() {
        let call = "```tool_call\n{\"tool\": \"read_url\", \"args\": {\"url\": \"https://example.invalid\"}}\n```";
        let executor = executor(
            ScriptedLlm::new(vec![call, call, call, call, call]),
            vec![Arc::new(FailingUrlTool)],
        );
        let task = Task::new("t1", "fetch", "Fetch https://example.invalid and summarise");
        let (result, events) = run_collecting(&executor, &task).await;

        assert_eq!(result.status, TaskRunStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("repeated failures"));

        let tool_results = events
            .iter()
            .filter(|e| e.event_type == SseEventType::ToolResult)
            .count();
        assert_eq!(tool_results, 3);
        let dones = events
            .iter()
            .filter(|e| e.event_type == SseEventType::Done)
            .count();
        assert_eq!(dones, 1);
        assert_eq!(events.last().unwrap().data["status"], "failed");
    }

    #[tokio::test]
    async fn test_validation_critique_reenters_loop() {
        let mut task = Task::new("t1", "revenue", "state the revenue");
        task.validation_level = ValidationLevel::Financial;
        let executor = executor(
            ScriptedLlm::new(vec![
                "```final_answer\nrevenue grew nicely\n```",
                "```final_answer\nrevenue grew 12% to $3.1B\n```",
            ]),
            vec![],
        );
        let (result, _) = run_collecting(&executor, &task).await;
        assert!(result.is_success());
        assert_eq!(result.iterations, 2);
        assert!(result.output.contains("12%"));
    }

    #[tokio::test]
    async fn test_exit_tool_short_circuits() {
        let mut registry = ToolRegistry::new(true);
        registry.register(Arc::new(crate::tools::ExitTool));
        let executor = TaskExecutor::new(
            Arc::new(ScriptedLlm::new(vec![
                "```tool_call\n{\"tool\": \"exit\", \"args\": {\"exit_code\": 0, \"message\": \"all done\"}}\n```",
            ])),
            Arc::new(ToolCallExecutor::new(Arc::new(RwLock::new(registry)))),
            Arc::new(Mutex::new(FailureObserver::new())),
            TaskExecutorConfig::default(),
        );
        let task = Task::new("t1", "finish", "finish up");
        let (result, _) = run_collecting(&executor, &task).await;
        assert!(result.is_success());
        assert_eq!(result.output, "all done");
    }

    #[tokio::test]
    async fn test_max_iterations_fails() {
        let call = "```tool_call\n{\"tool\": \"read_url\", \"args\": {}}\n```";
        // Successful tool calls keep the loop going until the bound.
        let mut registry = ToolRegistry::new(true);
        struct OkTool;
        #[async_trait]
        impl Tool for OkTool {
            fn name(&self) -> &str {
                "read_url"
            }
            fn description(&self) -> &str {
                "ok"
            }
            async fn execute(&self, _args: serde_json::Value) -> ToolResult {
                ToolResult::ok("read_url", "page content")
            }
        }
        registry.register(Arc::new(OkTool));
        let executor = TaskExecutor::new(
            Arc::new(ScriptedLlm::new(vec![call; 20])),
            Arc::new(ToolCallExecutor::new(Arc::new(RwLock::new(registry)))),
            Arc::new(Mutex::new(FailureObserver::new())),
            TaskExecutorConfig {
                max_iterations: 3,
                timeout_seconds: 300,
            },
        );
        let task = Task::new("t1", "loop", "loop forever");
        let (result, _) = run_collecting(&executor, &task).await;
        assert_eq!(result.status, TaskRunStatus::Failed);
        assert_eq!(result.iterations, 3);
        assert!(result.error.unwrap().contains("max iterations"));
    }
}
