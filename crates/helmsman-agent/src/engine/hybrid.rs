//! Unified streaming entry: route to the skill, code, or reasoning
//! path and emit SSE events.
//!
//! Fallback discipline: a failed skill or code path emits one
//! ERROR(recoverable=true) and then the direct path's events. Every
//! invocation ends in exactly one terminal DONE (or a terminal
//! ERROR(recoverable=false) followed by the fallback's DONE).

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;

use helmsman_core::{SseEvent, Task, ValidationLevel};

use crate::prompts;
use crate::router::ExecutionPath;
use crate::sandbox::{ExecutionRequest, ExecutionStatus};
use crate::skills::{SkillRunResult, SkillRunStatus};
use crate::task_executor::TaskResult;

use super::{AgentEngine, ExecutionMode};

lazy_static! {
    static ref PYTHON_FENCE_RE: Regex =
        Regex::new(r"(?s)```python\s*\n(.*?)\n```").expect("static regex");
    static ref GENERIC_FENCE_RE: Regex =
        Regex::new(r"(?s)```\s*\n(.*?)\n```").expect("static regex");
}

/// Keywords that push AUTO mode into planning.
const PLANNING_KEYWORDS: &[&str] = &[
    "analyze", "analyse", "research", "report", "compare", "summarize",
    "summarise", "plan", "design", "develop", "build", "investigate",
];

/// Queries longer than this are planning-shaped regardless of wording.
const PLANNING_LENGTH_THRESHOLD: usize = 200;

impl AgentEngine {
    /// Unified streaming entry point. Events flow into the caller's
    /// bounded channel; a full buffer blocks the producer until drained.
    pub async fn execute(
        &mut self,
        query: &str,
        mode: ExecutionMode,
        events: &mpsc::Sender<SseEvent>,
    ) {
        tracing::info!("=== unified execute started ===");
        if let Err(e) = self.execute_inner(query, mode, events).await {
            tracing::error!("execute error: {}", e);
            self.send(events, SseEvent::error(&e.to_string(), false))
                .await;
            self.send(
                events,
                SseEvent::done(json!({
                    "status": "error",
                    "message": e.to_string(),
                })),
            )
            .await;
        }
    }

    async fn execute_inner(
        &mut self,
        query: &str,
        mode: ExecutionMode,
        events: &mpsc::Sender<SseEvent>,
    ) -> anyhow::Result<()> {
        let routing = self.router.route(query).await;
        tracing::info!(
            "routing decision: {} (confidence {:.2}, {})",
            routing.path.as_str(),
            routing.confidence,
            routing.reason
        );

        match routing.path {
            ExecutionPath::Skill => {
                self.execute_skill_path(query, events).await;
                return Ok(());
            }
            ExecutionPath::McpCode => {
                self.execute_code_path(query, events).await;
                return Ok(());
            }
            ExecutionPath::Llm => {}
        }

        let mode = match mode {
            ExecutionMode::Auto => {
                let decided = Self::decide_execution_mode(query);
                tracing::info!("auto-selected mode: {:?}", decided);
                decided
            }
            other => other,
        };

        match mode {
            ExecutionMode::Planning => self.execute_planning(query, events).await,
            _ => {
                self.execute_direct(query, events).await;
                Ok(())
            }
        }
    }

    /// Planning-shaped queries: research/analysis keywords or length.
    fn decide_execution_mode(query: &str) -> ExecutionMode {
        let lower = query.to_lowercase();
        if PLANNING_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return ExecutionMode::Planning;
        }
        if query.len() > PLANNING_LENGTH_THRESHOLD {
            return ExecutionMode::Planning;
        }
        ExecutionMode::Direct
    }

    /// Direct execution: one implicit task through the task executor.
    /// The task executor's DONE is the terminal event.
    pub(crate) async fn execute_direct(
        &mut self,
        query: &str,
        events: &mpsc::Sender<SseEvent>,
    ) -> TaskResult {
        tracing::info!("=== direct execution mode ===");
        self.send(events, SseEvent::status("direct", "Executing directly"))
            .await;

        let mut task = Task::new("direct_task", "Execute user request", query);
        task.acceptance_criteria =
            "User's question is answered or request is fulfilled".to_string();
        task.validation_level = ValidationLevel::for_query(query);

        let context = self.task_context();
        self.task_executor
            .execute_stream(&task, &context, events)
            .await
    }

    /// Skill path: load instructions, prune the action space, try the
    /// L3 script, and inject the result. Failure falls back to direct.
    pub(crate) async fn execute_skill_path(
        &mut self,
        query: &str,
        events: &mpsc::Sender<SseEvent>,
    ) {
        self.send(events, SseEvent::status("skill", "Executing skill"))
            .await;

        let outcome = self.run_skill(query).await;

        // Pruning is scoped to the skill segment.
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .reset_allowed_tools();

        match outcome {
            Ok(content) => {
                self.send(events, SseEvent::content(&content)).await;
                self.send(
                    events,
                    SseEvent::done(json!({ "status": "success", "path": "skill" })),
                )
                .await;
            }
            Err(message) => {
                tracing::warn!("skill path failed: {}, falling back to direct", message);
                self.send(events, SseEvent::error(&message, true)).await;
                self.execute_direct(query, events).await;
            }
        }
    }

    /// The skill attempt itself; Err carries the reason for fallback.
    async fn run_skill(&mut self, query: &str) -> Result<String, String> {
        let skills = self.skills.as_ref().ok_or("no skill system configured")?;

        let hit = skills
            .matcher
            .match_query(query)
            .await
            .ok_or("no skill matched")?;
        if hit.score < self.config.skill_confidence_threshold {
            return Err(format!("skill match below threshold ({:.2})", hit.score));
        }

        let instructions = skills
            .loader
            .load_l2(&hit.skill_id)
            .await
            .map_err(|e| format!("failed to load skill instructions: {}", e))?;

        let metadata = hit
            .metadata
            .clone()
            .or_else(|| skills.registry.get(&hit.skill_id).cloned());
        if let Some(meta) = &metadata {
            if !meta.allowed_tools.is_empty() && self.config.enable_action_space_pruning {
                let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                registry.set_allowed_tools(&meta.allowed_tools);
            }
        }

        if !skills.executor.can_execute(&hit.skill_id) {
            // Instruction-only skill: inject the L2 text as the result.
            return Ok(instructions);
        }

        let run = skills
            .executor
            .execute(
                &hit.skill_id,
                query,
                json!({
                    "session_id": self.session_id,
                    "workspace_id": self.workspace_id,
                }),
            )
            .await;

        match run.status {
            SkillRunStatus::Success => {
                let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
                pad.update_progress(&format!("✅ Skill {} executed", hit.skill_id), false);
                Ok(format!(
                    "{}\n\n{}",
                    format_skill_data(&run),
                    instructions
                ))
            }
            SkillRunStatus::Timeout => Err(format!("skill {} timed out", hit.skill_id)),
            SkillRunStatus::Failed => Err(format!(
                "skill {} failed: {}",
                hit.skill_id,
                run.error.unwrap_or_else(|| "unknown error".into())
            )),
        }
    }

    /// Code path: ask the LLM for code only, run it in the sandbox with
    /// bounded time and memory. Failure falls back to direct.
    pub(crate) async fn execute_code_path(
        &mut self,
        query: &str,
        events: &mpsc::Sender<SseEvent>,
    ) {
        tracing::info!("=== code execution mode ===");
        self.send(events, SseEvent::status("mcp_code", "Generating code"))
            .await;

        let Some(sandbox) = self.sandbox.clone() else {
            self.send(
                events,
                SseEvent::error("no code sandbox configured", true),
            )
            .await;
            self.execute_direct(query, events).await;
            return;
        };

        self.send(events, SseEvent::thinking("Generating code...\n"))
            .await;

        let response = match self
            .llm
            .complete(
                &[helmsman_core::Message::user(prompts::code_generation_prompt(
                    query,
                ))],
                Some(prompts::CODE_GENERATION_SYSTEM_PROMPT),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.send(
                    events,
                    SseEvent::error(&format!("code generation failed: {}", e), true),
                )
                .await;
                self.execute_direct(query, events).await;
                return;
            }
        };

        let Some(code) = extract_code(&response.content) else {
            tracing::warn!("no code block in LLM response, falling back to direct");
            self.send(
                events,
                SseEvent::error("model produced no executable code", true),
            )
            .await;
            self.execute_direct(query, events).await;
            return;
        };

        let preview: String = code.chars().take(200).collect();
        self.send(
            events,
            SseEvent::tool_call(
                "mcp_code_execute",
                &json!({ "language": "python", "code_preview": preview }),
            ),
        )
        .await;
        self.send(events, SseEvent::status("mcp_code", "Executing code"))
            .await;

        let outcome = sandbox.execute(ExecutionRequest::new(&code, "python")).await;
        let success = outcome.status == ExecutionStatus::Success;
        self.send(
            events,
            SseEvent::tool_result(
                "mcp_code_execute",
                success,
                if success { outcome.output.as_deref() } else { None },
                outcome.error.as_deref(),
                Some(outcome.execution_time),
            ),
        )
        .await;

        if success {
            let output = outcome.output.unwrap_or_default();
            self.send(
                events,
                SseEvent::content(&format!("Execution result:\n```\n{}\n```", output)),
            )
            .await;
            self.send(
                events,
                SseEvent::done(json!({
                    "status": "success",
                    "path": "mcp_code",
                    "output": output,
                })),
            )
            .await;
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| format!("sandbox status {:?}", outcome.status));
            tracing::warn!("code execution failed: {}, falling back to direct", error);
            self.send(
                events,
                SseEvent::error(&format!("code execution failed: {}", error), true),
            )
            .await;
            self.execute_direct(query, events).await;
        }
    }
}

/// Pull code out of a model reply: a ```python fence first, then any
/// fence, then the whole reply when it already looks like code.
pub(crate) fn extract_code(response: &str) -> Option<String> {
    if let Some(cap) = PYTHON_FENCE_RE.captures(response) {
        return Some(cap[1].trim().to_string());
    }
    if let Some(cap) = GENERIC_FENCE_RE.captures(response) {
        return Some(cap[1].trim().to_string());
    }
    let trimmed = response.trim();
    if trimmed.starts_with("import ")
        || trimmed.starts_with("from ")
        || trimmed.starts_with("def ")
        || trimmed.starts_with("class ")
        || trimmed.starts_with('#')
    {
        return Some(trimmed.to_string());
    }
    None
}

/// Render a skill run's data for the context.
pub(crate) fn format_skill_data(run: &SkillRunResult) -> String {
    let mut parts = vec!["**Skill executed successfully**".to_string(), String::new()];
    match &run.data {
        Some(serde_json::Value::Object(map)) => {
            for (key, value) in map {
                match value {
                    serde_json::Value::String(s) => parts.push(format!("- **{}**: {}", key, s)),
                    serde_json::Value::Number(n) => parts.push(format!("- **{}**: {}", key, n)),
                    serde_json::Value::Bool(b) => parts.push(format!("- **{}**: {}", key, b)),
                    serde_json::Value::Array(items) => {
                        parts.push(format!("- **{}**: ({} items)", key, items.len()))
                    }
                    _ => {}
                }
            }
        }
        Some(serde_json::Value::String(s)) => {
            let head: String = s.chars().take(500).collect();
            parts.push(head);
            if s.chars().count() > 500 {
                parts.push("...".into());
            }
        }
        Some(other) => {
            let rendered = other.to_string();
            parts.push(rendered.chars().take(500).collect());
        }
        None => {}
    }
    if run.tokens_used > 0 {
        parts.push(String::new());
        parts.push(format!("*Tokens used: {}*", run.tokens_used));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_prefers_python_fence() {
        let text = "here\n```python\nprint(1)\n```\nand\n```\nother\n```";
        assert_eq!(extract_code(text).as_deref(), Some("print(1)"));
    }

    #[test]
    fn test_extract_code_generic_fence_and_heuristic() {
        assert_eq!(
            extract_code("```\nx = 1\n```").as_deref(),
            Some("x = 1")
        );
        assert_eq!(
            extract_code("import math\nprint(math.pi)").as_deref(),
            Some("import math\nprint(math.pi)")
        );
        assert!(extract_code("I would rather not.").is_none());
    }

    #[test]
    fn test_mode_decision() {
        assert_eq!(
            AgentEngine::decide_execution_mode("Compare A and B and produce a report"),
            ExecutionMode::Planning
        );
        assert_eq!(
            AgentEngine::decide_execution_mode("What is 2+2?"),
            ExecutionMode::Direct
        );
        let long = "x".repeat(201);
        assert_eq!(
            AgentEngine::decide_execution_mode(&long),
            ExecutionMode::Planning
        );
    }
}
