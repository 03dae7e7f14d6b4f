//! The single-turn, non-streaming control loop.
//!
//! State-machine driven: each iteration handles the current state and
//! advances through signals. The loop never holds a lock across a
//! suspension point and never panics on component failures.

use std::time::Instant;

use helmsman_core::{AgentState, Signal};

use crate::prompts;
use crate::tools::ToolCallExecutor;

use super::{AgentEngine, AgentResponse};

impl AgentEngine {
    /// Run one user message to completion.
    pub async fn run(&mut self, user_message: &str) -> AgentResponse {
        tracing::info!("=== agent run started ===");
        let run_started = Instant::now();

        self.state_machine.reset();
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.iteration_count = 0;
        self.last_exit_code = None;

        let budget = self.iteration_policy.calculate_budget(user_message);
        tracing::info!("iteration budget for this run: {}", budget);

        self.state_machine.transition(Signal::UserMessageReceived);

        // Skill injection happens before the loop: a confident match
        // loads instructions and prunes the action space.
        if self.skills.is_some() {
            self.match_and_inject_skill(user_message).await;
        }

        self.context.add_user_message(user_message);
        // run() is the plain execution mode: go straight to reasoning.
        self.state_machine.transition(Signal::IntentUnclear);

        let mut last_reasoning: Option<String> = None;

        while !self.state_machine.is_terminal() {
            if self.stopped() {
                self.state_machine.cancel();
                break;
            }
            self.iteration_count += 1;
            tracing::debug!(
                "--- iteration {} (state: {}) ---",
                self.iteration_count,
                self.state_machine.current_state().as_str()
            );

            let elapsed = run_started.elapsed().as_secs_f64();
            let fatal = self.last_exit_code == Some(3);
            let (keep_going, reason) =
                self.iteration_policy
                    .should_continue(self.iteration_count, fatal, elapsed);
            if !keep_going {
                tracing::warn!("stopping due to policy: {}", reason);
                self.state_machine.transition(Signal::MaxIterations);
                break;
            }

            self.compress_context_if_needed(false);
            if self.should_clear_context() {
                self.clear_context_with_summary();
            }
            if self.checkpoints.should_save(self.iteration_count) {
                self.save_checkpoint();
            }

            match self.state_machine.current_state() {
                AgentState::Reasoning => {
                    if let Some(response) = self.reasoning_step(&mut last_reasoning).await {
                        return response;
                    }
                }
                AgentState::ToolCalling | AgentState::Observing => {
                    // Tools already ran inside the reasoning step; these
                    // states acknowledge the observation and return to
                    // reasoning.
                    self.state_machine.transition(Signal::ToolSuccess);
                }
                AgentState::Reflecting => {
                    let summary = self
                        .observer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .failure_summary_markdown();
                    if !summary.is_empty() {
                        self.context.add_user_message(format!(
                            "[System] Adjust your strategy based on these failures:\n{}",
                            summary
                        ));
                    }
                    self.state_machine.transition(Signal::ReflectionDone);
                }
                AgentState::Replanning => {
                    self.state_machine.transition(Signal::ReplanReady);
                }
                AgentState::WaitingConfirm => {
                    self.state_machine.transition(Signal::UserConfirmed);
                }
                other => {
                    tracing::warn!("unexpected state in run loop: {}", other.as_str());
                    break;
                }
            }
        }

        self.finish_run(last_reasoning)
    }

    /// One reasoning step: LLM call, then either final answer, tool
    /// execution, or plain content. Returns a response when the run is
    /// over.
    async fn reasoning_step(
        &mut self,
        last_reasoning: &mut Option<String>,
    ) -> Option<AgentResponse> {
        let system = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            prompts::agent_system_prompt(&registry.descriptions())
        };
        let recitation = self.recitation_text();
        let messages = self.context.messages_for_llm(recitation.as_deref());

        tracing::info!("calling LLM with {} messages", messages.len());
        let response = match self.llm.complete(&messages, Some(&system)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("LLM call failed: {}", e);
                let signal = helmsman_core::FailureSignal::from_tool_result(
                    "llm",
                    false,
                    Some(&e.to_string()),
                    "",
                    None,
                );
                self.observer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .observe(signal);
                self.state_machine.transition(Signal::ToolFailed);
                return None;
            }
        };

        self.context.add_assistant_message(
            &response.content,
            response
                .usage
                .map(|u| serde_json::json!({"input_tokens": u.input_tokens, "output_tokens": u.output_tokens})),
        );
        if let Some(usage) = response.usage {
            self.context
                .update_token_usage(usage.input_tokens, usage.output_tokens);
            self.token_budget
                .record_usage(usage.input_tokens, usage.output_tokens);
            let (switch, reason) = self.token_budget.should_switch_to_summary_mode();
            if switch {
                tracing::warn!("switching to summary mode: {}", reason);
                self.compress_context_if_needed(true);
            }
        }

        *last_reasoning = self.tool_executor.extract_reasoning(&response.content);

        if self.tool_executor.has_final_answer(&response.content) {
            let answer = self
                .tool_executor
                .extract_answer(&response.content)
                .unwrap_or_else(|| response.content.clone());
            tracing::info!("final answer received");
            self.last_exit_code = Some(0);
            self.state_machine.transition(Signal::TaskComplete);
            self.store_session_lessons("success");
            return Some(AgentResponse {
                answer,
                reasoning: last_reasoning.clone(),
                token_usage: self.context.token_usage(),
                iterations: self.iteration_count,
            });
        }

        if self.tool_executor.has_tool_calls(&response.content) {
            self.state_machine.transition(Signal::NeedTool);

            let calls = self.tool_executor.parse_tool_calls(&response.content);
            tracing::info!("parsed {} tool calls", calls.len());
            let results = self.tool_executor.execute_all(&calls).await;

            self.handle_tool_results(&calls, &results);
            let results_text = self.tool_executor.format_tool_results(&results);
            self.context.add_tool_result_message(results_text);

            if let Some(code) = ToolCallExecutor::check_exit_code(&calls, &results) {
                self.last_exit_code = Some(code);
                if code == 0 {
                    self.state_machine.transition(Signal::ExitCodeSuccess);
                } else {
                    self.state_machine.transition(Signal::ExitCodeFailure);
                }
                return None;
            }

            let all_success = results.iter().all(|r| r.success);
            if all_success || !self.should_stop_on_failures(&calls, &results) {
                self.state_machine.transition(Signal::ToolSuccess);
            } else {
                // 3-strike: into reflection.
                self.state_machine.transition(Signal::ToolFailed);
            }
            return None;
        }

        // Neither an answer fence nor tool calls: the content is the
        // answer.
        tracing::warn!("response has neither final answer nor tool calls");
        self.last_exit_code = Some(0);
        self.state_machine.transition(Signal::TaskComplete);
        self.store_session_lessons("success");
        Some(AgentResponse {
            answer: response.content,
            reasoning: last_reasoning.clone(),
            token_usage: self.context.token_usage(),
            iterations: self.iteration_count,
        })
    }

    /// Map the terminal state onto the user-visible response.
    fn finish_run(&mut self, reasoning: Option<String>) -> AgentResponse {
        let final_state = self.state_machine.current_state();
        tracing::info!("=== agent run completed (state: {}) ===", final_state.as_str());

        let answer = match final_state {
            AgentState::Success => {
                self.store_session_lessons("success");
                "Task completed successfully.".to_string()
            }
            AgentState::Failed => {
                self.store_session_lessons("failed");
                let dominant = self
                    .observer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .most_common_failure();
                match dominant {
                    Some(kind) => format!(
                        "Task failed. Dominant failure: {}.",
                        kind.as_str().replace('_', " ")
                    ),
                    None => "Task failed.".to_string(),
                }
            }
            AgentState::Timeout => {
                self.store_session_lessons("timeout");
                "The task ran out of budget. Try splitting it into smaller subtasks.".to_string()
            }
            AgentState::Cancelled => "Run cancelled.".to_string(),
            _ => "Task ended.".to_string(),
        };

        AgentResponse {
            answer,
            reasoning,
            token_usage: self.context.token_usage(),
            iterations: self.iteration_count,
        }
    }

    /// Match a skill against the message and, on a confident hit, load
    /// its instructions into context and prune the action space to its
    /// declared tools.
    pub(crate) async fn match_and_inject_skill(&mut self, user_message: &str) {
        let Some(skills) = &self.skills else { return };

        let Some(hit) = skills.matcher.match_query(user_message).await else {
            tracing::debug!("no skill match");
            return;
        };
        if hit.score < self.config.skill_confidence_threshold {
            tracing::debug!("skill match below threshold: {:.2}", hit.score);
            return;
        }
        tracing::info!("skill matched: {} (score {:.2})", hit.skill_id, hit.score);

        let instructions = match skills.loader.load_l2(&hit.skill_id).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to load skill instructions: {}", e);
                return;
            }
        };

        let metadata = hit
            .metadata
            .clone()
            .or_else(|| skills.registry.get(&hit.skill_id).cloned());
        if let Some(meta) = &metadata {
            if !meta.allowed_tools.is_empty() && self.config.enable_action_space_pruning {
                let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                registry.set_allowed_tools(&meta.allowed_tools);
                tracing::info!("action space pruned to skill tools");
            }
        }

        let display_name = metadata
            .as_ref()
            .map(|m| m.display_name.clone())
            .unwrap_or_else(|| hit.skill_id.clone());

        // Try the L3 script; fall back to instructions only.
        let mut body = instructions.clone();
        if skills.executor.can_execute(&hit.skill_id) {
            let run = skills
                .executor
                .execute(
                    &hit.skill_id,
                    user_message,
                    serde_json::json!({
                        "session_id": self.session_id,
                        "workspace_id": self.workspace_id,
                    }),
                )
                .await;
            if run.status == crate::skills::SkillRunStatus::Success {
                body = format!(
                    "## Skill result\n{}\n\n## Follow-up instructions\n{}",
                    super::hybrid::format_skill_data(&run),
                    instructions
                );
                let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
                pad.update_progress(
                    &format!("✅ Skill {} executed", hit.skill_id),
                    false,
                );
            } else {
                tracing::warn!(
                    "skill {} execution failed: {:?}",
                    hit.skill_id,
                    run.error
                );
            }
        }

        self.context
            .add_system_message(format!("Active skill: {}\n\n{}", display_name, body));
    }
}
