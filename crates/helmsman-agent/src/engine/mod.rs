//! The agent engine: binds every subsystem and runs the outer control
//! loop.
//!
//! Two public entry points:
//!   - [`AgentEngine::run`] — single-turn, non-streaming, state-machine
//!     driven.
//!   - [`AgentEngine::execute`] — unified streaming entry that routes
//!     between the skill, code, and reasoning paths and emits SSE
//!     events to the caller's channel.
//!
//! Sub-modules:
//!   - `run_loop`  — the non-streaming state-machine loop
//!   - `hybrid`    — routing + skill / code paths + direct execution
//!   - `planning`  — plan → schedule → parallel task streaming

mod hybrid;
mod planning;
mod run_loop;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use helmsman_core::{
    EngineConfig, FailureSignal, Signal, SseEvent, StateMachine, WorkspaceFs,
};

use crate::answer::{AnswerAgent, TaskOutput};
use crate::checkpoint::CheckpointManager;
use crate::context::ContextManager;
use crate::failure::{FailureObserver, FailurePatternKb};
use crate::llm::LlmClient;
use crate::planning::{Planner, TaskScheduler};
use crate::policy::{ContextCompressor, IterationPolicy, TokenBudget};
use crate::prompts;
use crate::router::ExecutionRouter;
use crate::sandbox::CodeSandbox;
use crate::scratchpad::Scratchpad;
use crate::skills::{SkillExecutor, SkillLoader, SkillMatcher, SkillRegistry};
use crate::task_executor::{ExecutionContext, TaskExecutor, TaskExecutorConfig};
use crate::tools::{register_builtin_tools, Tool, ToolCallExecutor, ToolRegistry};

/// Execution mode for the unified entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Auto,
    Direct,
    Planning,
}

/// Non-streaming run result.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub answer: String,
    pub reasoning: Option<String>,
    pub token_usage: crate::context::TokenTotals,
    pub iterations: usize,
}

/// The consumed skill-system surface, bundled.
pub struct SkillSystem {
    pub registry: Arc<SkillRegistry>,
    pub matcher: Arc<dyn SkillMatcher>,
    pub loader: Arc<dyn SkillLoader>,
    pub executor: Arc<dyn SkillExecutor>,
}

pub struct AgentEngine {
    pub(crate) config: EngineConfig,
    pub(crate) session_id: String,
    pub(crate) workspace_id: String,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) registry: Arc<RwLock<ToolRegistry>>,
    pub(crate) tool_executor: Arc<ToolCallExecutor>,
    pub(crate) scratchpad: Arc<Mutex<Scratchpad>>,
    pub(crate) context: ContextManager,
    pub(crate) state_machine: StateMachine,
    pub(crate) observer: Arc<Mutex<FailureObserver>>,
    pub(crate) pattern_kb: Arc<Mutex<FailurePatternKb>>,
    pub(crate) planner: Planner,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) task_executor: Arc<TaskExecutor>,
    pub(crate) answer_agent: AnswerAgent,
    pub(crate) router: ExecutionRouter,
    pub(crate) skills: Option<SkillSystem>,
    pub(crate) sandbox: Option<Arc<dyn CodeSandbox>>,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) iteration_policy: IterationPolicy,
    pub(crate) compressor: ContextCompressor,
    pub(crate) token_budget: TokenBudget,
    pub(crate) iteration_count: usize,
    pub(crate) last_exit_code: Option<i32>,
    pub(crate) task_outputs: Vec<TaskOutput>,
    pub(crate) stop_flag: Arc<AtomicBool>,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        fs: Arc<dyn WorkspaceFs>,
        session_id: &str,
        workspace_id: &str,
        config: EngineConfig,
    ) -> Self {
        let mut registry = ToolRegistry::new(config.enable_action_space_pruning);
        register_builtin_tools(&mut registry, fs.clone(), None);
        let registry = Arc::new(RwLock::new(registry));
        let tool_executor = Arc::new(ToolCallExecutor::new(registry.clone()));

        let scratchpad = Arc::new(Mutex::new(Scratchpad::new(fs.clone(), session_id)));
        let pattern_kb = Arc::new(Mutex::new(FailurePatternKb::new(fs.clone())));

        let mut observer = FailureObserver::new();
        // Keep the failures: every non-success signal lands in progress.
        // Observer entries carry their own status glyph.
        let progress_pad = scratchpad.clone();
        observer.set_progress_writer(Box::new(move |entry| {
            let pad = progress_pad.lock().unwrap_or_else(|e| e.into_inner());
            pad.update_progress(entry, false);
        }));
        // Cross-session learning: record every failure into the KB.
        let kb = pattern_kb.clone();
        observer.register_callback(Box::new(move |signal| {
            let mut kb = kb.lock().unwrap_or_else(|e| e.into_inner());
            kb.record(signal);
        }));
        let observer = Arc::new(Mutex::new(observer));

        let task_executor = Arc::new(TaskExecutor::new(
            llm.clone(),
            tool_executor.clone(),
            observer.clone(),
            TaskExecutorConfig {
                max_iterations: config.task_max_iterations,
                timeout_seconds: config.task_timeout_seconds,
            },
        ));

        let checkpoints = CheckpointManager::new(
            fs,
            session_id,
            config.checkpoint_interval,
            config.max_checkpoints,
        );
        let iteration_policy = IterationPolicy::new(
            config.base_budget,
            config.max_iterations.max(config.base_budget),
            config.available_time_seconds,
        );
        let compressor = ContextCompressor::new(config.context_window_limit);
        let token_budget = TokenBudget::new(config.context_window_limit as u64, 0.20);
        let router = ExecutionRouter::new(
            None,
            config.skill_confidence_threshold,
            config.structured_task_confidence,
        );

        tracing::info!(
            "agent engine initialized for session {} (pruning={}, 3-strike={})",
            session_id,
            config.enable_action_space_pruning,
            config.enable_three_strike
        );

        Self {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            planner: Planner::new(llm.clone()),
            answer_agent: AnswerAgent::new(llm.clone()),
            llm,
            registry,
            tool_executor,
            scratchpad,
            context: ContextManager::new(),
            state_machine: StateMachine::default(),
            observer,
            pattern_kb,
            scheduler: TaskScheduler::new(),
            task_executor,
            router,
            skills: None,
            sandbox: None,
            checkpoints,
            iteration_policy,
            compressor,
            token_budget,
            iteration_count: 0,
            last_exit_code: None,
            task_outputs: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Attach a code sandbox; re-registers `run_code` against it and
    /// enables the code execution path.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.register(Arc::new(crate::tools::RunCodeTool::new(Some(
                sandbox.clone(),
            ))));
        }
        self.sandbox = Some(sandbox);
        self
    }

    /// Attach the skill system; enables router rule 1.
    pub fn with_skills(mut self, skills: SkillSystem) -> Self {
        self.router = ExecutionRouter::new(
            Some(skills.matcher.clone()),
            self.config.skill_confidence_threshold,
            self.config.structured_task_confidence,
        );
        self.skills = Some(skills);
        self
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.register(tool);
    }

    /// Request cooperative cancellation; the loop notices it between
    /// suspension points.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> helmsman_core::AgentState {
        self.state_machine.current_state()
    }

    pub fn failure_statistics(&self) -> crate::failure::FailureStatistics {
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .statistics()
    }

    /// Reset for a new conversation: context, state machine, failure
    /// history, counters, and tool restrictions.
    pub fn reset(&mut self) {
        self.context.clear();
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .reset_allowed_tools();
        self.state_machine.reset();
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.scratchpad
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        self.scheduler = TaskScheduler::new();
        self.task_outputs.clear();
        self.iteration_count = 0;
        self.last_exit_code = None;
        self.stop_flag.store(false, Ordering::SeqCst);
        tracing::info!("agent state reset");
    }

    // ── Shared helpers ────────────────────────────────────────────────

    /// Recitation text appended to the LLM view each turn: plan status
    /// when a plan is loaded, otherwise the task-plan file, plus the
    /// recent-failure summary.
    pub(crate) fn recitation_text(&self) -> Option<String> {
        let mut sections = Vec::new();
        if let Some(plan) = self.scheduler.plan() {
            sections.push(crate::planning::PlanReciter::generate(plan, &self.scheduler));
        } else {
            let plan_file = self
                .scratchpad
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .read_task_plan();
            if !plan_file.trim().is_empty() {
                sections.push(format!("Current plan:\n{}", plan_file.trim()));
            }
        }
        let failures = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failure_summary_markdown();
        if !failures.is_empty() {
            sections.push(failures);
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Per-task execution context with the plan-status preamble.
    pub(crate) fn task_context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(&self.session_id, &self.workspace_id);
        if let Some(plan) = self.scheduler.plan() {
            ctx.plan = Some(plan.clone());
            let recitation = crate::planning::PlanReciter::generate(plan, &self.scheduler);
            ctx.add_system_message(format!("Current plan status:\n{}", recitation));
        }
        ctx
    }

    pub(crate) fn compress_context_if_needed(&mut self, force_aggressive: bool) {
        let tokens = self.context.token_usage().total() as usize;
        let strategy = if force_aggressive {
            Some(crate::policy::CompressionStrategy::Aggressive)
        } else {
            self.compressor.should_compress(tokens)
        };
        let Some(strategy) = strategy else { return };

        let (compressed, result) = self
            .compressor
            .compress(self.context.messages(), tokens, strategy);
        self.context.replace_all(compressed);
        let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
        pad.update_progress(
            &format!(
                "🪶 Context compressed via {}: {} → {} (saved {})",
                result.strategy_used.as_str(),
                result.tokens_before,
                result.tokens_after,
                result.tokens_saved
            ),
            false,
        );
        tracing::info!(
            "context compressed: {} -> {} tokens",
            result.tokens_before,
            result.tokens_after
        );
    }

    /// Memory clear: rewrite the context to a file-derived summary plus
    /// the most recent messages, keeping the system message. A single
    /// atomic replacement.
    pub(crate) fn clear_context_with_summary(&mut self) {
        let summary = self
            .scratchpad
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .summary_snapshot();

        let messages = self.context.messages();
        let system = messages
            .iter()
            .find(|m| m.role == helmsman_core::Role::System)
            .cloned();
        let non_system: Vec<helmsman_core::Message> = messages
            .iter()
            .filter(|m| m.role != helmsman_core::Role::System)
            .cloned()
            .collect();
        let keep = self.config.recent_messages_to_keep.min(non_system.len());
        let recent = non_system[non_system.len() - keep..].to_vec();

        let mut rebuilt = Vec::with_capacity(keep + 2);
        if let Some(system) = system {
            rebuilt.push(system);
        }
        rebuilt.push(helmsman_core::Message::user(format!(
            "📋 **Working Memory Summary (accumulated from files)**\n\n{}",
            summary
        )));
        rebuilt.extend(recent);

        let kept = rebuilt.len();
        self.context.replace_all(rebuilt);
        tracing::info!("context cleared to summary, {} messages kept", kept);
    }

    pub(crate) fn should_clear_context(&self) -> bool {
        self.context.message_count() > self.config.context_clear_threshold
            || self.context.token_usage().total() as usize > self.config.context_token_threshold
    }

    pub(crate) fn save_checkpoint(&self) {
        let (task_plan, findings, progress) = {
            let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
            (pad.read_task_plan(), pad.read_findings(), pad.read_progress())
        };
        let failure_history = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history()
            .to_vec();
        self.checkpoints.save_checkpoint(
            self.iteration_count,
            self.state_machine.current_state().as_str(),
            self.context.messages().to_vec(),
            self.context.token_usage(),
            task_plan,
            findings,
            progress,
            failure_history,
        );
    }

    /// Restore from the latest checkpoint. Best effort: false on any
    /// failure, live state untouched. Restoration re-enters the
    /// reasoning state regardless of the saved state name.
    pub fn restore_from_checkpoint(&mut self) -> bool {
        let Some(checkpoint) = self.checkpoints.get_latest_checkpoint() else {
            tracing::info!("no checkpoint available for restore");
            return false;
        };

        self.context.replace_all(checkpoint.messages);
        self.context.restore_token_usage(checkpoint.token_usage);
        self.iteration_count = checkpoint.iteration;
        self.state_machine.reset();
        self.state_machine.transition(Signal::UserMessageReceived);
        self.state_machine.transition(Signal::IntentUnclear);

        let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
        pad.update_progress(
            &format!(
                "Restored from checkpoint {} (iteration {})",
                checkpoint.id, checkpoint.iteration
            ),
            false,
        );
        tracing::info!(
            "checkpoint restored: iteration={}, messages={}",
            checkpoint.iteration,
            self.context.message_count()
        );
        true
    }

    /// Observe every tool result and apply the runtime rules: keep the
    /// failures, 2-Action reminders, 3-strike recovery prompts, and
    /// known-fix injection from the pattern KB.
    pub(crate) fn handle_tool_results(
        &mut self,
        calls: &[crate::tools::ToolCall],
        results: &[crate::tools::ToolResult],
    ) {
        for (call, result) in calls.iter().zip(results.iter()) {
            let signal = FailureSignal::from_tool_result(
                &call.tool_name,
                result.success,
                result.error.as_deref(),
                "",
                Some(call.parameters.clone()),
            );

            let outcome = {
                let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
                observer.observe(signal.clone())
            };

            let remind_findings = {
                let mut pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
                pad.record_action(&call.tool_name)
            };
            if remind_findings {
                tracing::warn!("2-Action rule: reminding the agent to record findings");
                self.context
                    .add_user_message(prompts::findings_reminder_prompt());
            }

            if !result.success {
                tracing::error!(
                    "tool {} failed: {}",
                    call.tool_name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                let error_record = {
                    let mut pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
                    pad.record_error(
                        &call.tool_name,
                        result.error.as_deref().unwrap_or("unknown error"),
                    )
                };
                let three_strike =
                    self.config.enable_three_strike && outcome.trigger_three_strike;
                if error_record.should_reread_plan || three_strike {
                    tracing::warn!("3-strike protocol triggered for {}", call.tool_name);
                    self.context
                        .add_user_message(prompts::error_recovery_prompt(error_record.count));
                    if !outcome.learning.is_empty() {
                        self.context.add_user_message(format!(
                            "[System Hint] Learn from the failure: {}",
                            outcome.learning
                        ));
                    }
                }
                let known_fix = {
                    let kb = self.pattern_kb.lock().unwrap_or_else(|e| e.into_inner());
                    kb.get_solution(&signal)
                };
                if let Some(fix) = known_fix {
                    self.context.add_user_message(format!(
                        "[KB] This failure matches a known pattern; try: {}",
                        fix
                    ));
                }
            } else {
                let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
                pad.update_progress(
                    &format!("✅ Successfully executed {}", call.tool_name),
                    false,
                );
            }
        }
    }

    /// Should any of these failed results stop the loop per the
    /// 3-strike protocol?
    pub(crate) fn should_stop_on_failures(
        &self,
        calls: &[crate::tools::ToolCall],
        results: &[crate::tools::ToolResult],
    ) -> bool {
        if !self.config.enable_three_strike {
            return false;
        }
        let observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        calls
            .iter()
            .zip(results.iter())
            .filter(|(_, r)| !r.success)
            .any(|(c, r)| {
                let signal = FailureSignal::from_tool_result(
                    &c.tool_name,
                    false,
                    r.error.as_deref(),
                    "",
                    None,
                );
                observer.should_stop_retry(&signal)
            })
    }

    /// Session lessons: one terminal paragraph into the progress log.
    pub(crate) fn store_session_lessons(&self, final_state: &str) {
        let stats = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .statistics();
        let dominant = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .most_common_failure()
            .map(|k| k.as_str().to_string())
            .unwrap_or_else(|| "none".into());
        let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
        pad.update_progress(
            &format!(
                "Session finished ({}): {} operations, {} failures, dominant failure: {}",
                final_state, stats.total_signals, stats.total_failures, dominant
            ),
            false,
        );
    }

    pub(crate) async fn send(&self, events: &tokio::sync::mpsc::Sender<SseEvent>, event: SseEvent) {
        // Bounded channel: a full buffer blocks here until the consumer
        // drains, which is the back-pressure contract.
        let _ = events.send(event).await;
    }
}
