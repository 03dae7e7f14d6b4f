//! Runtime configuration.
//!
//! Every knob can be set programmatically or through `HELMSMAN_*`
//! environment variables.

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard upper bound for the outer loop.
    pub max_iterations: usize,
    /// Outer session timeout in seconds.
    pub timeout_seconds: u64,
    /// Gate for the 3-strike stop condition.
    pub enable_three_strike: bool,
    /// Gate for tool allow-list enforcement.
    pub enable_action_space_pruning: bool,
    /// Router rule 1: skill match score required to take the skill path.
    pub skill_confidence_threshold: f64,
    /// Router rule 2: confidence required to take the code path.
    pub structured_task_confidence: f64,
    /// Base iteration budget before length adaptation.
    pub base_budget: usize,
    /// Wall-clock budget for the iteration policy, in seconds.
    pub available_time_seconds: f64,
    /// Context window size in tokens; drives compression thresholds.
    pub context_window_limit: usize,
    /// Save a checkpoint every N iterations.
    pub checkpoint_interval: usize,
    /// Retain at most K checkpoints.
    pub max_checkpoints: usize,
    /// Message count above which the context is cleared to a summary.
    pub context_clear_threshold: usize,
    /// Token count above which the context is cleared to a summary.
    pub context_token_threshold: usize,
    /// Recent messages kept verbatim through a context clear.
    pub recent_messages_to_keep: usize,
    /// Execute independent ready tasks concurrently in planning mode.
    pub enable_parallel_tasks: bool,
    /// Inner-loop iteration bound per task.
    pub task_max_iterations: usize,
    /// Inner-loop timeout per task, in seconds.
    pub task_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            timeout_seconds: 300,
            enable_three_strike: true,
            enable_action_space_pruning: true,
            skill_confidence_threshold: 0.85,
            structured_task_confidence: 0.70,
            base_budget: 10,
            available_time_seconds: 300.0,
            context_window_limit: 128_000,
            checkpoint_interval: 5,
            max_checkpoints: 3,
            context_clear_threshold: 15,
            context_token_threshold: 50_000,
            recent_messages_to_keep: 10,
            enable_parallel_tasks: true,
            task_max_iterations: 10,
            task_timeout_seconds: 300,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        Err(_) => default,
    }
}

impl EngineConfig {
    /// Load from environment variables with defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_iterations: env_usize("HELMSMAN_MAX_ITERATIONS", d.max_iterations),
            timeout_seconds: env_u64("HELMSMAN_TIMEOUT_SECONDS", d.timeout_seconds),
            enable_three_strike: env_bool("HELMSMAN_ENABLE_3_STRIKE", d.enable_three_strike),
            enable_action_space_pruning: env_bool(
                "HELMSMAN_ENABLE_ACTION_SPACE_PRUNING",
                d.enable_action_space_pruning,
            ),
            skill_confidence_threshold: env_f64(
                "HELMSMAN_SKILL_CONFIDENCE_THRESHOLD",
                d.skill_confidence_threshold,
            ),
            structured_task_confidence: env_f64(
                "HELMSMAN_STRUCTURED_TASK_CONFIDENCE",
                d.structured_task_confidence,
            ),
            base_budget: env_usize("HELMSMAN_BASE_BUDGET", d.base_budget),
            available_time_seconds: env_f64(
                "HELMSMAN_AVAILABLE_TIME_SECONDS",
                d.available_time_seconds,
            ),
            context_window_limit: env_usize(
                "HELMSMAN_CONTEXT_WINDOW_LIMIT",
                d.context_window_limit,
            ),
            checkpoint_interval: env_usize("HELMSMAN_CHECKPOINT_INTERVAL", d.checkpoint_interval),
            max_checkpoints: env_usize("HELMSMAN_MAX_CHECKPOINTS", d.max_checkpoints),
            context_clear_threshold: env_usize(
                "HELMSMAN_CONTEXT_CLEAR_THRESHOLD",
                d.context_clear_threshold,
            ),
            context_token_threshold: env_usize(
                "HELMSMAN_CONTEXT_TOKEN_THRESHOLD",
                d.context_token_threshold,
            ),
            recent_messages_to_keep: env_usize(
                "HELMSMAN_RECENT_MESSAGES_TO_KEEP",
                d.recent_messages_to_keep,
            ),
            enable_parallel_tasks: env_bool(
                "HELMSMAN_ENABLE_PARALLEL_TASKS",
                d.enable_parallel_tasks,
            ),
            task_max_iterations: env_usize("HELMSMAN_TASK_MAX_ITERATIONS", d.task_max_iterations),
            task_timeout_seconds: env_u64(
                "HELMSMAN_TASK_TIMEOUT_SECONDS",
                d.task_timeout_seconds,
            ),
        }
    }
}
