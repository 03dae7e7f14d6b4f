//! Failure observer.
//!
//! Every tool/LLM invocation produces exactly one signal and offers it
//! here. Successes are kept in the full history for statistics; only
//! failures enter the bounded summary that feeds the 3-strike protocol
//! and the context recitation.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use helmsman_core::{ExitCode, FailureKind, FailureSignal, FailureSummary};

/// Callback invoked for every non-success signal. Best effort: a
/// panicking callback must not take the loop down.
pub type FailureCallback = Box<dyn Fn(&FailureSignal) + Send + Sync>;

/// Writer for the progress log, injected by the scratchpad owner.
pub type ProgressWriter = Box<dyn Fn(&str) + Send + Sync>;

/// What `observe` concluded about one signal.
#[derive(Debug, Clone, Default)]
pub struct ObserveOutcome {
    pub recorded: bool,
    pub trigger_three_strike: bool,
    pub should_escalate: bool,
    pub learning: String,
}

/// Aggregate statistics over everything observed so far.
#[derive(Debug, Clone)]
pub struct FailureStatistics {
    pub total_signals: usize,
    pub total_failures: usize,
    pub success_rate: f64,
    pub by_kind: HashMap<FailureKind, usize>,
    pub by_tool: HashMap<String, usize>,
}

#[derive(Default)]
pub struct FailureObserver {
    summary: FailureSummary,
    all: Vec<FailureSignal>,
    callbacks: Vec<FailureCallback>,
    progress_writer: Option<ProgressWriter>,
}

impl FailureObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject the progress-log writer. Failures are written there so the
    /// record survives context compression.
    pub fn set_progress_writer(&mut self, writer: ProgressWriter) {
        self.progress_writer = Some(writer);
    }

    pub fn register_callback(&mut self, callback: FailureCallback) {
        self.callbacks.push(callback);
    }

    /// Observe one signal. Successes only feed statistics.
    pub fn observe(&mut self, signal: FailureSignal) -> ObserveOutcome {
        let mut outcome = ObserveOutcome::default();
        self.all.push(signal.clone());

        if signal.is_success() {
            tracing::debug!("success signal from {:?}", signal.tool_name);
            return outcome;
        }

        self.summary.add(signal.clone());
        outcome.recorded = true;
        outcome.learning = signal.learning();

        if let Some(writer) = &self.progress_writer {
            writer(&signal.to_progress_entry());
        } else {
            tracing::info!("failure: {}", signal.to_progress_entry());
        }

        if self.summary.should_trigger_three_strike(&signal) {
            outcome.trigger_three_strike = true;
            tracing::warn!(
                "3-strike triggered for {} (tool: {:?})",
                signal.kind.as_str(),
                signal.tool_name
            );
        }

        if matches!(signal.exit_code, ExitCode::NeedUser | ExitCode::Fatal) {
            outcome.should_escalate = true;
        }

        for callback in &self.callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&signal)));
            if result.is_err() {
                tracing::error!("failure callback panicked");
            }
        }

        outcome
    }

    /// Stop retrying when the exit code is fatal or the 3-strike rule
    /// fires for this signal.
    pub fn should_stop_retry(&self, signal: &FailureSignal) -> bool {
        if signal.exit_code == ExitCode::Fatal {
            return true;
        }
        self.summary.should_trigger_three_strike(signal)
    }

    /// Markdown failure summary for the context recitation. Empty when
    /// nothing failed recently.
    pub fn failure_summary_markdown(&self) -> String {
        self.summary.to_markdown()
    }

    pub fn statistics(&self) -> FailureStatistics {
        let total = self.all.len();
        let failures: Vec<&FailureSignal> = self.all.iter().filter(|f| !f.is_success()).collect();

        let mut by_kind: HashMap<FailureKind, usize> = HashMap::new();
        let mut by_tool: HashMap<String, usize> = HashMap::new();
        for f in &failures {
            *by_kind.entry(f.kind).or_default() += 1;
            if let Some(tool) = &f.tool_name {
                *by_tool.entry(tool.clone()).or_default() += 1;
            }
        }

        FailureStatistics {
            total_signals: total,
            total_failures: failures.len(),
            success_rate: if total > 0 {
                (total - failures.len()) as f64 / total as f64
            } else {
                1.0
            },
            by_kind,
            by_tool,
        }
    }

    pub fn most_common_failure(&self) -> Option<FailureKind> {
        let stats = self.statistics();
        stats
            .by_kind
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(kind, _)| kind)
    }

    pub fn summary(&self) -> &FailureSummary {
        &self.summary
    }

    pub fn history(&self) -> &[FailureSignal] {
        &self.all
    }

    pub fn clear(&mut self) {
        self.summary.clear();
        self.all.clear();
    }
}
