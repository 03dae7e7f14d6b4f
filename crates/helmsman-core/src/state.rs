//! Typed agent state machine.
//!
//! States advance only through the fixed transition table below; an
//! undefined (state, signal) pair is a logged no-op. Terminal states are
//! SUCCESS, FAILED, TIMEOUT, and CANCELLED.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Init,
    ParsingIntent,
    Planning,
    Reasoning,
    ToolCalling,
    Observing,
    Reflecting,
    Replanning,
    WaitingConfirm,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ParsingIntent => "parsing_intent",
            Self::Planning => "planning",
            Self::Reasoning => "reasoning",
            Self::ToolCalling => "tool_calling",
            Self::Observing => "observing",
            Self::Reflecting => "reflecting",
            Self::Replanning => "replanning",
            Self::WaitingConfirm => "waiting_confirm",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// Edge labels for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    UserMessageReceived,
    IntentClear,
    IntentUnclear,
    PlanReady,
    NeedTool,
    ToolSuccess,
    ToolFailed,
    ReflectionDone,
    ReplanReady,
    UserConfirmed,
    TaskComplete,
    MaxIterations,
    ExitCodeSuccess,
    ExitCodeFailure,
}

lazy_static! {
    /// The fixed transition table. Signals not listed for a state are
    /// no-ops.
    static ref TRANSITIONS: HashMap<(AgentState, Signal), AgentState> = {
        use AgentState::*;
        use Signal::*;
        let mut t = HashMap::new();
        t.insert((Init, UserMessageReceived), ParsingIntent);
        t.insert((ParsingIntent, IntentClear), Planning);
        t.insert((ParsingIntent, IntentUnclear), Reasoning);
        t.insert((Planning, PlanReady), Reasoning);

        t.insert((Reasoning, NeedTool), ToolCalling);
        t.insert((Reasoning, TaskComplete), Success);
        t.insert((Reasoning, ToolFailed), Reflecting);

        t.insert((ToolCalling, ToolSuccess), Observing);
        t.insert((ToolCalling, ToolFailed), Reflecting);
        t.insert((ToolCalling, ExitCodeSuccess), Success);
        t.insert((ToolCalling, ExitCodeFailure), Failed);

        t.insert((Observing, ToolSuccess), Reasoning);
        t.insert((Observing, ToolFailed), Reflecting);
        t.insert((Observing, TaskComplete), Success);

        t.insert((Reflecting, ReflectionDone), Replanning);
        t.insert((Replanning, ReplanReady), Reasoning);
        t.insert((WaitingConfirm, UserConfirmed), Reasoning);

        // Budget exhaustion can strike anywhere in the working set.
        for state in [Reasoning, ToolCalling, Observing, Reflecting, Replanning, Planning] {
            t.insert((state, MaxIterations), Timeout);
        }
        t
    };
}

/// One recorded transition, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub signal: Signal,
    pub to: AgentState,
}

/// Labelled transition system with a bounded history.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: AgentState,
    history: Vec<TransitionRecord>,
}

impl StateMachine {
    pub const MAX_HISTORY: usize = 100;

    pub fn new(initial: AgentState) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> AgentState {
        self.current
    }

    /// Advance if the (state, signal) pair is defined. Returns whether a
    /// transition happened.
    pub fn transition(&mut self, signal: Signal) -> bool {
        match TRANSITIONS.get(&(self.current, signal)) {
            Some(&next) => {
                if self.history.len() >= Self::MAX_HISTORY {
                    self.history.remove(0);
                }
                self.history.push(TransitionRecord {
                    from: self.current,
                    signal,
                    to: next,
                });
                tracing::debug!(
                    "state transition: {} --{:?}--> {}",
                    self.current.as_str(),
                    signal,
                    next.as_str()
                );
                self.current = next;
                true
            }
            None => {
                tracing::debug!(
                    "ignored signal {:?} in state {}",
                    signal,
                    self.current.as_str()
                );
                false
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Cooperative cancellation. Not signal-driven: the stop flag is
    /// checked between suspension points and forces the terminal state
    /// directly.
    pub fn cancel(&mut self) {
        tracing::debug!("state machine cancelled from {}", self.current.as_str());
        self.current = AgentState::Cancelled;
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.current = AgentState::Init;
        self.history.clear();
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(AgentState::Init)
    }
}
