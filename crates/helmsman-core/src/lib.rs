//! Protocol types and data model for the helmsman agent runtime.
//!
//! Everything wire-facing lives here: conversation messages, failure
//! signals, the task/plan DAG, the typed agent state machine, the SSE
//! event envelope, runtime configuration, and the filesystem seam the
//! runtime persists through. The `helmsman-agent` crate holds the
//! behavior; this crate holds the vocabulary.

pub mod config;
pub mod error;
pub mod events;
pub mod failure;
pub mod fs;
pub mod message;
pub mod state;
pub mod task;

pub use config::EngineConfig;
pub use error::CoreError;
pub use events::{SseEvent, SseEventType};
pub use failure::{ExitCode, FailureKind, FailureSignal, FailureSource, FailureSummary};
pub use fs::{DiskFs, MemoryFs, WorkspaceFs};
pub use message::{Message, Role};
pub use state::{AgentState, Signal, StateMachine};
pub use task::{Plan, PlanProgress, ReplanDecision, Task, TaskStatus, ValidationLevel};
