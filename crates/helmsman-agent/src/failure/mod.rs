//! Failure learning: observe every signal, keep the failures, stop
//! repeating mistakes.
//!
//! Sub-modules:
//!   - `observer`   — full history + bounded summary, 3-strike protocol
//!   - `pattern_kb` — cross-session failure→fix knowledge base

mod observer;
mod pattern_kb;

pub use observer::{FailureObserver, FailureStatistics, ObserveOutcome};
pub use pattern_kb::{FailurePattern, FailurePatternKb};
