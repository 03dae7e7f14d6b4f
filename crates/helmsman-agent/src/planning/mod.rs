//! Planning: LLM-generated task DAGs, deterministic scheduling, plan
//! recitation.
//!
//! Content generation belongs to the model; flow control belongs to the
//! code. The planner asks the LLM for a structured plan and validates
//! it; the scheduler owns every status transition afterwards.
//!
//! Sub-modules:
//!   - `planner`   — plan / replan via LLM JSON + DAG validation
//!   - `scheduler` — ready-set scheduling, failure decision ladder
//!   - `reciter`   — per-turn plan status block for the context
//!   - `events`    — plan/task lifecycle → SSE events

mod events;
mod planner;
mod reciter;
mod scheduler;

pub use events::PlanEventEmitter;
pub use planner::Planner;
pub use reciter::PlanReciter;
pub use scheduler::TaskScheduler;
