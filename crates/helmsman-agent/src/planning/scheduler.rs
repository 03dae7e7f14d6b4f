//! Task DAG scheduler.
//!
//! Deterministic flow control: the scheduler decides what runs, what
//! retries, and when to give up. The decision ladder on failure is
//! retry → skip (optional tasks) → replan (capped) → human.

use helmsman_core::{Plan, PlanProgress, ReplanDecision, Task, TaskStatus};

/// Synchronous state-change callbacks, invoked from the mutating call.
type TaskCallback = Box<dyn Fn(&Task) + Send + Sync>;
type TaskFailedCallback = Box<dyn Fn(&Task, &str) + Send + Sync>;
type PlanCallback = Box<dyn Fn(&Plan) + Send + Sync>;

#[derive(Default)]
pub struct TaskScheduler {
    plan: Option<Plan>,
    replan_count: u32,
    current_task_id: Option<String>,
    on_task_start: Option<TaskCallback>,
    on_task_complete: Option<TaskCallback>,
    on_task_failed: Option<TaskFailedCallback>,
    on_plan_complete: Option<PlanCallback>,
}

impl TaskScheduler {
    pub const MAX_REPLAN_COUNT: u32 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn current_task(&self) -> Option<&Task> {
        let id = self.current_task_id.as_deref()?;
        self.plan.as_ref()?.get_task(id)
    }

    pub fn load_plan(&mut self, plan: Plan) {
        tracing::info!("plan loaded: {} with {} tasks", plan.id, plan.tasks.len());
        self.plan = Some(plan);
        self.current_task_id = None;
    }

    /// Replace the plan after a replan. Version continuity is enforced
    /// here: the new plan continues from the old one.
    pub fn replace_plan(&mut self, mut new_plan: Plan) {
        if let Some(old) = &self.plan {
            if new_plan.version <= old.version {
                new_plan.version = old.version + 1;
            }
        }
        self.replan_count += 1;
        tracing::info!(
            "plan replaced: version {}, replan count {}",
            new_plan.version,
            self.replan_count
        );
        self.plan = Some(new_plan);
        self.current_task_id = None;
    }

    pub fn is_complete(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.is_complete(),
            None => true,
        }
    }

    pub fn is_blocked(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.is_blocked(),
            None => false,
        }
    }

    pub fn ready_tasks(&self) -> Vec<Task> {
        match &self.plan {
            Some(plan) => plan.ready_tasks().into_iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Pending tasks that are not ready: waiting on unfinished deps.
    pub fn blocked_tasks(&self) -> Vec<Task> {
        let plan = match &self.plan {
            Some(plan) => plan,
            None => return Vec::new(),
        };
        let ready_ids: Vec<&str> = plan.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        plan.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && !ready_ids.contains(&t.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn start_task(&mut self, task_id: &str) -> Option<Task> {
        let plan = self.plan.as_mut()?;
        let task = plan.get_task_mut(task_id)?;
        if task.status != TaskStatus::Pending {
            tracing::warn!(
                "task {} is not pending (status {})",
                task_id,
                task.status.as_str()
            );
            return None;
        }
        task.mark_running();
        let snapshot = task.clone();
        plan.touch();
        self.current_task_id = Some(task_id.to_string());

        tracing::info!("task started: {} ({})", snapshot.title, task_id);
        if let Some(cb) = &self.on_task_start {
            cb(&snapshot);
        }
        Some(snapshot)
    }

    pub fn complete_task(&mut self, task_id: &str, output: &str) -> Option<Task> {
        let plan = self.plan.as_mut()?;
        let task = plan.get_task_mut(task_id)?;
        task.mark_success(output);
        let snapshot = task.clone();
        plan.touch();
        if self.current_task_id.as_deref() == Some(task_id) {
            self.current_task_id = None;
        }

        tracing::info!("task completed: {} ({})", snapshot.title, task_id);
        if let Some(cb) = &self.on_task_complete {
            cb(&snapshot);
        }
        if let Some(plan) = &self.plan {
            if plan.is_complete() {
                if let Some(cb) = &self.on_plan_complete {
                    cb(plan);
                }
            }
        }
        Some(snapshot)
    }

    /// Mark a task failed and decide what happens next. Retry resets
    /// the task to pending; skip only applies to optional tasks.
    pub fn fail_task(&mut self, task_id: &str, error: &str) -> (Option<Task>, ReplanDecision) {
        let plan = match self.plan.as_mut() {
            Some(plan) => plan,
            None => return (None, ReplanDecision::Abort),
        };
        let task = match plan.get_task_mut(task_id) {
            Some(task) => task,
            None => {
                tracing::error!("task not found: {}", task_id);
                return (None, ReplanDecision::Abort);
            }
        };

        task.mark_error(error);
        let failed_snapshot = task.clone();
        plan.touch();
        if self.current_task_id.as_deref() == Some(task_id) {
            self.current_task_id = None;
        }

        tracing::warn!(
            "task failed: {} ({}), error: {}",
            failed_snapshot.title,
            task_id,
            error
        );
        if let Some(cb) = &self.on_task_failed {
            cb(&failed_snapshot, error);
        }

        let decision = self.decide_on_failure(task_id);
        tracing::info!("failure decision for {}: {}", task_id, decision.as_str());
        (Some(failed_snapshot), decision)
    }

    fn decide_on_failure(&mut self, task_id: &str) -> ReplanDecision {
        let plan = match self.plan.as_mut() {
            Some(plan) => plan,
            None => return ReplanDecision::Abort,
        };
        let task = match plan.get_task_mut(task_id) {
            Some(task) => task,
            None => return ReplanDecision::Abort,
        };

        if task.can_retry() {
            task.reset_for_retry();
            return ReplanDecision::Retry;
        }
        if task.is_optional {
            task.mark_skipped();
            return ReplanDecision::Skip;
        }
        if self.replan_count < Self::MAX_REPLAN_COUNT {
            return ReplanDecision::Replan;
        }
        ReplanDecision::Human
    }

    pub fn retry_task(&mut self, task_id: &str) -> Option<Task> {
        let plan = self.plan.as_mut()?;
        let task = plan.get_task_mut(task_id)?;
        if !task.can_retry() {
            tracing::warn!("task {} cannot be retried", task_id);
            return None;
        }
        task.reset_for_retry();
        let snapshot = task.clone();
        plan.touch();
        Some(snapshot)
    }

    pub fn skip_task(&mut self, task_id: &str) -> Option<Task> {
        let plan = self.plan.as_mut()?;
        let task = plan.get_task_mut(task_id)?;
        task.mark_skipped();
        let snapshot = task.clone();
        plan.touch();
        Some(snapshot)
    }

    pub fn progress(&self) -> PlanProgress {
        match &self.plan {
            Some(plan) => plan.progress(),
            None => PlanProgress {
                total: 0,
                completed: 0,
                failed: 0,
                running: 0,
                skipped: 0,
                pending: 0,
                percentage: 0,
            },
        }
    }

    // ── Callback registration ─────────────────────────────────────────

    pub fn on_task_start(&mut self, callback: TaskCallback) {
        self.on_task_start = Some(callback);
    }

    pub fn on_task_complete(&mut self, callback: TaskCallback) {
        self.on_task_complete = Some(callback);
    }

    pub fn on_task_failed(&mut self, callback: TaskFailedCallback) {
        self.on_task_failed = Some(callback);
    }

    pub fn on_plan_complete(&mut self, callback: PlanCallback) {
        self.on_plan_complete = Some(callback);
    }
}
