//! Plan recitation.
//!
//! A short plan-status block appended to the context at the end of each
//! outer turn, so the goal survives a long context. Pure over its
//! inputs: same plan and scheduler snapshots, same text.

use helmsman_core::{Plan, Task, TaskStatus};

use super::TaskScheduler;

pub struct PlanReciter;

impl PlanReciter {
    const MAX_COMPLETED_TASKS: usize = 3;
    const MAX_BLOCKED_TASKS: usize = 2;

    pub fn generate(plan: &Plan, scheduler: &TaskScheduler) -> String {
        let progress = plan.progress();
        let current = scheduler.current_task();
        let ready = scheduler.ready_tasks();
        let blocked = scheduler.blocked_tasks();

        let mut lines = vec![
            String::new(),
            "---".into(),
            String::new(),
            format!("🎯 **Goal**: {}", plan.goal),
            String::new(),
            format!(
                "**Progress**: {}/{} tasks ({}%)",
                progress.completed, progress.total, progress.percentage
            ),
            String::new(),
        ];

        let completed: Vec<&Task> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .collect();
        if !completed.is_empty() {
            lines.push("**Completed**:".into());
            let shown = completed.len().min(Self::MAX_COMPLETED_TASKS);
            for task in &completed[completed.len() - shown..] {
                lines.push(format!("  ✅ {}", task.title));
            }
            if completed.len() > Self::MAX_COMPLETED_TASKS {
                lines.push(format!(
                    "  ... and {} more",
                    completed.len() - Self::MAX_COMPLETED_TASKS
                ));
            }
            lines.push(String::new());
        }

        if let Some(task) = current {
            lines.push("**Current Task**:".into());
            lines.push(format!("  🔄 {}", task.title));
            if !task.description.is_empty() {
                let desc: String = task.description.chars().take(150).collect();
                let ellipsis = if task.description.chars().count() > 150 { "..." } else { "" };
                lines.push(format!("     {}{}", desc, ellipsis));
            }
            if !task.acceptance_criteria.is_empty() {
                lines.push(format!("     *Acceptance*: {}", task.acceptance_criteria));
            }
            if !task.tools_hint.is_empty() {
                lines.push(format!("     *Suggested tools*: {}", task.tools_hint.join(", ")));
            }
            lines.push(String::new());
        } else if let Some(next) = ready.first() {
            lines.push("**Next Task**:".into());
            lines.push(format!("  ⏳ {}", next.title));
            if !next.description.is_empty() {
                lines.push(format!(
                    "     {}",
                    next.description.chars().take(100).collect::<String>()
                ));
            }
            if !next.acceptance_criteria.is_empty() {
                lines.push(format!("     *Acceptance*: {}", next.acceptance_criteria));
            }
            lines.push(String::new());
        }

        if !blocked.is_empty() {
            lines.push("**Blocked**:".into());
            for task in blocked.iter().take(Self::MAX_BLOCKED_TASKS) {
                lines.push(format!(
                    "  ⏸️ {} (waiting for: {})",
                    task.title,
                    task.depends_on.join(", ")
                ));
            }
            if blocked.len() > Self::MAX_BLOCKED_TASKS {
                lines.push(format!(
                    "  ... and {} more",
                    blocked.len() - Self::MAX_BLOCKED_TASKS
                ));
            }
            lines.push(String::new());
        }

        if let Some(task) = current {
            lines.push(format!(
                "⚠️ **FOCUS on \"{}\" until the acceptance criteria are met!**",
                task.title
            ));
        } else if let Some(next) = ready.first() {
            lines.push(format!("⚠️ **Start \"{}\" next!**", next.title));
        }

        lines.push(String::new());
        lines.push("---".into());
        lines.join("\n")
    }

    /// One-line variant for tight token budgets.
    pub fn generate_minimal(plan: &Plan, scheduler: &TaskScheduler) -> String {
        let progress = plan.progress();
        if let Some(current) = scheduler.current_task() {
            return format!(
                "[Plan: {}/{}] Current: {}",
                progress.completed, progress.total, current.title
            );
        }
        if let Some(next) = scheduler.ready_tasks().first() {
            return format!(
                "[Plan: {}/{}] Next: {}",
                progress.completed, progress.total, next.title
            );
        }
        format!("[Plan: {}/{}]", progress.completed, progress.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::Task;

    fn scheduler() -> TaskScheduler {
        let mut t2 = Task::new("t2", "second step", "the follow-up");
        t2.depends_on = vec!["t1".into()];
        let mut t1 = Task::new("t1", "first step", "the opener");
        t1.acceptance_criteria = "opener done".into();
        let plan = Plan::new("plan_1", "do both steps", vec![t1, t2]);
        let mut scheduler = TaskScheduler::new();
        scheduler.load_plan(plan);
        scheduler
    }

    #[test]
    fn test_recitation_shows_goal_progress_and_next() {
        let scheduler = scheduler();
        let text = PlanReciter::generate(scheduler.plan().unwrap(), &scheduler);
        assert!(text.contains("**Goal**: do both steps"));
        assert!(text.contains("0/2 tasks"));
        assert!(text.contains("⏳ first step"));
        assert!(text.contains("*Acceptance*: opener done"));
        assert!(text.contains("⏸️ second step (waiting for: t1)"));
    }

    #[test]
    fn test_recitation_is_pure() {
        let mut scheduler = scheduler();
        scheduler.start_task("t1").unwrap();
        let a = PlanReciter::generate(scheduler.plan().unwrap(), &scheduler);
        let b = PlanReciter::generate(scheduler.plan().unwrap(), &scheduler);
        assert_eq!(a, b);
        assert!(a.contains("🔄 first step"));
        assert!(a.contains("FOCUS"));
    }

    #[test]
    fn test_minimal_variant() {
        let mut scheduler = scheduler();
        assert_eq!(
            PlanReciter::generate_minimal(scheduler.plan().unwrap(), &scheduler),
            "[Plan: 0/2] Next: first step"
        );
        scheduler.start_task("t1").unwrap();
        assert_eq!(
            PlanReciter::generate_minimal(scheduler.plan().unwrap(), &scheduler),
            "[Plan: 0/2] Current: first step"
        );
    }
}
