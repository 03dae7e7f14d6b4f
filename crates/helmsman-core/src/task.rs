//! Atomic tasks and the plan DAG.
//!
//! Tasks refer to siblings only by string id; the plan owns the task
//! list. A task is *ready* when it is pending and every dependency is
//! success or skipped.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Task status. Values map 1:1 to the UI node palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// Success and skipped both count as done for dependency purposes.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// How strictly a task's output is validated before it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    #[default]
    Generic,
    Financial,
}

impl ValidationLevel {
    /// Domain detection by keyword. Financial queries get the stricter
    /// numeric-evidence check.
    pub fn for_query(text: &str) -> Self {
        const FINANCIAL_KEYWORDS: &[&str] = &[
            "stock", "share price", "revenue", "earnings", "dividend", "portfolio",
            "valuation", "market cap", "p/e", "financial", "balance sheet",
        ];
        let lower = text.to_lowercase();
        if FINANCIAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            Self::Financial
        } else {
            Self::Generic
        }
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Atomic unit of work: single purpose, explicit acceptance criteria,
/// declared dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub tools_hint: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub validation_level: ValidationLevel,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: String::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            tools_hint: Vec::new(),
            started_at: None,
            completed_at: None,
            output: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            is_optional: false,
            validation_level: ValidationLevel::Generic,
        }
    }

    pub fn can_start(&self, completed_ids: &HashSet<String>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.depends_on.iter().all(|dep| completed_ids.contains(dep))
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_success(&mut self, output: impl Into<String>) {
        self.status = TaskStatus::Success;
        self.completed_at = Some(Utc::now());
        self.output = Some(output.into());
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Error;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        self.retry_count += 1;
    }

    pub fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Error && self.retry_count < self.max_retries
    }

    /// Reset back to pending for a retry. The retry count is preserved.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Wire view with camelCase keys matching the plan JSON schema.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "status": self.status.as_str(),
            "dependsOn": self.depends_on,
            "acceptanceCriteria": self.acceptance_criteria,
            "toolsHint": self.tools_hint,
            "metadata": {
                "startTime": self.started_at.map(|t| t.timestamp_millis()),
                "endTime": self.completed_at.map(|t| t.timestamp_millis()),
                "duration": self.duration_ms(),
                "output": self.output,
                "errorMessage": self.error_message,
            }
        })
    }
}

/// Progress statistics for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub skipped: usize,
    pub pending: usize,
    pub percentage: u32,
}

/// Container for the task DAG. Owns the tasks; dependency edges are id
/// references within the same plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub tasks: Vec<Task>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(id: impl Into<String>, goal: impl Into<String>, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            goal: goal.into(),
            tasks,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn get_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn completed_task_ids(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_done())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Tasks whose dependencies are all satisfied.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let done = self.completed_task_ids();
        self.tasks.iter().filter(|t| t.can_start(&done)).collect()
    }

    pub fn running_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Error)
            .collect()
    }

    /// Complete when every task is success or skipped.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_done())
    }

    /// Blocked when not complete, some task failed, and nothing is ready.
    pub fn is_blocked(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        let has_failed = self.tasks.iter().any(|t| t.status == TaskStatus::Error);
        has_failed && self.ready_tasks().is_empty()
    }

    pub fn progress(&self) -> PlanProgress {
        let total = self.tasks.len();
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Error)
            .count();
        let running = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        let skipped = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Skipped)
            .count();
        let pending = total - completed - failed - running - skipped;
        let percentage = if total > 0 {
            (100 * (completed + skipped) / total) as u32
        } else {
            0
        };
        PlanProgress {
            total,
            completed,
            failed,
            running,
            skipped,
            pending,
            percentage,
        }
    }

    /// Wire view matching the plan JSON schema.
    pub fn to_json(&self) -> Value {
        json!({
            "planId": self.id,
            "goal": self.goal,
            "version": self.version,
            "tasks": self.tasks.iter().map(|t| t.to_json()).collect::<Vec<_>>(),
            "progress": self.progress(),
            "createdAt": self.created_at.timestamp_millis(),
            "updatedAt": self.updated_at.timestamp_millis(),
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The scheduler's response to a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplanDecision {
    Retry,
    Skip,
    Replan,
    Abort,
    Human,
}

impl ReplanDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Replan => "replan",
            Self::Abort => "abort",
            Self::Human => "human",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_chain() -> Plan {
        let mut t3 = Task::new("t3", "compose", "compose report");
        t3.depends_on = vec!["t1".into(), "t2".into()];
        Plan::new(
            "plan_1",
            "compare things",
            vec![
                Task::new("t1", "fetch a", "fetch a"),
                Task::new("t2", "fetch b", "fetch b"),
                t3,
            ],
        )
    }

    #[test]
    fn test_ready_tasks_respect_dependencies() {
        let mut plan = plan_with_chain();
        let ready: Vec<_> = plan.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["t1", "t2"]);

        plan.get_task_mut("t1").unwrap().mark_success("a");
        assert!(!plan
            .ready_tasks()
            .iter()
            .any(|t| t.id == "t3"));

        plan.get_task_mut("t2").unwrap().mark_success("b");
        let ready: Vec<_> = plan.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["t3"]);
    }

    #[test]
    fn test_single_task_plan_completes() {
        let mut plan = Plan::new("plan_x", "g", vec![Task::new("t1", "only", "only")]);
        assert_eq!(plan.ready_tasks().len(), 1);
        plan.get_task_mut("t1").unwrap().mark_success("done");
        assert!(plan.is_complete());
        assert_eq!(plan.progress().percentage, 100);
    }

    #[test]
    fn test_skipped_counts_as_done() {
        let mut plan = plan_with_chain();
        plan.get_task_mut("t1").unwrap().mark_skipped();
        plan.get_task_mut("t2").unwrap().mark_success("b");
        let ready: Vec<_> = plan.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["t3"]);
    }

    #[test]
    fn test_blocked_when_failed_and_nothing_ready() {
        let mut plan = plan_with_chain();
        plan.get_task_mut("t1").unwrap().mark_success("a");
        {
            let t2 = plan.get_task_mut("t2").unwrap();
            t2.retry_count = t2.max_retries;
            t2.mark_error("boom");
        }
        assert!(!plan.is_complete());
        assert!(plan.is_blocked());
    }

    #[test]
    fn test_retry_lifecycle() {
        let mut task = Task::new("t1", "x", "x");
        task.mark_running();
        task.mark_error("boom");
        assert_eq!(task.retry_count, 1);
        assert!(task.can_retry());

        task.reset_for_retry();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.error_message.is_none());

        for _ in 0..3 {
            task.mark_running();
            task.mark_error("boom");
            if task.can_retry() {
                task.reset_for_retry();
            }
        }
        assert!(!task.can_retry());
    }

    #[test]
    fn test_json_view_uses_camel_case() {
        let plan = plan_with_chain();
        let v = plan.to_json();
        assert_eq!(v["planId"], "plan_1");
        assert_eq!(v["tasks"][2]["dependsOn"][0], "t1");
        assert!(v["tasks"][0]["acceptanceCriteria"].is_string());
        assert!(v["createdAt"].is_i64());
        assert_eq!(v["progress"]["total"], 3);
    }

    #[test]
    fn test_validation_level_detection() {
        assert_eq!(
            ValidationLevel::for_query("Compare the revenue of two companies"),
            ValidationLevel::Financial
        );
        assert_eq!(
            ValidationLevel::for_query("Write a haiku about rain"),
            ValidationLevel::Generic
        );
    }
}
