//! Plan lifecycle → SSE events.
//!
//! Payloads follow the plan JSON schema so a workflow-graph UI can
//! render nodes directly from them.

use serde_json::json;

use helmsman_core::{Plan, SseEvent, SseEventType, Task};

pub struct PlanEventEmitter;

impl PlanEventEmitter {
    pub fn plan_created(plan: &Plan) -> SseEvent {
        SseEvent::new(SseEventType::PlanCreated, plan.to_json())
    }

    pub fn plan_revised(plan: &Plan, reason: &str) -> SseEvent {
        let mut data = plan.to_json();
        data["reason"] = json!(reason);
        SseEvent::new(SseEventType::PlanRevised, data)
    }

    pub fn task_start(task: &Task) -> SseEvent {
        SseEvent::new(
            SseEventType::TaskStart,
            json!({
                "taskId": task.id,
                "status": "running",
                "startTime": task.started_at.map(|t| t.timestamp_millis()),
            }),
        )
    }

    pub fn task_complete(task: &Task) -> SseEvent {
        SseEvent::new(
            SseEventType::TaskComplete,
            json!({
                "taskId": task.id,
                "status": "success",
                "output": task.output,
                "endTime": task.completed_at.map(|t| t.timestamp_millis()),
                "duration": task.duration_ms(),
            }),
        )
    }

    pub fn task_failed(task: &Task) -> SseEvent {
        SseEvent::new(
            SseEventType::TaskFailed,
            json!({
                "taskId": task.id,
                "status": "error",
                "errorMessage": task.error_message,
                "endTime": task.completed_at.map(|t| t.timestamp_millis()),
                "retryCount": task.retry_count,
                "canRetry": task.can_retry(),
            }),
        )
    }

    pub fn task_update(task: &Task) -> SseEvent {
        SseEvent::new(SseEventType::TaskUpdate, task.to_json())
    }

    pub fn progress_update(plan: &Plan) -> SseEvent {
        let progress = plan.progress();
        SseEvent::new(
            SseEventType::ResearchProgressUpdate,
            json!({
                "phase": "executing",
                "phaseProgress": progress.percentage,
                "overallProgress": progress.percentage,
                "currentAction": format!(
                    "Executing tasks ({}/{})",
                    progress.completed, progress.total
                ),
            }),
        )
    }
}
