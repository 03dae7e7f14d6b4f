//! Planning-based execution: plan, schedule, stream tasks in parallel,
//! replan on failure, assemble the answer.
//!
//! Flow control belongs to the scheduler; content generation belongs to
//! the model. Parallel ready tasks stream through a bounded merge
//! channel with one worker per task and counted end-of-task sentinels.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::mpsc;

use helmsman_core::{Plan, ReplanDecision, SseEvent, SseEventType, Task};

use crate::answer::{AnswerStyle, TaskOutput};
use crate::planning::PlanEventEmitter;
use crate::task_executor::TaskResult;

use super::AgentEngine;

/// Bound for the parallel event merge channel.
const MERGE_CHANNEL_CAPACITY: usize = 64;

/// Scheduler output kept for the final answer, truncated.
const SCHEDULER_OUTPUT_CHARS: usize = 500;

impl AgentEngine {
    pub(crate) async fn execute_planning(
        &mut self,
        query: &str,
        events: &mpsc::Sender<SseEvent>,
    ) -> anyhow::Result<()> {
        tracing::info!("=== planning-based execution started ===");
        let started = std::time::Instant::now();

        self.scheduler = crate::planning::TaskScheduler::new();
        self.task_outputs.clear();
        self.iteration_count = 0;

        // Phase 1: planning.
        self.send(
            events,
            SseEvent::status("planning", "Analyzing the goal and building a plan"),
        )
        .await;

        let plan = match self.planner.plan(query, "").await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("planning failed: {}", e);
                self.send(events, SseEvent::error(&format!("planning failed: {}", e), false))
                    .await;
                self.send(
                    events,
                    SseEvent::done(json!({
                        "status": "error",
                        "message": format!("planning failed: {}", e),
                    })),
                )
                .await;
                return Ok(());
            }
        };

        {
            let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
            pad.write_task_plan(&format_plan_text(&plan));
        }
        self.scheduler.load_plan(plan);
        if let Some(plan) = self.scheduler.plan() {
            self.send(events, PlanEventEmitter::plan_created(plan)).await;
        }

        // Phase 2: execution loop.
        self.send(events, SseEvent::status("executing", "Executing tasks"))
            .await;

        let mut aborted = false;
        while !self.scheduler.is_complete() {
            if self.stopped() {
                tracing::info!("planning loop cancelled");
                aborted = true;
                break;
            }
            self.iteration_count += 1;
            if self.iteration_count > self.config.max_iterations {
                tracing::warn!("max iterations reached: {}", self.config.max_iterations);
                break;
            }
            if started.elapsed().as_secs() > self.config.timeout_seconds {
                tracing::warn!("session timeout after {}s", self.config.timeout_seconds);
                self.send(
                    events,
                    SseEvent::error("session timeout; try splitting the task", false),
                )
                .await;
                aborted = true;
                break;
            }

            let ready = self.scheduler.ready_tasks();
            if ready.is_empty() {
                if self.scheduler.is_blocked() {
                    tracing::error!("plan is blocked");
                    self.send(
                        events,
                        SseEvent::error(
                            "task execution is blocked and may need human intervention",
                            false,
                        ),
                    )
                    .await;
                    aborted = true;
                }
                break;
            }

            let abort = if ready.len() > 1 && self.config.enable_parallel_tasks {
                self.execute_ready_parallel(ready, events).await
            } else {
                let task_id = ready[0].id.clone();
                self.execute_ready_single(&task_id, events).await
            };
            if abort {
                aborted = true;
                break;
            }

            if let Some(plan) = self.scheduler.plan() {
                self.send(events, PlanEventEmitter::progress_update(plan)).await;
            }
            if self.checkpoints.should_save(self.iteration_count) {
                self.save_checkpoint();
            }
        }

        // Phase 3: answer assembly and completion.
        let complete = self.scheduler.is_complete();
        if (complete || !self.task_outputs.is_empty()) && !aborted {
            self.send(events, SseEvent::answer_generating("Assembling the final answer"))
                .await;

            let style = AnswerStyle::detect(query);
            let answer = self
                .answer_agent
                .generate(&self.task_outputs, query, self.task_outputs.len() > 1, style)
                .await;
            self.send(
                events,
                SseEvent::new(SseEventType::AnswerReady, answer.to_json()),
            )
            .await;

            let progress = self.scheduler.progress();
            self.send(
                events,
                SseEvent::done(json!({
                    "status": if complete { "success" } else { "incomplete" },
                    "message": if complete { "all tasks completed" } else { "tasks partially completed" },
                    "answer": answer.content,
                    "summary": answer.summary,
                    "iterations": self.iteration_count,
                    "progress": progress,
                })),
            )
            .await;
        } else {
            let progress = self.scheduler.progress();
            self.send(
                events,
                SseEvent::done(json!({
                    "status": "incomplete",
                    "message": "task execution did not complete",
                    "iterations": self.iteration_count,
                    "progress": progress,
                })),
            )
            .await;
        }

        Ok(())
    }

    /// Run one ready task, forwarding its stream tagged with the task
    /// id. The task's own DONE is swallowed; the scheduler events carry
    /// the terminal status. Returns whether the outer loop must abort.
    pub(crate) async fn execute_ready_single(
        &mut self,
        task_id: &str,
        events: &mpsc::Sender<SseEvent>,
    ) -> bool {
        let Some(task) = self.scheduler.start_task(task_id) else {
            return false;
        };
        self.send(events, PlanEventEmitter::task_start(&task)).await;

        let context = self.task_context();
        let executor = self.task_executor.clone();
        let (tx, mut rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);
        let run_task = task.clone();
        let run = async move {
            let result = executor.execute_stream(&run_task, &context, &tx).await;
            drop(tx);
            result
        };
        let forward = async {
            while let Some(event) = rx.recv().await {
                if event.event_type != SseEventType::Done {
                    let _ = events.send(event.with_task_id(task_id)).await;
                }
            }
        };
        let (result, ()) = tokio::join!(run, forward);

        self.apply_task_result(&task, result, events).await
    }

    /// Run several independent ready tasks concurrently. Events from
    /// the sub-streams are multiplexed through a bounded queue, each
    /// tagged with its taskId; end-of-task sentinels drive completion
    /// accounting.
    pub(crate) async fn execute_ready_parallel(
        &mut self,
        ready: Vec<Task>,
        events: &mpsc::Sender<SseEvent>,
    ) -> bool {
        tracing::info!("executing {} tasks in parallel", ready.len());

        let mut started: Vec<Task> = Vec::new();
        for task in &ready {
            if let Some(snapshot) = self.scheduler.start_task(&task.id) {
                self.send(events, PlanEventEmitter::task_start(&snapshot)).await;
                started.push(snapshot);
            }
        }
        if started.is_empty() {
            return false;
        }

        type MergeItem = (String, Option<SseEvent>);
        let (merge_tx, mut merge_rx) = mpsc::channel::<MergeItem>(MERGE_CHANNEL_CAPACITY);
        let mut handles = Vec::with_capacity(started.len());

        for task in started.clone() {
            let executor = self.task_executor.clone();
            let context = self.task_context();
            let merge_tx = merge_tx.clone();
            handles.push(tokio::spawn(async move {
                let task_id = task.id.clone();
                let (tx, mut rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);
                let run = async {
                    let result = executor.execute_stream(&task, &context, &tx).await;
                    drop(tx);
                    result
                };
                let pump = async {
                    while let Some(event) = rx.recv().await {
                        let _ = merge_tx.send((task_id.clone(), Some(event))).await;
                    }
                };
                let (result, ()) = tokio::join!(run, pump);
                // End-of-task sentinel.
                let _ = merge_tx.send((task_id.clone(), None)).await;
                (task_id, result)
            }));
        }
        drop(merge_tx);

        let total = started.len();
        let mut finished = 0usize;
        while finished < total {
            match merge_rx.recv().await {
                Some((task_id, Some(event))) => {
                    if event.event_type != SseEventType::Done {
                        let _ = events.send(event.with_task_id(&task_id)).await;
                    }
                }
                Some((_, None)) => finished += 1,
                None => break,
            }
        }

        let mut results: HashMap<String, TaskResult> = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok((task_id, result)) => {
                    results.insert(task_id, result);
                }
                Err(e) => tracing::error!("task worker panicked: {}", e),
            }
        }

        // Apply results in the deterministic start order.
        let mut abort = false;
        for task in started {
            let Some(result) = results.remove(&task.id) else {
                let (_, decision) = self.scheduler.fail_task(&task.id, "task worker crashed");
                if matches!(decision, ReplanDecision::Human | ReplanDecision::Abort) {
                    abort = true;
                }
                continue;
            };
            if self.apply_task_result(&task, result, events).await {
                abort = true;
            }
        }
        abort
    }

    /// Feed one task's result into the scheduler and emit the matching
    /// events. Returns whether the outer loop must abort.
    async fn apply_task_result(
        &mut self,
        task: &Task,
        result: TaskResult,
        events: &mpsc::Sender<SseEvent>,
    ) -> bool {
        if result.is_success() {
            let stored: String = result.output.chars().take(SCHEDULER_OUTPUT_CHARS).collect();
            let completed = self.scheduler.complete_task(&task.id, &stored);
            self.task_outputs.push(TaskOutput {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                output: result.output,
                success: true,
            });
            if let Some(completed) = completed {
                self.send(events, PlanEventEmitter::task_complete(&completed)).await;
            }
            self.send(
                events,
                SseEvent::content(&format!("\n✅ {} completed\n", task.title))
                    .with_task_id(&task.id),
            )
            .await;
            return false;
        }

        let error = result
            .error
            .unwrap_or_else(|| format!("task {}", result.status.as_str()));
        let (failed, decision) = self.scheduler.fail_task(&task.id, &error);
        if let Some(failed) = &failed {
            self.send(events, PlanEventEmitter::task_failed(failed)).await;
        }
        self.send(
            events,
            SseEvent::new(
                SseEventType::Error,
                json!({
                    "message": format!("task '{}' failed: {}", task.title, error),
                    "taskId": task.id,
                    "decision": decision.as_str(),
                    "recoverable": !matches!(decision, ReplanDecision::Human | ReplanDecision::Abort),
                }),
            ),
        )
        .await;

        match decision {
            ReplanDecision::Replan => {
                let failed_task = failed.unwrap_or_else(|| task.clone());
                if let Err(message) = self.handle_replan(&failed_task, &error, events).await {
                    self.send(events, SseEvent::error(&message, false)).await;
                    return true;
                }
                false
            }
            // Retry reset the task to pending; skip marked it skipped.
            // Either way the loop keeps scheduling.
            ReplanDecision::Retry | ReplanDecision::Skip => false,
            ReplanDecision::Human | ReplanDecision::Abort => true,
        }
    }

    /// Ask the planner for a revised plan and swap it in.
    async fn handle_replan(
        &mut self,
        failed_task: &Task,
        error: &str,
        events: &mpsc::Sender<SseEvent>,
    ) -> Result<(), String> {
        self.send(events, SseEvent::thinking("Replanning...\n")).await;

        let current = self
            .scheduler
            .plan()
            .cloned()
            .ok_or_else(|| "no plan loaded to replan".to_string())?;

        let new_plan = self
            .planner
            .replan(&current, failed_task, error)
            .await
            .map_err(|e| format!("replan failed: {}", e))?;

        self.scheduler.replace_plan(new_plan);
        let plan = self.scheduler.plan().expect("plan just replaced");
        {
            let pad = self.scratchpad.lock().unwrap_or_else(|e| e.into_inner());
            pad.write_task_plan(&format_plan_text(plan));
        }
        self.send(events, PlanEventEmitter::plan_revised(plan, error)).await;
        self.send(
            events,
            SseEvent::content(&format!("\n🔄 Plan revised, new version: v{}\n", plan.version)),
        )
        .await;
        Ok(())
    }
}

/// Human-readable plan text for the task_plan file.
fn format_plan_text(plan: &Plan) -> String {
    let mut lines = vec![format!("Goal: {}", plan.goal), String::new()];
    for (idx, task) in plan.tasks.iter().enumerate() {
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (depends on {})", task.depends_on.join(", "))
        };
        let mut line = format!("Step {}: {}{}", idx + 1, task.title, deps);
        if !task.description.is_empty() {
            line.push_str(&format!(" — {}", task.description));
        }
        if !task.acceptance_criteria.is_empty() {
            line.push_str(&format!(" [Acceptance: {}]", task.acceptance_criteria));
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::Task;

    #[test]
    fn test_format_plan_text() {
        let mut t2 = Task::new("t2", "second", "do the second thing");
        t2.depends_on = vec!["t1".into()];
        t2.acceptance_criteria = "it is done".into();
        let plan = Plan::new("p", "the goal", vec![Task::new("t1", "first", ""), t2]);
        let text = format_plan_text(&plan);
        assert!(text.starts_with("Goal: the goal"));
        assert!(text.contains("Step 1: first"));
        assert!(text.contains("Step 2: second (depends on t1)"));
        assert!(text.contains("[Acceptance: it is done]"));
    }
}
