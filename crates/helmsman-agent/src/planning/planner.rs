//! Atomic planner: LLM generates the plan content, code validates the
//! DAG.
//!
//! Validation rejects a plan when a dependency id does not resolve,
//! when the graph has a cycle (three-colour DFS), or when no task is an
//! entry point.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use helmsman_core::{CoreError, Message, Plan, Task, TaskStatus, ValidationLevel};

use crate::llm::LlmClient;
use crate::prompts;

pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Generate a plan for the goal. The returned plan has passed DAG
    /// validation.
    pub async fn plan(&self, goal: &str, context: &str) -> Result<Plan, CoreError> {
        tracing::info!("generating plan for goal: {:.100}", goal);

        let prompt = prompts::plan_generation_prompt(
            goal,
            if context.is_empty() { "None" } else { context },
        );
        let response = self
            .llm
            .complete(
                &[Message::user(prompt)],
                Some(prompts::PLANNER_SYSTEM_PROMPT),
            )
            .await
            .map_err(|e| CoreError::Other(format!("planner LLM call failed: {}", e)))?;

        let data = Self::parse_json_response(&response.content)?;
        let plan = Self::build_plan(&data)?;
        Self::validate_plan(&plan)?;

        tracing::info!("plan generated: {} with {} tasks", plan.id, plan.tasks.len());
        Ok(plan)
    }

    /// Replan after a failure. Completed tasks carry over only if the
    /// model kept them in the new task list; the version always
    /// increments.
    pub async fn replan(
        &self,
        previous: &Plan,
        failed_task: &Task,
        error: &str,
    ) -> Result<Plan, CoreError> {
        tracing::info!("replanning after failure of '{}'", failed_task.title);

        let completed: Vec<&str> = previous
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .map(|t| t.title.as_str())
            .collect();
        let completed = if completed.is_empty() {
            "None".to_string()
        } else {
            completed.join(", ")
        };

        let prompt = prompts::replan_prompt(
            &previous.to_json().to_string(),
            &format!("{}: {}", failed_task.title, failed_task.description),
            error,
            &completed,
        );
        let response = self
            .llm
            .complete(
                &[Message::user(prompt)],
                Some(prompts::PLANNER_SYSTEM_PROMPT),
            )
            .await
            .map_err(|e| CoreError::Other(format!("replanner LLM call failed: {}", e)))?;

        let data = Self::parse_json_response(&response.content)?;
        let mut plan = Self::build_plan(&data)?;
        plan.version = previous.version + 1;
        Self::validate_plan(&plan)?;

        tracing::info!("replan complete: version {}", plan.version);
        Ok(plan)
    }

    /// Pull the JSON object out of the response, tolerating markdown
    /// fences around it.
    fn parse_json_response(content: &str) -> Result<Value, CoreError> {
        let mut text = content.trim();
        if let Some(start) = text.find("```json") {
            let rest = &text[start + 7..];
            let end = rest.find("```").unwrap_or(rest.len());
            text = rest[..end].trim();
        } else if let Some(start) = text.find("```") {
            let rest = &text[start + 3..];
            let end = rest.find("```").unwrap_or(rest.len());
            text = rest[..end].trim();
        }
        serde_json::from_str(text).map_err(|e| CoreError::Parse(format!("invalid plan JSON: {}", e)))
    }

    fn build_plan(data: &Value) -> Result<Plan, CoreError> {
        let plan_id = format!(
            "plan_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let goal = data
            .get("goal")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let default_level = ValidationLevel::for_query(&goal);

        let raw_tasks = data
            .get("tasks")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::Parse("plan JSON has no 'tasks' array".into()))?;

        let mut tasks = Vec::with_capacity(raw_tasks.len());
        for (idx, raw) in raw_tasks.iter().enumerate() {
            let id = raw
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("t{}", idx + 1));
            let title = raw
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("Untitled Task");
            let description = raw.get("description").and_then(|v| v.as_str()).unwrap_or("");

            let mut task = Task::new(id, title, description);
            task.acceptance_criteria = raw
                .get("acceptance_criteria")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            task.depends_on = string_list(raw.get("depends_on"));
            task.tools_hint = string_list(raw.get("tools_hint"));
            task.is_optional = raw
                .get("is_optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            task.validation_level = default_level;
            tasks.push(task);
        }

        Ok(Plan::new(plan_id, goal, tasks))
    }

    /// DAG validation: dependency existence, acyclicity, entry point.
    pub fn validate_plan(plan: &Plan) -> Result<(), CoreError> {
        let task_ids: std::collections::HashSet<&str> =
            plan.tasks.iter().map(|t| t.id.as_str()).collect();

        for task in &plan.tasks {
            for dep in &task.depends_on {
                if !task_ids.contains(dep.as_str()) {
                    return Err(CoreError::PlanValidation(format!(
                        "task '{}' depends on non-existent task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        if Self::has_cycle(plan) {
            return Err(CoreError::PlanValidation(
                "plan contains circular dependencies".into(),
            ));
        }

        if !plan.tasks.is_empty() && plan.tasks.iter().all(|t| !t.depends_on.is_empty()) {
            return Err(CoreError::PlanValidation(
                "plan has no entry point (all tasks have dependencies)".into(),
            ));
        }
        if plan.tasks.is_empty() {
            return Err(CoreError::PlanValidation("plan has no tasks".into()));
        }

        Ok(())
    }

    /// Three-colour DFS over the dep → dependent edges.
    fn has_cycle(plan: &Plan) -> bool {
        // 0 = unvisited, 1 = visiting, 2 = done
        let mut state: HashMap<&str, u8> =
            plan.tasks.iter().map(|t| (t.id.as_str(), 0u8)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> =
            plan.tasks.iter().map(|t| (t.id.as_str(), Vec::new())).collect();
        for task in &plan.tasks {
            for dep in &task.depends_on {
                if let Some(edges) = adjacency.get_mut(dep.as_str()) {
                    edges.push(task.id.as_str());
                }
            }
        }

        fn dfs<'a>(
            node: &'a str,
            state: &mut HashMap<&'a str, u8>,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
        ) -> bool {
            match state.get(node) {
                Some(1) => return true,
                Some(2) => return false,
                _ => {}
            }
            state.insert(node, 1);
            if let Some(neighbors) = adjacency.get(node) {
                for next in neighbors {
                    if dfs(next, state, adjacency) {
                        return true;
                    }
                }
            }
            state.insert(node, 2);
            false
        }

        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        for id in ids {
            if state.get(id) == Some(&0) && dfs(id, &mut state, &adjacency) {
                return true;
            }
        }
        false
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
