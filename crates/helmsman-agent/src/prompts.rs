//! Prompt templates.

/// System prompt for the planner LLM calls.
pub const PLANNER_SYSTEM_PROMPT: &str =
    "You are a precise task planner. Output only valid JSON.";

/// Prompt for generating a task plan. Placeholders: goal, context.
pub fn plan_generation_prompt(goal: &str, context: &str) -> String {
    format!(
        r#"You are a task planning assistant. Break down the user's goal into atomic, executable tasks.

## Rules for Task Decomposition:
1. **Atomic**: Each task should do ONE thing only
2. **Verifiable**: Each task must have clear acceptance criteria
3. **Independent**: Tasks should be as independent as possible
4. **Ordered**: Define dependencies between tasks (what must complete before what)

## Task Structure:
Each task must have:
- `id`: Unique identifier (e.g., "t1", "t2")
- `title`: Short name (5-10 words)
- `description`: What needs to be done (1-2 sentences)
- `acceptance_criteria`: How to know it's done (specific, measurable)
- `depends_on`: List of task IDs that must complete first (empty [] if none)
- `tools_hint`: Suggested tools to use (e.g., ["web_search", "read_url"])

## Output Format:
Return a JSON object:
```json
{{
  "goal": "Restate the user's goal",
  "tasks": [
    {{
      "id": "t1",
      "title": "Task title",
      "description": "What to do",
      "acceptance_criteria": "How to verify completion",
      "depends_on": [],
      "tools_hint": ["web_search"]
    }}
  ]
}}
```

## User's Goal:
{goal}

## Context (if any):
{context}

Now generate the task plan as JSON:"#
    )
}

/// Prompt for replanning after a failure.
pub fn replan_prompt(
    previous_plan_json: &str,
    failed_task: &str,
    error: &str,
    completed_tasks: &str,
) -> String {
    format!(
        r#"The previous plan failed. Create a revised plan.

## Previous Plan:
{previous_plan_json}

## Failure Information:
- Failed Task: {failed_task}
- Error: {error}
- Completed Tasks: {completed_tasks}

## Rules:
1. Keep completed tasks as-is (don't redo them)
2. Modify or add tasks to work around the failure
3. Consider alternative approaches
4. If the original approach is fundamentally flawed, suggest a different strategy

## Output the revised plan as JSON (same format as before):"#
    )
}

/// Recovery prompt injected after repeated same-kind errors.
pub fn error_recovery_prompt(count: usize) -> String {
    format!(
        "[System] The same kind of error has now occurred {count} times. \
         Stop and re-read the task plan before acting again. Consider a \
         different tool or a different approach entirely."
    )
}

/// Findings reminder injected by the 2-Action rule.
pub fn findings_reminder_prompt() -> String {
    "[System] You have made 2 search-style tool calls since last recording \
     anything. Write the concrete facts you learned into your findings \
     before searching further."
        .to_string()
}

/// System prompt for code-generation-only turns on the code path.
pub const CODE_GENERATION_SYSTEM_PROMPT: &str =
    "You are a code generator. Output only executable Python code.";

pub fn code_generation_prompt(query: &str) -> String {
    format!(
        r#"You are a code generator. Generate Python code to accomplish the following task.

Task: {query}

Rules:
1. Output ONLY the Python code, no explanation
2. The code should print the final result to stdout
3. Use only the standard library and these packages: pandas, numpy, requests, bs4, json, csv
4. Do NOT use: os, subprocess, sys, eval, exec, open (for security)
5. Make the code self-contained and executable

Output the code wrapped in ```python and ``` markers."#
    )
}

/// Inner system prompt for executing a single task.
pub fn task_system_prompt(
    title: &str,
    description: &str,
    acceptance_criteria: &str,
    tools_hint: &[String],
    tool_descriptions: &[(String, String)],
) -> String {
    let tools_section = if tool_descriptions.is_empty() {
        "None".to_string()
    } else {
        tool_descriptions
            .iter()
            .map(|(name, desc)| format!("- {}: {}", name, desc))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let hint_section = if tools_hint.is_empty() {
        String::new()
    } else {
        format!("\nSuggested tools: {}", tools_hint.join(", "))
    };

    format!(
        r#"You are an execution agent working on one task.

## Task
{title}

## Description
{description}

## Acceptance Criteria
{acceptance_criteria}
{hint_section}

## Available Tools
{tools_section}

## Protocol
To call a tool, emit a fenced block:
```tool_call
{{"tool": "<name>", "args": {{...}}}}
```
You may emit several tool_call blocks in one reply; independent calls run in parallel.

When the acceptance criteria are met, emit the final result:
```final_answer
<your answer>
```

Work step by step. Do not claim completion without evidence."#
    )
}

/// Outer system prompt for the single-turn run loop.
pub fn agent_system_prompt(tool_descriptions: &[(String, String)]) -> String {
    let tools_section = if tool_descriptions.is_empty() {
        "None".to_string()
    } else {
        tool_descriptions
            .iter()
            .map(|(name, desc)| format!("- {}: {}", name, desc))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"You are an autonomous agent. Work toward the user's goal step by
step, using tools for anything you cannot answer from knowledge alone.

## Available Tools
{tools_section}

## Protocol
To call a tool, emit a fenced block:
```tool_call
{{"tool": "<name>", "args": {{...}}}}
```
You may emit several tool_call blocks in one reply.

When the goal is accomplished, emit:
```final_answer
<your answer>
```

## Working Discipline
- Record concrete findings as you go; do not rely on memory alone.
- After a failure, read the error and change your approach instead of
  repeating the same call.
- Call `exit` with an exit_code when you need to end the session early."#
    )
}

/// Prompt for synthesising multiple task outputs into one answer.
pub fn answer_synthesis_prompt(query: &str, sections: &str, style_instruction: &str) -> String {
    format!(
        r#"Assemble the final answer for the user from the task outputs below.

## Original Request
{query}

## Task Outputs
{sections}

## Instructions
{style_instruction}
Merge the outputs into one coherent answer. Resolve contradictions,
remove duplication, and do not invent facts that are not in the outputs."#
    )
}
