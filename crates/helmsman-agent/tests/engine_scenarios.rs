//! End-to-end engine scenarios with a scripted LLM, mock tools, a mock
//! sandbox, and a mock skill system.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use helmsman_agent::{
    AgentEngine, ExecutionMode, LlmClient, LlmResponse, SkillExecutor, SkillLoader, SkillMatch,
    SkillMatcher, SkillMetadata, SkillRegistry, SkillRunResult, SkillRunStatus, SkillSystem, Tool,
    ToolResult,
};
use helmsman_agent::{CodeSandbox, ExecutionOutcome, ExecutionRequest, ExecutionStatus};
use helmsman_core::{EngineConfig, MemoryFs, Message, Role, SseEvent, SseEventType, WorkspaceFs};

// ─── Fixtures ────────────────────────────────────────────────────────────────

/// LLM stub that answers based on what it is being asked, so parallel
/// task execution does not depend on call ordering.
struct KeyedLlm {
    plan_json: String,
    revised_plan_json: String,
}

impl Default for KeyedLlm {
    fn default() -> Self {
        Self {
            plan_json: String::new(),
            revised_plan_json: String::new(),
        }
    }
}

#[async_trait]
impl LlmClient for KeyedLlm {
    async fn complete(&self, messages: &[Message], system: Option<&str>) -> Result<LlmResponse> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let content = if let Some(system) = system {
            if system.contains("code generator") {
                "```python\nprint(sum([1,2,3,4])/4)\n```".to_string()
            } else if system.contains("task planner") {
                if last_user.contains("previous plan failed") {
                    self.revised_plan_json.clone()
                } else {
                    self.plan_json.clone()
                }
            } else {
                respond_for_task(last_user, messages)
            }
        } else if last_user.contains("Assemble the final answer") {
            "Synthesized report: the Model 3 range is 438 miles, the Model Y range is 387 miles."
                .to_string()
        } else {
            respond_for_task(last_user, messages)
        };

        Ok(LlmResponse {
            content,
            usage: None,
        })
    }
}

fn respond_for_task(last_user: &str, messages: &[Message]) -> String {
    // The inner loop's opening user message carries the task description.
    let task_text = messages
        .iter()
        .find(|m| m.role == Role::User && m.content.starts_with("Work on this task now:"))
        .map(|m| m.content.as_str())
        .unwrap_or(last_user);

    if task_text.contains("download the source page") {
        return "```tool_call\n{\"tool\": \"read_url\", \"args\": {\"url\": \"https://example.invalid\"}}\n```".to_string();
    }
    if task_text.contains("look up the Model 3 range") {
        return "```final_answer\nModel 3: 438 miles\n```".to_string();
    }
    if task_text.contains("look up the Model Y range") {
        return "```final_answer\nModel Y: 387 miles\n```".to_string();
    }
    if task_text.contains("use the cached mirror data") {
        return "```final_answer\nModel 3 (mirror): 438 miles\n```".to_string();
    }
    if task_text.contains("combine into a report") {
        return "```final_answer\nRange report: 438 vs 387 miles\n```".to_string();
    }
    if task_text.contains("Fetch https://example.invalid") {
        return "```tool_call\n{\"tool\": \"read_url\", \"args\": {\"url\": \"https://example.invalid\"}}\n```".to_string();
    }
    if task_text.contains("Given [1,2,3,4]") {
        return "```final_answer\n2.5\n```".to_string();
    }
    // Trivial default.
    "```final_answer\n4\n```".to_string()
}

struct FailingUrlTool;

#[async_trait]
impl Tool for FailingUrlTool {
    fn name(&self) -> &str {
        "read_url"
    }
    fn description(&self) -> &str {
        "reads a URL"
    }
    async fn execute(&self, _args: Value) -> ToolResult {
        ToolResult::failed("read_url", "connection refused: network unreachable")
    }
}

struct FixedSandbox {
    succeed: bool,
}

#[async_trait]
impl CodeSandbox for FixedSandbox {
    async fn execute(&self, _request: ExecutionRequest) -> ExecutionOutcome {
        if self.succeed {
            ExecutionOutcome {
                status: ExecutionStatus::Success,
                output: Some("2.5".into()),
                error: None,
                execution_time: 0.01,
            }
        } else {
            ExecutionOutcome {
                status: ExecutionStatus::Error,
                output: None,
                error: Some("NameError: name 'pd' is not defined".into()),
                execution_time: 0.01,
            }
        }
    }
}

struct PptMatcher;

#[async_trait]
impl SkillMatcher for PptMatcher {
    async fn match_query(&self, query: &str) -> Option<SkillMatch> {
        if query.to_lowercase().contains("ppt") {
            Some(SkillMatch {
                skill_id: "ppt_generator".into(),
                score: 0.93,
                reason: "keyword".into(),
                metadata: None,
            })
        } else {
            None
        }
    }
}

struct FixedLoader;

#[async_trait]
impl SkillLoader for FixedLoader {
    async fn load_l2(&self, _skill_id: &str) -> Result<String> {
        Ok("Use the generated deck in the workspace.".into())
    }
}

struct FixedSkillExecutor;

#[async_trait]
impl SkillExecutor for FixedSkillExecutor {
    fn can_execute(&self, _skill_id: &str) -> bool {
        true
    }
    async fn execute(&self, _skill_id: &str, _query: &str, _context: Value) -> SkillRunResult {
        SkillRunResult {
            status: SkillRunStatus::Success,
            data: Some(json!({"slides": 12, "file": "q3_sales.pptx"})),
            error: None,
            tokens_used: 0,
        }
    }
}

fn skill_system() -> SkillSystem {
    let mut registry = SkillRegistry::new();
    registry.register(SkillMetadata {
        id: "ppt_generator".into(),
        display_name: "PPT Generator".into(),
        description: "Generates slide decks".into(),
        keywords: vec!["ppt".into()],
        allowed_tools: vec!["write_file".into()],
        executable: true,
    });
    SkillSystem {
        registry: Arc::new(registry),
        matcher: Arc::new(PptMatcher),
        loader: Arc::new(FixedLoader),
        executor: Arc::new(FixedSkillExecutor),
    }
}

fn engine_with(llm: KeyedLlm, fs: Arc<MemoryFs>) -> AgentEngine {
    AgentEngine::new(Arc::new(llm), fs, "s1", "w1", EngineConfig::default())
}

async fn run_collecting(
    engine: &mut AgentEngine,
    query: &str,
    mode: ExecutionMode,
) -> Vec<SseEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    let run = async {
        engine.execute(query, mode, &tx).await;
        drop(tx);
    };
    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };
    let ((), events) = tokio::join!(run, collect);
    events
}

fn types(events: &[SseEvent]) -> Vec<SseEventType> {
    events.iter().map(|e| e.event_type).collect()
}

fn dones(events: &[SseEvent]) -> Vec<&SseEvent> {
    events
        .iter()
        .filter(|e| e.event_type == SseEventType::Done)
        .collect()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_direct_trivial() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine = engine_with(KeyedLlm::default(), fs);

    let events = run_collecting(&mut engine, "What is 2+2?", ExecutionMode::Auto).await;

    assert_eq!(
        types(&events),
        vec![
            SseEventType::Status,
            SseEventType::Content,
            SseEventType::Done
        ]
    );
    assert_eq!(events[0].data["phase"], "direct");
    assert_eq!(events[1].data["content"], "4");
    assert_eq!(events[2].data["status"], "success");
}

#[tokio::test]
async fn scenario_direct_tool_three_strike() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine = engine_with(KeyedLlm::default(), fs.clone());
    engine.register_tool(Arc::new(FailingUrlTool));

    let events = run_collecting(
        &mut engine,
        "Fetch https://example.invalid and summarise",
        ExecutionMode::Direct,
    )
    .await;

    let tool_calls = events
        .iter()
        .filter(|e| e.event_type == SseEventType::ToolCall)
        .count();
    let tool_results = events
        .iter()
        .filter(|e| e.event_type == SseEventType::ToolResult)
        .count();
    assert_eq!(tool_calls, 3);
    assert_eq!(tool_results, 3);

    let terminal = dones(&events);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].data["status"], "failed");
    assert!(terminal[0].data["error"]
        .as_str()
        .unwrap()
        .contains("repeated failures"));

    // Keep the failures: three ❌ lines in the progress log.
    let progress = fs.read("sessions/s1/progress.md").unwrap();
    assert_eq!(progress.matches('❌').count(), 3);

    let stats = engine.failure_statistics();
    assert_eq!(stats.total_failures, 3);
    assert_eq!(
        stats
            .by_kind
            .get(&helmsman_core::FailureKind::NetworkError)
            .copied(),
        Some(3)
    );
}

const HAPPY_PLAN: &str = r#"```json
{
  "goal": "Compare the battery ranges of Model 3 and Model Y and produce a report",
  "tasks": [
    {"id": "t1", "title": "fetch Model 3 specs", "description": "look up the Model 3 range", "acceptance_criteria": "range noted", "depends_on": [], "tools_hint": ["web_search"]},
    {"id": "t2", "title": "fetch Model Y specs", "description": "look up the Model Y range", "acceptance_criteria": "range noted", "depends_on": [], "tools_hint": ["web_search"]},
    {"id": "t3", "title": "compose report", "description": "combine into a report", "acceptance_criteria": "report written", "depends_on": ["t1", "t2"], "tools_hint": []}
  ]
}
```"#;

#[tokio::test]
async fn scenario_planning_happy_path() {
    let fs = Arc::new(MemoryFs::new());
    let llm = KeyedLlm {
        plan_json: HAPPY_PLAN.into(),
        revised_plan_json: String::new(),
    };
    let mut engine = engine_with(llm, fs);

    let events = run_collecting(
        &mut engine,
        "Compare the battery ranges of Model 3 and Model Y and produce a report.",
        ExecutionMode::Auto,
    )
    .await;

    let kinds = types(&events);
    assert_eq!(kinds[0], SseEventType::Status); // planning
    assert!(kinds.contains(&SseEventType::PlanCreated));

    let plan_created = events
        .iter()
        .find(|e| e.event_type == SseEventType::PlanCreated)
        .unwrap();
    assert_eq!(plan_created.data["version"], 1);
    assert_eq!(plan_created.data["tasks"].as_array().unwrap().len(), 3);

    // t1 and t2 start before t3 starts; every task has one start and
    // one completion carrying the same taskId.
    let starts: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == SseEventType::TaskStart)
        .map(|e| e.data["taskId"].as_str().unwrap())
        .collect();
    let completes: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == SseEventType::TaskComplete)
        .map(|e| e.data["taskId"].as_str().unwrap())
        .collect();
    assert_eq!(starts.len(), 3);
    assert_eq!(completes.len(), 3);
    assert_eq!(starts[2], "t3");
    assert!(starts[..2].contains(&"t1") && starts[..2].contains(&"t2"));
    for task_id in ["t1", "t2", "t3"] {
        let start_pos = events
            .iter()
            .position(|e| {
                e.event_type == SseEventType::TaskStart && e.data["taskId"] == task_id
            })
            .unwrap();
        let complete_pos = events
            .iter()
            .position(|e| {
                e.event_type == SseEventType::TaskComplete && e.data["taskId"] == task_id
            })
            .unwrap();
        assert!(start_pos < complete_pos);
    }

    assert!(kinds.contains(&SseEventType::AnswerGenerating));
    let answer = events
        .iter()
        .find(|e| e.event_type == SseEventType::AnswerReady)
        .unwrap();
    assert!(answer.data["content"]
        .as_str()
        .unwrap()
        .contains("438"));

    let terminal = dones(&events);
    assert_eq!(terminal.len(), 1);
    let done = &terminal[0].data;
    assert_eq!(done["status"], "success");
    assert_eq!(done["progress"]["total"], 3);
    assert_eq!(done["progress"]["completed"], 3);
    assert_eq!(done["progress"]["percentage"], 100);
}

const FAILING_PLAN: &str = r#"{
  "goal": "Compare the battery ranges of Model 3 and Model Y and produce a report",
  "tasks": [
    {"id": "t1", "title": "fetch Model 3 specs", "description": "download the source page", "acceptance_criteria": "range noted", "depends_on": [], "tools_hint": ["read_url"]},
    {"id": "t2", "title": "fetch Model Y specs", "description": "look up the Model Y range", "acceptance_criteria": "range noted", "depends_on": [], "tools_hint": []},
    {"id": "t3", "title": "compose report", "description": "combine into a report", "acceptance_criteria": "report written", "depends_on": ["t1", "t2"], "tools_hint": []}
  ]
}"#;

const REVISED_PLAN: &str = r#"{
  "goal": "Compare the battery ranges of Model 3 and Model Y and produce a report",
  "tasks": [
    {"id": "u1", "title": "fetch Model 3 specs from mirror", "description": "use the cached mirror data", "acceptance_criteria": "range noted", "depends_on": [], "tools_hint": []},
    {"id": "u2", "title": "compose report", "description": "combine into a report", "acceptance_criteria": "report written", "depends_on": ["u1"], "tools_hint": []}
  ]
}"#;

#[tokio::test]
async fn scenario_planning_with_replan() {
    let fs = Arc::new(MemoryFs::new());
    let llm = KeyedLlm {
        plan_json: FAILING_PLAN.into(),
        revised_plan_json: REVISED_PLAN.into(),
    };
    let mut engine = engine_with(llm, fs);
    engine.register_tool(Arc::new(FailingUrlTool));

    let events = run_collecting(
        &mut engine,
        "Compare the battery ranges of Model 3 and Model Y and produce a report.",
        ExecutionMode::Planning,
    )
    .await;

    let failed: Vec<&SseEvent> = events
        .iter()
        .filter(|e| e.event_type == SseEventType::TaskFailed)
        .collect();
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|e| e.data["taskId"] == "t1"));

    let revised = events
        .iter()
        .find(|e| e.event_type == SseEventType::PlanRevised)
        .expect("plan_revised event");
    assert_eq!(revised.data["version"], 2);
    assert!(revised.data["reason"]
        .as_str()
        .unwrap()
        .contains("repeated failures"));

    // The revised plan's tasks execute to completion.
    assert!(events.iter().any(|e| {
        e.event_type == SseEventType::TaskComplete && e.data["taskId"] == "u2"
    }));

    let terminal = dones(&events);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].data["status"], "success");
}

#[tokio::test]
async fn scenario_skill_path() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine = engine_with(KeyedLlm::default(), fs).with_skills(skill_system());

    let events = run_collecting(
        &mut engine,
        "Generate a PPT about Q3 sales.",
        ExecutionMode::Auto,
    )
    .await;

    assert_eq!(
        types(&events),
        vec![
            SseEventType::Status,
            SseEventType::Content,
            SseEventType::Done
        ]
    );
    assert_eq!(events[0].data["phase"], "skill");
    let content = events[1].data["content"].as_str().unwrap();
    assert!(content.contains("Skill executed successfully"));
    assert!(content.contains("q3_sales.pptx"));
    assert!(content.contains("Use the generated deck"));
    assert_eq!(events[2].data["status"], "success");
    assert_eq!(events[2].data["path"], "skill");
}

#[tokio::test]
async fn scenario_code_path_success() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine =
        engine_with(KeyedLlm::default(), fs).with_sandbox(Arc::new(FixedSandbox { succeed: true }));

    let events = run_collecting(
        &mut engine,
        "Given [1,2,3,4], return their mean.",
        ExecutionMode::Auto,
    )
    .await;

    let kinds = types(&events);
    assert_eq!(kinds[0], SseEventType::Status);
    assert!(kinds.contains(&SseEventType::Thinking));

    let call = events
        .iter()
        .find(|e| e.event_type == SseEventType::ToolCall)
        .unwrap();
    assert_eq!(call.data["tool_name"], "mcp_code_execute");

    let result = events
        .iter()
        .find(|e| e.event_type == SseEventType::ToolResult)
        .unwrap();
    assert_eq!(result.data["success"], true);
    assert_eq!(result.data["result"], "2.5");

    let terminal = dones(&events);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].data["path"], "mcp_code");
    assert_eq!(terminal[0].data["output"], "2.5");
}

#[tokio::test]
async fn scenario_code_path_fallback() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine = engine_with(KeyedLlm::default(), fs)
        .with_sandbox(Arc::new(FixedSandbox { succeed: false }));

    let events = run_collecting(
        &mut engine,
        "Given [1,2,3,4], return their mean.",
        ExecutionMode::Auto,
    )
    .await;

    // One recoverable error, then the direct path finishes the job.
    let errors: Vec<&SseEvent> = events
        .iter()
        .filter(|e| e.event_type == SseEventType::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["recoverable"], true);

    let direct_status = events.iter().any(|e| {
        e.event_type == SseEventType::Status && e.data["phase"] == "direct"
    });
    assert!(direct_status);

    let terminal = dones(&events);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].data["status"], "success");
    assert_eq!(terminal[0].data["output"], "2.5");
}

// ─── Non-streaming run ───────────────────────────────────────────────────────

#[tokio::test]
async fn run_returns_final_answer() {
    let fs = Arc::new(MemoryFs::new());
    let mut engine = engine_with(KeyedLlm::default(), fs);
    let response = engine.run("What is 2+2?").await;
    assert_eq!(response.answer, "4");
    assert_eq!(response.iterations, 1);
}

#[tokio::test]
async fn checkpoint_restore_reenters_reasoning() {
    use helmsman_agent::{CheckpointManager, TokenTotals};

    let fs = Arc::new(MemoryFs::new());

    // Seed a checkpoint on the shared filesystem under the engine's
    // session id.
    let manager = CheckpointManager::new(fs.clone(), "s1", 5, 3);
    manager.save_checkpoint(
        5,
        "tool_calling",
        vec![Message::user("What is 2+2?"), Message::assistant("thinking...")],
        TokenTotals {
            input: 120,
            output: 40,
        },
        String::new(),
        String::new(),
        String::new(),
        Vec::new(),
    );

    let mut engine = engine_with(KeyedLlm::default(), fs);
    assert!(engine.restore_from_checkpoint());
    // Restoration always re-enters the reasoning state, whatever state
    // name the snapshot carried.
    assert_eq!(engine.state(), helmsman_core::AgentState::Reasoning);

    // A missing checkpoint restores nothing.
    let empty_fs = Arc::new(MemoryFs::new());
    let mut fresh = engine_with(KeyedLlm::default(), empty_fs);
    assert!(!fresh.restore_from_checkpoint());
}
