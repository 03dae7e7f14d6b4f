//! Typed progress events for a streaming UI consumer.
//!
//! Ordering within a session is causal. Events carrying a `taskId`
//! payload field can be demultiplexed per task.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SseEventType {
    Status,
    Thinking,
    Content,
    ToolCall,
    ToolResult,
    PlanCreated,
    PlanRevised,
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskUpdate,
    ResearchProgressUpdate,
    AnswerGenerating,
    AnswerReady,
    Error,
    Done,
}

/// Event envelope: a type tag plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: SseEventType,
    pub data: Value,
}

impl SseEvent {
    pub fn new(event_type: SseEventType, data: Value) -> Self {
        Self { event_type, data }
    }

    pub fn status(phase: &str, message: &str) -> Self {
        Self::new(
            SseEventType::Status,
            json!({ "phase": phase, "message": message }),
        )
    }

    pub fn thinking(content: &str) -> Self {
        Self::new(SseEventType::Thinking, json!({ "content": content }))
    }

    pub fn content(content: &str) -> Self {
        Self::new(SseEventType::Content, json!({ "content": content }))
    }

    pub fn tool_call(tool_name: &str, parameters: &Value) -> Self {
        Self::new(
            SseEventType::ToolCall,
            json!({ "tool_name": tool_name, "parameters": parameters }),
        )
    }

    pub fn tool_result(
        tool_name: &str,
        success: bool,
        result: Option<&str>,
        error: Option<&str>,
        execution_time: Option<f64>,
    ) -> Self {
        Self::new(
            SseEventType::ToolResult,
            json!({
                "tool_name": tool_name,
                "success": success,
                "result": result,
                "error": error,
                "execution_time": execution_time,
            }),
        )
    }

    pub fn answer_generating(message: &str) -> Self {
        Self::new(SseEventType::AnswerGenerating, json!({ "message": message }))
    }

    pub fn error(message: &str, recoverable: bool) -> Self {
        Self::new(
            SseEventType::Error,
            json!({ "message": message, "recoverable": recoverable }),
        )
    }

    pub fn done(data: Value) -> Self {
        Self::new(SseEventType::Done, data)
    }

    /// Tag the payload with a taskId so a UI can demultiplex parallel
    /// task streams.
    pub fn with_task_id(mut self, task_id: &str) -> Self {
        if let Value::Object(ref mut map) = self.data {
            map.insert("taskId".into(), json!(task_id));
        }
        self
    }

    pub fn task_id(&self) -> Option<&str> {
        self.data.get("taskId").and_then(|v| v.as_str())
    }
}
