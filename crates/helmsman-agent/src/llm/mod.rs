//! LLM client seam.
//!
//! The runtime consumes the model through the narrow [`LlmClient`]
//! trait; [`OpenAiClient`] is the default OpenAI-compatible
//! `/chat/completions` implementation.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use helmsman_core::{Message, Role};

mod openai;

pub use openai::OpenAiClient;

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A completed model turn.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion over the given messages. `system`, when present,
    /// is prepended as the system prompt.
    async fn complete(&self, messages: &[Message], system: Option<&str>) -> Result<LlmResponse>;
}

/// Check whether an error message indicates a context-window overflow.
pub fn is_context_overflow_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("token limit")
        || lower.contains("too many tokens")
        || lower.contains("context window")
}

/// Truncate tool-result messages in place to shrink the context during
/// overflow recovery.
pub fn truncate_tool_messages(messages: &mut [Message], max_chars: usize) {
    for msg in messages.iter_mut() {
        if msg.role == Role::Tool && msg.content.len() > max_chars {
            let total = msg.content.len();
            let mut end = max_chars;
            while end > 0 && !msg.content.is_char_boundary(end) {
                end -= 1;
            }
            msg.content.truncate(end);
            msg.content
                .push_str(&format!("...\n[truncated: {} chars → {}]", total, max_chars));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_detection() {
        assert!(is_context_overflow_error("maximum context length is 8192"));
        assert!(is_context_overflow_error("Request exceeds token limit"));
        assert!(!is_context_overflow_error("connection refused"));
    }

    #[test]
    fn test_truncate_only_tool_messages() {
        let mut messages = vec![
            Message::user("x".repeat(100)),
            Message::tool("y".repeat(100)),
        ];
        truncate_tool_messages(&mut messages, 10);
        assert_eq!(messages[0].content.len(), 100);
        assert!(messages[1].content.starts_with("yyyyyyyyyy..."));
        assert!(messages[1].content.contains("[truncated: 100 chars → 10]"));
    }
}
