//! Append-only conversation context.
//!
//! Messages are never mutated after append. The only whole-log
//! replacements are the compressor and the memory-clear path, both of
//! which preserve the system message and the order of survivors. The
//! plan-recitation suffix is recomputed on every call and never stored.

use serde::{Deserialize, Serialize};

use helmsman_core::{Message, Role};

/// Cumulative token accounting. Advisory: the compressor reads it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

#[derive(Default)]
pub struct ContextManager {
    messages: Vec<Message>,
    tokens: TokenTotals,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::system(content));
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant_message(
        &mut self,
        content: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut msg = Message::assistant(content);
        msg.metadata = metadata;
        self.messages.push(msg);
    }

    pub fn add_tool_result_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::tool(content));
    }

    /// The view sent to the LLM. When a recitation is supplied it is
    /// appended as a synthetic trailing user message — computed by the
    /// caller per turn, never stored here.
    pub fn messages_for_llm(&self, recitation: Option<&str>) -> Vec<Message> {
        let mut view = self.messages.clone();
        if let Some(text) = recitation {
            if !text.trim().is_empty() {
                view.push(Message::user(text));
            }
        }
        view
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn update_token_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.tokens.input += input_tokens;
        self.tokens.output += output_tokens;
    }

    pub fn token_usage(&self) -> TokenTotals {
        self.tokens
    }

    /// Used by checkpoint restoration only.
    pub fn restore_token_usage(&mut self, totals: TokenTotals) {
        self.tokens = totals;
    }

    /// Whole-log replacement. Only the compressor and the memory-clear
    /// path call this; both keep the system message and survivor order.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == Role::System)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.tokens = TokenTotals::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_order_preserved() {
        let mut ctx = ContextManager::new();
        ctx.add_system_message("sys");
        ctx.add_user_message("q");
        ctx.add_assistant_message("a", None);
        ctx.add_tool_result_message("t");
        let roles: Vec<Role> = ctx.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    }

    #[test]
    fn test_recitation_is_suffix_and_not_stored() {
        let mut ctx = ContextManager::new();
        ctx.add_user_message("q");

        let view = ctx.messages_for_llm(Some("plan status"));
        assert_eq!(view.len(), 2);
        assert_eq!(view.last().unwrap().role, Role::User);
        assert_eq!(view.last().unwrap().content, "plan status");

        // The stored log is untouched.
        assert_eq!(ctx.message_count(), 1);
        // Empty recitation adds nothing.
        assert_eq!(ctx.messages_for_llm(Some("  ")).len(), 1);
        assert_eq!(ctx.messages_for_llm(None).len(), 1);
    }

    #[test]
    fn test_token_accounting_accumulates() {
        let mut ctx = ContextManager::new();
        ctx.update_token_usage(100, 20);
        ctx.update_token_usage(50, 10);
        assert_eq!(ctx.token_usage().input, 150);
        assert_eq!(ctx.token_usage().output, 30);
        assert_eq!(ctx.token_usage().total(), 180);
    }
}
