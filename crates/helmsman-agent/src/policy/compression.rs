//! Context compression.
//!
//! Soft mode replaces older exchanges with a summary message;
//! aggressive mode additionally drops oversized tool outputs. The last
//! six messages and the system message always survive, in order.

use serde_json::json;

use helmsman_core::{Message, Role};

use super::approx_tokens;

/// Messages kept verbatim at the tail.
const KEEP_RECENT: usize = 6;

/// Tool outputs above this byte count are dropped in aggressive mode.
const TOOL_OUTPUT_DROP_BYTES: usize = 2_000;

/// Soft compression at 70% of the window, aggressive at 90%.
const SOFT_RATIO: f64 = 0.70;
const AGGRESSIVE_RATIO: f64 = 0.90;

/// Marker metadata on summary messages so re-compression is a no-op.
const SUMMARY_MARKER: &str = "compressed_summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    Soft,
    Aggressive,
}

impl CompressionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Aggressive => "aggressive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub strategy_used: CompressionStrategy,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub tokens_saved: usize,
}

pub struct ContextCompressor {
    context_window_limit: usize,
}

impl ContextCompressor {
    pub fn new(context_window_limit: usize) -> Self {
        Self {
            context_window_limit,
        }
    }

    /// Whether compaction should run, and at which strategy.
    pub fn should_compress(&self, tokens_used: usize) -> Option<CompressionStrategy> {
        let ratio = tokens_used as f64 / self.context_window_limit as f64;
        if ratio >= AGGRESSIVE_RATIO {
            Some(CompressionStrategy::Aggressive)
        } else if ratio >= SOFT_RATIO {
            Some(CompressionStrategy::Soft)
        } else {
            None
        }
    }

    fn is_summary(msg: &Message) -> bool {
        msg.metadata
            .as_ref()
            .and_then(|m| m.get(SUMMARY_MARKER))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Compress the message list. Idempotent: a list whose older portion
    /// is already a summary comes back unchanged (modulo aggressive
    /// tool-output dropping).
    pub fn compress(
        &self,
        messages: &[Message],
        tokens_used: usize,
        strategy: CompressionStrategy,
    ) -> (Vec<Message>, CompressionResult) {
        let tokens_before = tokens_used;

        let tail_start = messages.len().saturating_sub(KEEP_RECENT);
        let (older, recent) = messages.split_at(tail_start);
        // A system message inside the retained tail stays where it is;
        // only one about to be folded away is lifted to the front.
        let system: Option<Message> = older.iter().find(|m| m.role == Role::System).cloned();

        // Older messages to fold: skip the system message (kept apart)
        // and any existing summary.
        let foldable: Vec<&Message> = older
            .iter()
            .filter(|m| m.role != Role::System && !Self::is_summary(m))
            .collect();
        let prior_summaries: Vec<Message> = older
            .iter()
            .filter(|m| Self::is_summary(m))
            .cloned()
            .collect();

        let mut result: Vec<Message> = Vec::new();
        if let Some(system) = system {
            result.push(system);
        }
        result.extend(prior_summaries);

        if !foldable.is_empty() {
            let assistant_count = foldable.iter().filter(|m| m.role == Role::Assistant).count();
            let tool_count = foldable.iter().filter(|m| m.role == Role::Tool).count();
            let user_count = foldable.iter().filter(|m| m.role == Role::User).count();
            let summary_text = format!(
                "[Context summary] {} earlier messages compressed: \
                 {} user, {} assistant, {} tool-result. \
                 Key decisions and findings are recorded in the working files.",
                foldable.len(),
                user_count,
                assistant_count,
                tool_count
            );
            result.push(Message::user(summary_text).with_metadata(json!({ SUMMARY_MARKER: true })));
        }

        for msg in recent {
            let mut msg = msg.clone();
            if strategy == CompressionStrategy::Aggressive
                && msg.role == Role::Tool
                && msg.content.len() > TOOL_OUTPUT_DROP_BYTES
            {
                let name = msg
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tool_name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("output");
                msg.content = format!("<tool {} returned {} bytes>", name, msg.content.len());
            }
            result.push(msg);
        }

        let tokens_after: usize = result.iter().map(|m| approx_tokens(&m.content)).sum();
        let tokens_saved = tokens_before.saturating_sub(tokens_after);

        (
            result,
            CompressionResult {
                strategy_used: strategy,
                tokens_before,
                tokens_after,
                tokens_saved,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_history(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("you are an agent")];
        for i in 0..n {
            messages.push(Message::user(format!("question {}", i)));
            messages.push(Message::assistant(format!("answer {}", i)));
        }
        messages
    }

    #[test]
    fn test_thresholds() {
        let compressor = ContextCompressor::new(1_000);
        assert!(compressor.should_compress(500).is_none());
        assert_eq!(
            compressor.should_compress(700),
            Some(CompressionStrategy::Soft)
        );
        assert_eq!(
            compressor.should_compress(950),
            Some(CompressionStrategy::Aggressive)
        );
    }

    #[test]
    fn test_keeps_system_and_last_six() {
        let compressor = ContextCompressor::new(1_000);
        let messages = long_history(10);
        let (compressed, result) =
            compressor.compress(&messages, 900, CompressionStrategy::Soft);

        assert_eq!(compressed[0].role, Role::System);
        // system + one summary + 6 recent
        assert_eq!(compressed.len(), 8);
        let original_tail: Vec<String> = messages[messages.len() - 6..]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        let compressed_tail: Vec<String> = compressed[compressed.len() - 6..]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(original_tail, compressed_tail);
        assert!(result.tokens_after < result.tokens_before);
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let compressor = ContextCompressor::new(1_000);
        let messages = long_history(10);
        let (once, _) = compressor.compress(&messages, 900, CompressionStrategy::Soft);
        let (twice, _) = compressor.compress(&once, 300, CompressionStrategy::Soft);

        let contents =
            |msgs: &[Message]| msgs.iter().map(|m| m.content.clone()).collect::<Vec<_>>();
        assert_eq!(contents(&once), contents(&twice));
    }

    #[test]
    fn test_aggressive_drops_large_tool_outputs() {
        let compressor = ContextCompressor::new(1_000);
        let mut messages = long_history(2);
        messages.push(
            Message::tool("x".repeat(5_000))
                .with_metadata(json!({ "tool_name": "read_url" })),
        );
        let (compressed, _) =
            compressor.compress(&messages, 950, CompressionStrategy::Aggressive);
        let tool_msg = compressed
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool message retained");
        assert_eq!(tool_msg.content, "<tool read_url returned 5000 bytes>");
    }
}
