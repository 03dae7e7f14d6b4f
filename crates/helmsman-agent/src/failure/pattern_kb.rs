//! Cross-session failure pattern knowledge base.
//!
//! Records failure signatures and the fixes that worked, persisted as a
//! single JSON file so later sessions can apply a known fix directly.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use helmsman_core::{FailureSignal, WorkspaceFs};

const KB_PATH: &str = "shared/knowledge_base/failure_patterns.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub signature: String,
    pub category: String,
    pub sample_error: String,
    #[serde(default)]
    pub occurrences: u64,
    #[serde(default)]
    pub successful_fixes: Vec<String>,
    #[serde(default)]
    pub last_seen: String,
}

/// JSON-file knowledge base. Writes are serialized through the owner;
/// readers get whatever snapshot was last persisted.
pub struct FailurePatternKb {
    fs: Arc<dyn WorkspaceFs>,
    cache: HashMap<String, FailurePattern>,
}

impl FailurePatternKb {
    pub fn new(fs: Arc<dyn WorkspaceFs>) -> Self {
        let cache = Self::load(&*fs);
        Self { fs, cache }
    }

    fn load(fs: &dyn WorkspaceFs) -> HashMap<String, FailurePattern> {
        if !fs.exists(KB_PATH) {
            return HashMap::new();
        }
        match fs.read(KB_PATH) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save(&self) {
        match serde_json::to_string_pretty(&self.cache) {
            Ok(raw) => {
                if let Err(e) = self.fs.write(KB_PATH, &raw) {
                    tracing::warn!("failed to persist failure KB: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to serialize failure KB: {}", e),
        }
    }

    /// Signature: kind + tool + the leading slice of the error message.
    fn signature(signal: &FailureSignal) -> String {
        let tool = signal.tool_name.as_deref().unwrap_or("unknown");
        let msg: String = signal
            .error_message
            .to_lowercase()
            .trim()
            .chars()
            .take(50)
            .collect();
        format!("{}:{}:{}", signal.kind.as_str(), tool, msg)
    }

    pub fn record(&mut self, signal: &FailureSignal) {
        if signal.is_success() {
            return;
        }
        let sig = Self::signature(signal);
        let now = chrono::Utc::now().to_rfc3339();
        match self.cache.get_mut(&sig) {
            Some(pattern) => {
                pattern.occurrences += 1;
                pattern.last_seen = now;
            }
            None => {
                self.cache.insert(
                    sig.clone(),
                    FailurePattern {
                        signature: sig,
                        category: signal.kind.as_str().to_string(),
                        sample_error: signal.error_message.clone(),
                        occurrences: 1,
                        successful_fixes: Vec::new(),
                        last_seen: now,
                    },
                );
            }
        }
        self.save();
    }

    /// Attach a fix that resolved this failure signature.
    pub fn record_success_fix(&mut self, signal: &FailureSignal, fix_summary: &str) {
        let sig = Self::signature(signal);
        if let Some(pattern) = self.cache.get_mut(&sig) {
            if !pattern.successful_fixes.iter().any(|f| f == fix_summary) {
                pattern.successful_fixes.push(fix_summary.to_string());
                self.save();
            }
        }
    }

    /// First known fix for this signature, if any.
    pub fn get_solution(&self, signal: &FailureSignal) -> Option<String> {
        let sig = Self::signature(signal);
        self.cache
            .get(&sig)
            .and_then(|p| p.successful_fixes.first().cloned())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
