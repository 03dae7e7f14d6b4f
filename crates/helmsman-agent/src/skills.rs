//! Skill system seam.
//!
//! The runtime consumes skills through four narrow interfaces: a
//! registry of metadata, a matcher, an L2 instruction loader, and an L3
//! executor. The on-disk skill format and hot reload live outside.
//!
//! A keyword-scored in-memory implementation is included; it is the
//! fallback matcher and the fixture the tests drive.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Skill metadata: the L1 tier kept resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub id: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Declared tools; the allow-list is pruned to these while the
    /// skill runs.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Whether an L3 script exists for sandbox execution.
    #[serde(default)]
    pub executable: bool,
}

/// A matcher hit.
#[derive(Debug, Clone)]
pub struct SkillMatch {
    pub skill_id: String,
    pub score: f64,
    pub reason: String,
    pub metadata: Option<SkillMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillRunStatus {
    Success,
    Failed,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct SkillRunResult {
    pub status: SkillRunStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub tokens_used: u64,
}

#[async_trait]
pub trait SkillMatcher: Send + Sync {
    async fn match_query(&self, query: &str) -> Option<SkillMatch>;
}

#[async_trait]
pub trait SkillLoader: Send + Sync {
    /// Full instructional text loaded on match (the L2 tier).
    async fn load_l2(&self, skill_id: &str) -> Result<String>;
}

#[async_trait]
pub trait SkillExecutor: Send + Sync {
    fn can_execute(&self, skill_id: &str) -> bool;
    async fn execute(&self, skill_id: &str, query: &str, context: Value) -> SkillRunResult;
}

/// In-memory skill registry.
#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, SkillMetadata>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metadata: SkillMetadata) {
        self.skills.insert(metadata.id.clone(), metadata);
    }

    pub fn get(&self, skill_id: &str) -> Option<&SkillMetadata> {
        self.skills.get(skill_id)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkillMetadata> {
        self.skills.values()
    }
}

/// Keyword-overlap matcher over the registry.
pub struct KeywordSkillMatcher {
    registry: Arc<SkillRegistry>,
}

impl KeywordSkillMatcher {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }

    fn score(query_lower: &str, metadata: &SkillMetadata) -> f64 {
        if metadata.keywords.is_empty() {
            return 0.0;
        }
        let hits = metadata
            .keywords
            .iter()
            .filter(|kw| query_lower.contains(&kw.to_lowercase()))
            .count();
        hits as f64 / metadata.keywords.len() as f64
    }
}

#[async_trait]
impl SkillMatcher for KeywordSkillMatcher {
    async fn match_query(&self, query: &str) -> Option<SkillMatch> {
        let query_lower = query.to_lowercase();
        let best = self
            .registry
            .iter()
            .map(|meta| (Self::score(&query_lower, meta), meta))
            .max_by(|(a, _), (b, _)| a.total_cmp(b))?;

        let (score, metadata) = best;
        if score <= 0.0 {
            return None;
        }
        Some(SkillMatch {
            skill_id: metadata.id.clone(),
            score,
            reason: format!("keyword overlap {:.2}", score),
            metadata: Some(metadata.clone()),
        })
    }
}
