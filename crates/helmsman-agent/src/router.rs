//! Execution router.
//!
//! Decides between three paths for a query, in order: a matched skill,
//! sandboxed code generation for structured/computable tasks, and plain
//! LLM reasoning. Always returns a decision; never errors.

use std::sync::Arc;

use crate::skills::SkillMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Skill,
    McpCode,
    Llm,
}

impl ExecutionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skill => "skill",
            Self::McpCode => "mcp_code",
            Self::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub path: ExecutionPath,
    pub confidence: f64,
    pub reason: String,
}

pub struct ExecutionRouter {
    matcher: Option<Arc<dyn SkillMatcher>>,
    skill_confidence_threshold: f64,
    structured_task_confidence: f64,
}

/// Imperative computation keywords that mark a structured task.
const COMPUTE_KEYWORDS: &[&str] = &[
    "calculate", "compute", "sum", "mean", "average", "median", "count",
    "sort", "parse", "convert", "total", "percentage",
];

impl ExecutionRouter {
    /// Queries shorter than this that look like code get the code path.
    const SHORT_QUERY_CHARS: usize = 160;

    pub fn new(
        matcher: Option<Arc<dyn SkillMatcher>>,
        skill_confidence_threshold: f64,
        structured_task_confidence: f64,
    ) -> Self {
        Self {
            matcher,
            skill_confidence_threshold,
            structured_task_confidence,
        }
    }

    pub async fn route(&self, query: &str) -> RoutingDecision {
        // Rule 1: a confident skill match wins.
        if let Some(matcher) = &self.matcher {
            if let Some(hit) = matcher.match_query(query).await {
                if hit.score >= self.skill_confidence_threshold {
                    return RoutingDecision {
                        path: ExecutionPath::Skill,
                        confidence: hit.score,
                        reason: format!("skill '{}' matched: {}", hit.skill_id, hit.reason),
                    };
                }
            }
        }

        // Rule 2: structured/executable tasks go to the sandbox.
        let confidence = Self::structured_task_score(query);
        if confidence >= self.structured_task_confidence {
            return RoutingDecision {
                path: ExecutionPath::McpCode,
                confidence,
                reason: "query looks like a structured computation".into(),
            };
        }

        RoutingDecision {
            path: ExecutionPath::Llm,
            confidence: 0.5,
            reason: "default reasoning path".into(),
        }
    }

    /// Heuristic score for "this is a computation, not a conversation".
    fn structured_task_score(query: &str) -> f64 {
        let lower = query.to_lowercase();
        let mut score: f64 = 0.0;

        if COMPUTE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            score += 0.5;
        }
        let code_shaped = query.contains('[')
            || query.contains('{')
            || query.contains("()")
            || query.contains('=');
        if code_shaped {
            score += 0.25;
        }
        if query.len() < Self::SHORT_QUERY_CHARS && query.chars().any(|c| c.is_ascii_digit()) {
            score += 0.25;
        }
        score.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{SkillMatch, SkillMatcher};
    use async_trait::async_trait;

    struct FixedMatcher {
        score: f64,
    }

    #[async_trait]
    impl SkillMatcher for FixedMatcher {
        async fn match_query(&self, _query: &str) -> Option<SkillMatch> {
            Some(SkillMatch {
                skill_id: "ppt_generator".into(),
                score: self.score,
                reason: "fixture".into(),
                metadata: None,
            })
        }
    }

    fn router(matcher_score: Option<f64>) -> ExecutionRouter {
        ExecutionRouter::new(
            matcher_score.map(|score| Arc::new(FixedMatcher { score }) as Arc<dyn SkillMatcher>),
            0.85,
            0.70,
        )
    }

    #[tokio::test]
    async fn test_confident_skill_match_wins() {
        let decision = router(Some(0.93)).route("Generate a PPT about Q3 sales.").await;
        assert_eq!(decision.path, ExecutionPath::Skill);
        assert!(decision.confidence >= 0.93);
        assert!(decision.reason.contains("ppt_generator"));
    }

    #[tokio::test]
    async fn test_weak_skill_match_falls_through() {
        let decision = router(Some(0.40)).route("Tell me a story").await;
        assert_eq!(decision.path, ExecutionPath::Llm);
    }

    #[tokio::test]
    async fn test_structured_task_routes_to_code() {
        let decision = router(None)
            .route("Given [1,2,3,4], return their mean.")
            .await;
        assert_eq!(decision.path, ExecutionPath::McpCode);
        assert!(decision.confidence >= 0.70);
    }

    #[tokio::test]
    async fn test_open_question_routes_to_llm() {
        let decision = router(None).route("Why is the sky blue?").await;
        assert_eq!(decision.path, ExecutionPath::Llm);
        assert_eq!(decision.confidence, 0.5);
    }
}
