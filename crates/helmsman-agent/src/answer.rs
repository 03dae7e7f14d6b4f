//! Final answer assembly.
//!
//! Single-task outputs pass through nearly verbatim; multi-task runs go
//! through an LLM synthesis with a style picked from the query. If the
//! synthesis call fails, fall back to concatenating successful outputs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use helmsman_core::Message;

use crate::llm::LlmClient;
use crate::prompts;

/// One task's contribution to the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub task_title: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerStyle {
    Report,
    Summary,
    Outline,
}

impl AnswerStyle {
    /// Pick a register from the query wording.
    pub fn detect(query: &str) -> Self {
        let lower = query.to_lowercase();
        if ["report", "analysis", "detailed", "in depth", "compare"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Report
        } else if ["outline", "bullet", "list the", "steps"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Outline
        } else {
            Self::Summary
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Self::Report => {
                "Write a structured report with markdown headings and a short conclusion."
            }
            Self::Summary => "Write a concise summary in a few paragraphs.",
            Self::Outline => "Write a bulleted outline; keep each point short.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalAnswer {
    pub content: String,
    pub summary: Option<String>,
    pub suggestions: Option<Vec<String>>,
}

impl FinalAnswer {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "content": self.content,
            "summary": self.summary,
            "suggestions": self.suggestions,
        })
    }
}

pub struct AnswerAgent {
    llm: Arc<dyn LlmClient>,
}

impl AnswerAgent {
    /// Characters of content used for the derived summary.
    const SUMMARY_CHARS: usize = 200;

    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn generate(
        &self,
        task_outputs: &[TaskOutput],
        query: &str,
        use_llm: bool,
        style: AnswerStyle,
    ) -> FinalAnswer {
        let successful: Vec<&TaskOutput> =
            task_outputs.iter().filter(|o| o.success).collect();

        let content = if successful.is_empty() {
            "No task produced a usable output.".to_string()
        } else if successful.len() == 1 || !use_llm {
            Self::concatenate(&successful)
        } else {
            match self.synthesize(&successful, query, style).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("answer synthesis failed, falling back to concat: {}", e);
                    Self::concatenate(&successful)
                }
            }
        };

        let summary = Self::derive_summary(&content);
        FinalAnswer {
            content,
            summary,
            suggestions: None,
        }
    }

    async fn synthesize(
        &self,
        outputs: &[&TaskOutput],
        query: &str,
        style: AnswerStyle,
    ) -> anyhow::Result<String> {
        let sections: String = outputs
            .iter()
            .map(|o| format!("### {}\n{}", o.task_title, o.output))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = prompts::answer_synthesis_prompt(query, &sections, style.instruction());
        let response = self.llm.complete(&[Message::user(prompt)], None).await?;
        if response.content.trim().is_empty() {
            anyhow::bail!("empty synthesis response");
        }
        Ok(response.content.trim().to_string())
    }

    fn concatenate(outputs: &[&TaskOutput]) -> String {
        if outputs.len() == 1 {
            return outputs[0].output.trim().to_string();
        }
        outputs
            .iter()
            .map(|o| format!("### {}\n{}", o.task_title, o.output.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn derive_summary(content: &str) -> Option<String> {
        let flat = content.trim();
        if flat.is_empty() {
            return None;
        }
        let summary: String = flat.chars().take(Self::SUMMARY_CHARS).collect();
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<anyhow::Result<String>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _: &[Message],
            _: Option<&str>,
        ) -> anyhow::Result<LlmResponse> {
            match self.responses.lock().unwrap().pop() {
                Some(Ok(content)) => Ok(LlmResponse {
                    content,
                    usage: None,
                }),
                Some(Err(e)) => Err(e),
                None => Ok(LlmResponse {
                    content: String::new(),
                    usage: None,
                }),
            }
        }
    }

    fn outputs() -> Vec<TaskOutput> {
        vec![
            TaskOutput {
                task_id: "t1".into(),
                task_title: "Model 3 range".into(),
                output: "Model 3: 438 miles".into(),
                success: true,
            },
            TaskOutput {
                task_id: "t2".into(),
                task_title: "Model Y range".into(),
                output: "Model Y: 387 miles".into(),
                success: true,
            },
            TaskOutput {
                task_id: "t3".into(),
                task_title: "broken".into(),
                output: String::new(),
                success: false,
            },
        ]
    }

    #[test]
    fn test_style_detection() {
        assert_eq!(
            AnswerStyle::detect("Compare the ranges and produce a report"),
            AnswerStyle::Report
        );
        assert_eq!(
            AnswerStyle::detect("list the steps to deploy"),
            AnswerStyle::Outline
        );
        assert_eq!(AnswerStyle::detect("what happened?"), AnswerStyle::Summary);
    }

    #[tokio::test]
    async fn test_single_output_passthrough() {
        let agent = AnswerAgent::new(Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![]),
        }));
        let single = vec![outputs()[0].clone()];
        let answer = agent
            .generate(&single, "range?", true, AnswerStyle::Summary)
            .await;
        assert_eq!(answer.content, "Model 3: 438 miles");
        assert!(answer.summary.is_some());
    }

    #[tokio::test]
    async fn test_multi_output_synthesis() {
        let agent = AnswerAgent::new(Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![Ok("Both ranges compared: 438 vs 387 miles.".into())]),
        }));
        let answer = agent
            .generate(&outputs(), "compare", true, AnswerStyle::Report)
            .await;
        assert_eq!(answer.content, "Both ranges compared: 438 vs 387 miles.");
    }

    #[tokio::test]
    async fn test_fallback_concatenates_successes() {
        let agent = AnswerAgent::new(Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![Err(anyhow::anyhow!("LLM down"))]),
        }));
        let answer = agent
            .generate(&outputs(), "compare", true, AnswerStyle::Report)
            .await;
        assert!(answer.content.contains("### Model 3 range"));
        assert!(answer.content.contains("### Model Y range"));
        // Failed tasks are not concatenated.
        assert!(!answer.content.contains("### broken"));
    }
}
