//! OpenAI-compatible chat-completions client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use helmsman_core::{Message, Role};

use super::{LlmClient, LlmResponse, TokenUsage};

/// HTTP client for any `/chat/completions`-shaped endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature: None,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            // Tool results travel as user turns: this client drives a
            // text-format tool protocol, not provider-native tool calls.
            Role::Tool => "user",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message], system: Option<&str>) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);

        let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            wire_messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in messages {
            wire_messages.push(json!({
                "role": Self::role_str(msg.role),
                "content": msg.content,
            }));
        }

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat completion error ({}): {}", status, body_text);
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }
}
