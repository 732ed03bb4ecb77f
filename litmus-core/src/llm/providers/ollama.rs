//! Ollama chat provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LitmusError, Result};
use crate::llm::{LLMProvider, LLMRequest, LLMResponse, MessageRole, ModelInfo, TokenUsage};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen3:14b";

/// Ollama provider (local models via `/api/chat`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
}

impl OllamaProvider {
    /// Create a new provider; `base_url` defaults to `http://localhost:11434`.
    pub fn new(model: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// Create from `OLLAMA_MODEL` / `OLLAMA_BASE_URL`.
    pub fn from_env(model: Option<String>) -> Self {
        let model = model
            .or_else(|| std::env::var("OLLAMA_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self::new(model, std::env::var("OLLAMA_BASE_URL").ok())
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
        let messages = request
            .messages
            .iter()
            .map(|m| OllamaMessage {
                role: match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let body = OllamaRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url);

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            LitmusError::Provider(format!(
                "Failed to send request to Ollama: {}. Make sure Ollama is running.",
                e
            ))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LitmusError::Provider(format!(
                "Ollama API error ({}): {}",
                status, text
            )));
        }

        let parsed: OllamaResponse = response.json().await.map_err(|e| {
            LitmusError::Provider(format!("Failed to parse Ollama response: {}", e))
        })?;

        // Thinking models sometimes leave `content` empty
        let mut content = parsed.message.content.trim().to_string();
        if content.is_empty() {
            if let Some(thinking) = parsed.message.thinking {
                content = thinking.trim().to_string();
            }
        }

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (Some(prompt_tokens), Some(completion_tokens)) => Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            _ => None,
        };

        Ok(LLMResponse { content, usage })
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "ollama".to_string(),
            model_name: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_provider_creation() {
        let provider = OllamaProvider::new("qwen3:14b", None);
        assert_eq!(provider.model(), "qwen3:14b");
        assert_eq!(provider.base_url, "http://localhost:11434");
    }

    #[test]
    fn response_falls_back_to_thinking_field() {
        let parsed: OllamaResponse = serde_json::from_str(
            r#"{"message": {"role": "assistant", "content": "", "thinking": " yes "}, "done": true}"#,
        )
        .unwrap();
        assert!(parsed.message.content.is_empty());
        assert_eq!(parsed.message.thinking.as_deref().map(str::trim), Some("yes"));
    }
}
