//! Factory for creating LLM providers from configuration

use std::sync::Arc;

use crate::config::{LLMProvider as LLMProviderType, LLMProviderConfig};
use crate::error::Result;
use crate::llm::{LLMProvider, StubLLMProvider};

#[cfg(feature = "llm-ollama")]
use crate::llm::providers::OllamaProvider;

#[cfg(feature = "llm-openai")]
use crate::llm::providers::OpenAIProvider;

/// Factory for creating LLM providers
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    /// Create an LLM provider from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be created (missing API key, or
    /// the provider's feature is not compiled in)
    pub fn create(config: &LLMProviderConfig) -> Result<Arc<dyn LLMProvider>> {
        let model = Some(config.model.clone()).filter(|m| !m.is_empty());

        match config.provider {
            #[cfg(feature = "llm-openai")]
            LLMProviderType::OpenAI => {
                let provider = match &config.api_key {
                    Some(api_key) => {
                        let model = model
                            .or_else(|| std::env::var("OPENAI_MODEL").ok())
                            .unwrap_or_else(|| "gpt-4o".to_string());
                        match &config.base_url {
                            Some(base_url) => {
                                OpenAIProvider::with_base_url(api_key.clone(), model, base_url.clone())
                            }
                            None => OpenAIProvider::new(api_key.clone(), model),
                        }
                    }
                    None => OpenAIProvider::from_env(model)?,
                };
                Ok(Arc::new(provider))
            }

            #[cfg(not(feature = "llm-openai"))]
            LLMProviderType::OpenAI => Err(crate::error::LitmusError::Configuration(
                "OpenAI provider requires 'llm-openai' feature".to_string(),
            )),

            #[cfg(feature = "llm-ollama")]
            LLMProviderType::Ollama => {
                let provider = match &config.base_url {
                    Some(url) => OllamaProvider::new(
                        model.unwrap_or_else(|| "qwen3:14b".to_string()),
                        Some(url.clone()),
                    ),
                    None => OllamaProvider::from_env(model),
                };
                Ok(Arc::new(provider))
            }

            #[cfg(not(feature = "llm-ollama"))]
            LLMProviderType::Ollama => Err(crate::error::LitmusError::Configuration(
                "Ollama provider requires 'llm-ollama' feature".to_string(),
            )),
        }
    }

    /// Create from the optional `[llm]` section, falling back to
    /// [`StubLLMProvider`] when nothing is configured
    pub fn from_config(config: Option<&LLMProviderConfig>) -> Result<Arc<dyn LLMProvider>> {
        match config {
            Some(cfg) => Self::create(cfg),
            None => {
                tracing::warn!("No [llm] provider configured; missions and evaluations will error");
                Ok(Arc::new(StubLLMProvider))
            }
        }
    }
}
