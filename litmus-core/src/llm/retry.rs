//! Retry and timeout policy for provider calls
//!
//! Provider errors are transient by contract, so every completion the engine
//! issues goes through [`CompletionPolicy`]: a per-attempt timeout plus
//! exponential backoff with jitter.

use std::time::Duration;

use crate::config::{EngineConfig, LLMProviderConfig};
use crate::error::{LitmusError, Result};

use super::{LLMConfig, LLMProvider, LLMRequest};

/// Backoff schedule for provider calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first one included
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff before retry number `retry` (0-indexed), without jitter
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// `delay` stretched by up to 25%
fn jittered(delay: Duration) -> Duration {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let mixed = (nanos ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9E37_79B9))
        .wrapping_mul(1_103_515_245)
        .wrapping_add(12_345)
        % 1_000;
    delay + delay.mul_f64(0.25 * mixed as f64 / 1_000.0)
}

/// Run `operation` until it succeeds or the attempts are used up.
/// The last error is returned.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= config.max_attempts {
            return Err(error);
        }

        let delay = jittered(config.delay_for_attempt(attempt - 1));
        tracing::debug!(
            error = %error,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying provider call"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Generation settings, per-attempt timeout and retry policy for provider calls
#[derive(Debug, Clone)]
pub struct CompletionPolicy {
    pub llm: LLMConfig,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            llm: LLMConfig::default(),
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

impl CompletionPolicy {
    /// Build the policy from engine and provider configuration
    pub fn from_config(engine: &EngineConfig, llm: Option<&LLMProviderConfig>) -> Self {
        let llm_config = llm
            .map(|cfg| {
                LLMConfig::new()
                    .with_temperature(cfg.temperature)
                    .with_max_tokens(cfg.max_tokens)
            })
            .unwrap_or_default();

        Self {
            llm: llm_config,
            timeout: engine.provider_timeout,
            retry: RetryConfig::default()
                .with_max_attempts(engine.retry.max_attempts)
                .with_initial_delay(engine.retry.initial_delay)
                .with_max_delay(engine.retry.max_delay),
        }
    }

    /// Single attempt, for deterministic tests
    pub fn immediate() -> Self {
        Self {
            retry: RetryConfig::no_retry(),
            ..Default::default()
        }
    }

    /// Send a single prompt, retrying timeouts and provider failures
    pub async fn complete(&self, provider: &dyn LLMProvider, prompt: &str) -> Result<String> {
        let request = LLMRequest::from_prompt(prompt).with_config(&self.llm);

        with_retry(&self.retry, || async {
            match tokio::time::timeout(self.timeout, provider.generate_request(&request)).await {
                Ok(Ok(response)) => Ok(response.content),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(LitmusError::Provider(format!(
                    "provider call timed out after {:?}",
                    self.timeout
                ))),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig::default().with_max_delay(Duration::from_secs(1));

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn with_retry_stops_after_max_attempts() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));

        let result: std::result::Result<(), String> = with_retry(&config, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", n)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_eventual_success() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(10));

        let result = with_retry(&config, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("transient error")
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completion_policy_retries_provider_errors() {
        let provider = ScriptedProvider::new()
            .then_error("rate limited")
            .then_reply("yes");
        let policy = CompletionPolicy {
            retry: RetryConfig::default()
                .with_max_attempts(2)
                .with_initial_delay(Duration::from_millis(1)),
            ..CompletionPolicy::default()
        };

        let reply = policy.complete(&provider, "done?").await.unwrap();
        assert_eq!(reply, "yes");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn completion_policy_gives_up_after_last_attempt() {
        let provider = ScriptedProvider::new().then_error("down");
        let result = CompletionPolicy::immediate().complete(&provider, "hi").await;
        assert!(matches!(result, Err(LitmusError::Provider(_))));
        assert_eq!(provider.call_count(), 1);
    }
}
