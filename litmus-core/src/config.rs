//! Configuration types for the Litmus worker

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LitmusError, Result};

/// Main configuration for the Litmus worker
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LitmusConfig {
    /// Run engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// LLM provider used for mission synthesis and evaluation (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LLMProviderConfig>,

    /// Run/result document store
    #[serde(default)]
    pub store: StoreConfig,

    /// Directory of template files, used instead of the store when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,

    /// Where `[FILE: name]` references are resolved from
    #[serde(default)]
    pub files: FileResolverConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine settings threaded through the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of units executing at once (1 = sequential)
    pub max_concurrency: usize,

    /// Timeout for each call to the endpoint under test
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Timeout for each call to the completion provider
    #[serde(with = "humantime_serde")]
    pub provider_timeout: Duration,

    /// Turn budget for mission templates that do not declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mission_duration: Option<usize>,

    /// Similarity at or above which the judge marks a unit as passed
    pub pass_threshold: f64,

    /// Header carrying the per-request tracing identifier
    pub tracing_header: String,

    /// Terminal run status when every unit errored
    pub all_errored_policy: AllErroredPolicy,

    /// Retry behaviour for provider calls
    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            request_timeout: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(120),
            default_mission_duration: None,
            pass_threshold: crate::evaluation::judge::PASS_THRESHOLD,
            tracing_header: "X-Litmus-Request".to_string(),
            all_errored_policy: AllErroredPolicy::Failed,
            retry: RetrySettings::default(),
        }
    }
}

/// What a run becomes when not a single unit produced a scored result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllErroredPolicy {
    /// Mark the run `Failed`
    #[default]
    Failed,
    /// Mark the run `Completed` like any other run
    Completed,
}

/// Retry settings for provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: usize,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMProviderConfig {
    /// Provider type
    pub provider: LLMProvider,

    /// Model name
    pub model: String,

    /// API key (if needed, prefer env vars)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL (for compatible endpoints or a remote Ollama)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Sampling temperature; evaluation wants deterministic output
    #[serde(default)]
    pub temperature: f32,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_tokens() -> usize {
    1000
}

/// LLM provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    Ollama,
}

/// Run/result store backend
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store, lost on exit
    #[default]
    Memory,

    /// SurrealDB endpoint (`mem://`, `ws://host:port`, `http://host:port`)
    Surreal {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_database")]
        database: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl StoreConfig {
    /// Whether runs and templates survive the end of this process
    pub fn is_persistent(&self) -> bool {
        match self {
            StoreConfig::Memory => false,
            StoreConfig::Surreal { url, .. } => !url.starts_with("mem://"),
        }
    }
}

fn default_namespace() -> String {
    "litmus".to_string()
}

fn default_database() -> String {
    "runs".to_string()
}

/// Source of `[FILE: name]` content
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileResolverConfig {
    /// No blob store; every reference stays unresolved
    #[default]
    #[serde(rename = "none")]
    Disabled,

    /// Files under a local directory
    Directory { root: PathBuf },

    /// Files served as `GET {base_url}/{name}`
    Http { base_url: String },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LitmusConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (litmus.toml, then the path in LITMUS_CONFIG_PATH)
    /// 3. Environment variable overrides (`LITMUS_ENGINE__MAX_CONCURRENCY=8`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(LitmusConfig::default()))
            .merge(Toml::file("litmus.toml"));

        if let Ok(path) = std::env::var("LITMUS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: LitmusConfig = figment
            .merge(Env::prefixed("LITMUS_").split("__"))
            .extract()
            .map_err(|e| {
                LitmusError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: LitmusConfig = Figment::from(Serialized::defaults(LitmusConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                LitmusError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.max_concurrency == 0 {
            return Err(LitmusError::Configuration(
                "engine.max_concurrency must be at least 1".to_string(),
            ));
        }
        if engine.request_timeout.is_zero() || engine.provider_timeout.is_zero() {
            return Err(LitmusError::Configuration(
                "engine timeouts must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&engine.pass_threshold) {
            return Err(LitmusError::Configuration(format!(
                "engine.pass_threshold must be within [0, 1], got {}",
                engine.pass_threshold
            )));
        }
        if engine.tracing_header.trim().is_empty() {
            return Err(LitmusError::Configuration(
                "engine.tracing_header must not be empty".to_string(),
            ));
        }
        if engine.default_mission_duration == Some(0) {
            return Err(LitmusError::Configuration(
                "engine.default_mission_duration must be at least 1".to_string(),
            ));
        }
        if engine.retry.max_attempts == 0 {
            return Err(LitmusError::Configuration(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks for executing a run in a fresh process: templates must come
    /// from `templates_dir` or from a persistent store.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.templates_dir.is_none() && !self.store.is_persistent() {
            return Err(LitmusError::Configuration(
                "no template source: set templates_dir or configure a persistent store".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks for inspecting or changing runs written by another process
    pub fn validate_for_admin(&self) -> Result<()> {
        if !self.store.is_persistent() {
            return Err(LitmusError::Configuration(
                "run administration needs a persistent store; the configured store is process-local"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
