//! # Litmus - Test execution and evaluation for LLM-backed endpoints
//!
//! Litmus runs templated HTTP test cases and multi-turn "missions" against an
//! endpoint under test and scores the answers against expected results:
//! - Placeholder substitution and `[FILE: name]` resolution in request payloads
//! - Pre/main/post requests, each tagged with a fresh tracing id header
//! - LLM-guided missions driven by an explicit state machine
//! - Pluggable evaluation strategies (LLM judge, reference metrics, relevancy)
//! - Bounded-concurrency runs with atomic progress and restart/delete fencing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use litmus_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = LitmusConfig::load()?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!
//!     let summary = orchestrator
//!         .execute(RunRequest::new("run-42", "faq-regression"))
//!         .await?;
//!     println!("{:?}: {}", summary.status, summary.progress);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `llm-openai`: OpenAI-compatible chat completion provider
//! - `llm-ollama`: Ollama chat provider

pub mod config;
pub mod error;
pub mod evaluation;
pub mod executor;
pub mod files;
pub mod llm;
pub mod mission;
pub mod model;
pub mod orchestrator;
pub mod parsing;
pub mod store;
pub mod substitution;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AllErroredPolicy, EngineConfig, FileResolverConfig, LitmusConfig, StoreConfig};
    pub use crate::error::{EvaluationError, LitmusError, Result, TemplateError, UnitError};
    pub use crate::evaluation::{EvaluationDispatcher, EvaluationInput, EvaluationStrategy};
    pub use crate::executor::{HttpTargetClient, RequestExecutor, TargetClient};
    pub use crate::files::{FileError, FileResolver};
    pub use crate::llm::{LLMProvider, LLMProviderFactory};
    pub use crate::mission::{MissionController, MissionState};
    pub use crate::model::{
        EvaluationResult, EvaluationType, Progress, ResultStatus, Run, RunStatus, Template,
        TemplateKind, TestCaseResult, Unit,
    };
    pub use crate::orchestrator::{Orchestrator, RunRequest, RunSummary};
    pub use crate::store::{RunStore, StoreError, Stores, TemplateRepository};
}
