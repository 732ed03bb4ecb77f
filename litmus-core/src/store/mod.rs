//! Template repository and run/result store
//!
//! The engine only reads templates. Runs and results are written through
//! [`RunStore`], whose writes are fenced by the run's `epoch`. A restart
//! replaces it, and a run recreated after a delete gets a fresh one, so
//! writes from the old execution fail with [`StoreError::RunGone`].

mod memory;
mod surreal;
mod template_files;

pub use memory::{InMemoryRunStore, InMemoryTemplateRepository};
pub use surreal::SurrealStore;
pub use template_files::FileTemplateRepository;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LitmusConfig;
use crate::config::StoreConfig;
use crate::model::{Progress, Run, RunStatus, Template, TestCaseResult};

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// Deleted, or restarted since this execution opened it
    #[error("Run '{0}' was deleted or restarted")]
    RunGone(String),

    #[error("Document '{id}' is invalid: {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Read-only access to templates
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// `Ok(None)` when no template has this id
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError>;
}

/// Persistence for runs and their per-unit results
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a run, creating it as `NotStarted` if absent
    async fn open_run(&self, run_id: &str, template_id: &str) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Mark the run `Running` with `total` units and zero progress
    async fn start_run(&self, run_id: &str, epoch: &str, total: usize) -> Result<Run, StoreError>;

    /// Persist a result and increment progress as one atomic operation
    async fn record_result(
        &self,
        run_id: &str,
        epoch: &str,
        result: &TestCaseResult,
    ) -> Result<Progress, StoreError>;

    /// Set a terminal status and end time
    async fn finish_run(
        &self,
        run_id: &str,
        epoch: &str,
        status: RunStatus,
        failure_reason: Option<String>,
    ) -> Result<Run, StoreError>;

    /// Results of the current incarnation, ordered by unit index
    async fn list_results(&self, run_id: &str) -> Result<Vec<TestCaseResult>, StoreError>;

    /// Clear results, bump the generation, replace the epoch and reopen as `NotStarted`
    async fn restart_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// Remove the run and its results
    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError>;
}

/// Store handles built from configuration
pub struct Stores {
    pub templates: Arc<dyn TemplateRepository>,
    pub runs: Arc<dyn RunStore>,
}

impl Stores {
    /// Connect the configured backend. A `templates_dir` overrides where
    /// templates are read from.
    pub async fn from_config(config: &LitmusConfig) -> Result<Self, StoreError> {
        let (templates, runs): (Arc<dyn TemplateRepository>, Arc<dyn RunStore>) = match &config.store {
            StoreConfig::Memory => (
                Arc::new(InMemoryTemplateRepository::new()),
                Arc::new(InMemoryRunStore::new()),
            ),
            StoreConfig::Surreal {
                url,
                namespace,
                database,
                username,
                password,
            } => {
                let store = Arc::new(
                    SurrealStore::connect(url, namespace, database, username.as_deref(), password.as_deref())
                        .await?,
                );
                (store.clone(), store)
            }
        };

        let templates = match &config.templates_dir {
            Some(dir) => Arc::new(FileTemplateRepository::new(dir)) as Arc<dyn TemplateRepository>,
            None => templates,
        };

        Ok(Self { templates, runs })
    }
}
