//! In-memory stores for tests and single-process runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{RunStore, StoreError, TemplateRepository};
use crate::model::{Progress, Run, RunStatus, Template, TestCaseResult};

/// Templates held in a map
#[derive(Default)]
pub struct InMemoryTemplateRepository {
    templates: RwLock<HashMap<String, Template>>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository holding `templates`
    pub fn with_templates(templates: impl IntoIterator<Item = Template>) -> Self {
        Self {
            templates: RwLock::new(templates.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub async fn insert(&self, template: Template) {
        self.templates.write().await.insert(template.id.clone(), template);
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.templates.read().await.get(id).cloned())
    }
}

struct RunEntry {
    run: Run,
    results: BTreeMap<usize, TestCaseResult>,
}

/// Runs and results under one lock, so progress updates are atomic
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn current<'a>(
    runs: &'a mut HashMap<String, RunEntry>,
    run_id: &str,
    epoch: &str,
) -> Result<&'a mut RunEntry, StoreError> {
    match runs.get_mut(run_id) {
        Some(entry) if entry.run.epoch == epoch => Ok(entry),
        _ => Err(StoreError::RunGone(run_id.to_string())),
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn open_run(&self, run_id: &str, template_id: &str) -> Result<Run, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs.entry(run_id.to_string()).or_insert_with(|| RunEntry {
            run: Run::new(run_id, template_id),
            results: BTreeMap::new(),
        });
        Ok(entry.run.clone())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.read().await.get(run_id).map(|e| e.run.clone()))
    }

    async fn start_run(&self, run_id: &str, epoch: &str, total: usize) -> Result<Run, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = current(&mut runs, run_id, epoch)?;
        entry.run.status = RunStatus::Running;
        entry.run.progress = Progress { completed: 0, total };
        entry.run.start_time = Some(Utc::now());
        entry.run.end_time = None;
        entry.run.failure_reason = None;
        Ok(entry.run.clone())
    }

    async fn record_result(
        &self,
        run_id: &str,
        epoch: &str,
        result: &TestCaseResult,
    ) -> Result<Progress, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = current(&mut runs, run_id, epoch)?;
        let is_new = entry
            .results
            .insert(result.unit_index, result.clone())
            .is_none();
        if is_new {
            entry.run.progress.completed += 1;
        }
        Ok(entry.run.progress)
    }

    async fn finish_run(
        &self,
        run_id: &str,
        epoch: &str,
        status: RunStatus,
        failure_reason: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = current(&mut runs, run_id, epoch)?;
        entry.run.status = status;
        entry.run.end_time = Some(Utc::now());
        entry.run.failure_reason = failure_reason;
        Ok(entry.run.clone())
    }

    async fn list_results(&self, run_id: &str) -> Result<Vec<TestCaseResult>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|e| e.results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn restart_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        entry.results.clear();
        entry.run = Run {
            generation: entry.run.generation + 1,
            progress: Progress {
                completed: 0,
                total: entry.run.progress.total,
            },
            ..Run::new(run_id, entry.run.template_id.clone())
        };
        Ok(entry.run.clone())
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .remove(run_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }
}
