//! SurrealDB-backed template repository and run store
//!
//! Works with any engine `surrealdb::engine::any` accepts: `mem://` for
//! tests, `ws://` / `http://` for a shared server. Runs are plain documents
//! in the `run` table. Templates and results carry arbitrary JSON and are
//! stored as JSON text in a `doc` field next to their lookup keys.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use uuid::Uuid;

use super::{RunStore, StoreError, TemplateRepository};
use crate::model::{Progress, Run, RunStatus, Template, TestCaseResult};

const RUN_TABLE: &str = "run";
const RUN_GONE: &str = "litmus: run gone";

#[derive(Debug, Serialize, Deserialize)]
struct DocRow {
    doc: String,
}

#[derive(Debug, Serialize)]
struct TemplateRow {
    template_id: String,
    doc: String,
}

/// SurrealDB store
#[derive(Debug, Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Connect, sign in when credentials are given, and select namespace/database
    pub async fn connect(
        url: &str,
        namespace: &str,
        database: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, StoreError> {
        let db = any::connect(url)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to SurrealDB at {}: {}", url, e)))?;

        if let (Some(username), Some(password)) = (username, password) {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await.map_err(|e| {
            StoreError::Backend(format!("Failed to set namespace/database: {}", e))
        })?;

        db.query(
            "DEFINE TABLE IF NOT EXISTS run SCHEMALESS;
             DEFINE TABLE IF NOT EXISTS template SCHEMALESS;
             DEFINE TABLE IF NOT EXISTS test_case_result SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS result_run_idx ON test_case_result FIELDS run_id;",
        )
        .await?
        .check()?;

        tracing::info!(url = %url, namespace = %namespace, database = %database, "Connected to SurrealDB");
        Ok(Self { db })
    }

    /// Store or replace a template
    pub async fn put_template(&self, template: &Template) -> Result<(), StoreError> {
        let row = TemplateRow {
            template_id: template.id.clone(),
            doc: serde_json::to_string(template)?,
        };
        self.db
            .query("UPSERT type::thing('template', $id) CONTENT $row")
            .bind(("id", template.id.clone()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &str,
        epoch: &str,
        assignments: &str,
        extra: Vec<(&'static str, serde_json::Value)>,
    ) -> Result<Run, StoreError> {
        let sql = format!(
            "UPDATE type::thing('run', $run_id) SET {} WHERE epoch = $epoch RETURN AFTER",
            assignments
        );
        let mut query = self
            .db
            .query(sql)
            .bind(("run_id", run_id.to_string()))
            .bind(("epoch", epoch.to_string()));
        for (name, value) in extra {
            query = query.bind((name, value));
        }
        let mut response = query.await?.check()?;
        let updated: Vec<Run> = response.take(0)?;
        updated
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::RunGone(run_id.to_string()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(id: &str, doc: &str) -> Result<T, StoreError> {
    serde_json::from_str(doc).map_err(|e| StoreError::InvalidDocument {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl TemplateRepository for SurrealStore {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        let row: Option<DocRow> = self.db.select(("template", id)).await?;
        row.map(|r| decode(id, &r.doc)).transpose()
    }
}

#[async_trait]
impl RunStore for SurrealStore {
    async fn open_run(&self, run_id: &str, template_id: &str) -> Result<Run, StoreError> {
        if let Some(run) = self.get_run(run_id).await? {
            return Ok(run);
        }
        let created: Option<Run> = self
            .db
            .create((RUN_TABLE, run_id))
            .content(Run::new(run_id, template_id))
            .await?;
        created.ok_or_else(|| StoreError::Backend(format!("Failed to create run '{}'", run_id)))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.db.select((RUN_TABLE, run_id)).await?)
    }

    async fn start_run(&self, run_id: &str, epoch: &str, total: usize) -> Result<Run, StoreError> {
        self.update_run(
            run_id,
            epoch,
            "status = 'running', progress = { completed: 0, total: $total }, start_time = $now, end_time = NONE, failure_reason = NONE",
            vec![
                ("total", serde_json::json!(total)),
                ("now", serde_json::json!(Utc::now())),
            ],
        )
        .await
    }

    async fn record_result(
        &self,
        run_id: &str,
        epoch: &str,
        result: &TestCaseResult,
    ) -> Result<Progress, StoreError> {
        let sql = format!(
            "BEGIN TRANSACTION;
             LET $current = (SELECT VALUE epoch FROM type::thing('run', $run_id))[0];
             IF $current != $epoch {{ THROW '{RUN_GONE}' }};
             IF (SELECT VALUE id FROM type::thing('test_case_result', $result_id))[0] = NONE {{
                 UPDATE type::thing('run', $run_id) SET progress.completed += 1;
             }};
             UPSERT type::thing('test_case_result', $result_id) CONTENT {{
                 run_id: $run_id, unit_index: $unit_index, epoch: $epoch, doc: $doc
             }};
             COMMIT TRANSACTION;"
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("run_id", run_id.to_string()))
            .bind(("epoch", epoch.to_string()))
            .bind(("result_id", result.id.clone()))
            .bind(("unit_index", result.unit_index))
            .bind(("doc", serde_json::to_string(result)?))
            .await?;

        let errors = response.take_errors();
        if errors.values().any(|e| e.to_string().contains(RUN_GONE)) {
            return Err(StoreError::RunGone(run_id.to_string()));
        }
        if let Some(error) = errors.into_values().next() {
            return Err(error.into());
        }

        self.get_run(run_id)
            .await?
            .map(|run| run.progress)
            .ok_or_else(|| StoreError::RunGone(run_id.to_string()))
    }

    async fn finish_run(
        &self,
        run_id: &str,
        epoch: &str,
        status: RunStatus,
        failure_reason: Option<String>,
    ) -> Result<Run, StoreError> {
        self.update_run(
            run_id,
            epoch,
            "status = $status, end_time = $now, failure_reason = $reason",
            vec![
                ("status", serde_json::to_value(status)?),
                ("now", serde_json::json!(Utc::now())),
                ("reason", serde_json::json!(failure_reason)),
            ],
        )
        .await
    }

    async fn list_results(&self, run_id: &str) -> Result<Vec<TestCaseResult>, StoreError> {
        let mut response = self
            .db
            .query("SELECT doc, unit_index FROM test_case_result WHERE run_id = $run_id ORDER BY unit_index")
            .bind(("run_id", run_id.to_string()))
            .await?
            .check()?;
        let rows: Vec<DocRow> = response.take(0)?;
        rows.iter().map(|r| decode(run_id, &r.doc)).collect()
    }

    async fn restart_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        self.db
            .query(
                "BEGIN TRANSACTION;
                 DELETE test_case_result WHERE run_id = $run_id;
                 UPDATE type::thing('run', $run_id) SET generation += 1, epoch = $epoch, status = 'not_started',
                     progress.completed = 0, start_time = NONE, end_time = NONE, failure_reason = NONE;
                 COMMIT TRANSACTION;",
            )
            .bind(("run_id", run_id.to_string()))
            .bind(("epoch", Uuid::new_v4().to_string()))
            .await?
            .check()?;

        tracing::info!(run_id = %run_id, generation = run.generation + 1, "Run restarted");
        self.get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        if self.get_run(run_id).await?.is_none() {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        self.db
            .query(
                "BEGIN TRANSACTION;
                 DELETE test_case_result WHERE run_id = $run_id;
                 DELETE type::thing('run', $run_id);
                 COMMIT TRANSACTION;",
            )
            .bind(("run_id", run_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
