//! Run orchestration
//!
//! [`Orchestrator::execute`] drives one run end to end: it loads the
//! template, applies invocation overrides, skips blocked units, executes the
//! rest under bounded concurrency and persists one [`TestCaseResult`] per unit
//! with an atomic progress increment. A unit's failure never aborts the run.
//! When the store reports the run as deleted or restarted, remaining units
//! are cancelled and nothing more is written.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AllErroredPolicy, EngineConfig, LitmusConfig};
use crate::error::{LitmusError, Result, TemplateError, UnitError};
use crate::evaluation::{Evaluated, EvaluationDispatcher, EvaluationInput};
use crate::executor::{HttpTargetClient, RequestExecutor, TargetClient};
use crate::files::{resolver_from_config, FileResolver, TimedFileResolver};
use crate::llm::{CompletionPolicy, LLMProvider, LLMProviderFactory};
use crate::mission::{MissionController, MissionSpec};
use crate::model::{
    EvaluationType, Progress, RequestPhase, ResolutionWarning, ResultStatus, RunStatus, Template,
    TemplateKind, TestCaseResult, Unit,
};
use crate::parsing::output_text;
use crate::store::{RunStore, StoreError, Stores, TemplateRepository};
use crate::substitution::{expand, resolve_files, Bindings};

/// One invocation of the engine
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: String,
    pub template_id: String,
    /// Replaces the template's pre-request payload
    pub pre_request: Option<Value>,
    /// Replaces the template's post-request payload
    pub post_request: Option<Value>,
    /// Replaces the template's evaluation types
    pub evaluation_types: Option<Vec<EvaluationType>>,
    /// Value for `{auth_token}` placeholders
    pub auth_token: Option<String>,
}

impl RunRequest {
    pub fn new(run_id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            template_id: template_id.into(),
            ..Default::default()
        }
    }

    pub fn with_evaluation_types(mut self, types: Vec<EvaluationType>) -> Self {
        self.evaluation_types = Some(types);
        self
    }

    pub fn with_pre_request(mut self, payload: Value) -> Self {
        self.pre_request = Some(payload);
        self
    }

    pub fn with_post_request(mut self, payload: Value) -> Self {
        self.post_request = Some(payload);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Outcome of [`Orchestrator::execute`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub template_id: String,
    pub generation: u64,
    /// Terminal status, or the last status written when `cancelled`
    pub status: RunStatus,
    pub progress: Progress,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// The run was deleted or restarted while executing
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Default)]
struct Tally {
    passed: usize,
    failed: usize,
    errored: usize,
    progress: Progress,
}

impl Tally {
    fn add(&mut self, status: ResultStatus, progress: Progress) {
        match status {
            ResultStatus::Passed => self.passed += 1,
            ResultStatus::Failed => self.failed += 1,
            ResultStatus::Errored => self.errored += 1,
        }
        if progress.completed > self.progress.completed {
            self.progress = progress;
        }
    }

    fn recorded(&self) -> usize {
        self.passed + self.failed + self.errored
    }
}

enum UnitOutcome {
    Recorded(ResultStatus, Progress),
    Skipped,
    Gone,
    StoreFailed(StoreError),
}

/// Terminal status once every unit has a result
pub fn terminal_status(tally_errored: usize, total: usize, policy: AllErroredPolicy) -> RunStatus {
    if total > 0 && tally_errored == total && policy == AllErroredPolicy::Failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}

/// Status of a unit from its main-request error, extracted output and evaluations
pub fn unit_status(error: Option<&UnitError>, actual: Option<&str>, evaluated: Option<&Evaluated>) -> ResultStatus {
    if error.is_some() {
        return ResultStatus::Errored;
    }
    if let Some(verdict) = evaluated.and_then(|e| e.verdict) {
        return verdict;
    }
    match actual {
        Some(text) if !text.trim().is_empty() => ResultStatus::Passed,
        _ => ResultStatus::Failed,
    }
}

/// Drives runs against a template and run store
#[derive(Clone)]
pub struct Orchestrator {
    templates: Arc<dyn TemplateRepository>,
    runs: Arc<dyn RunStore>,
    executor: RequestExecutor,
    dispatcher: EvaluationDispatcher,
    missions: MissionController,
    resolver: Arc<dyn FileResolver>,
    engine: EngineConfig,
}

impl Orchestrator {
    /// Assemble an orchestrator from its collaborators
    pub fn new(
        stores: Stores,
        client: Arc<dyn TargetClient>,
        provider: Arc<dyn LLMProvider>,
        resolver: Arc<dyn FileResolver>,
        config: &LitmusConfig,
    ) -> Self {
        let engine = config.engine.clone();
        let resolver: Arc<dyn FileResolver> = Arc::new(TimedFileResolver::new(resolver, engine.request_timeout));
        let policy = CompletionPolicy::from_config(&engine, config.llm.as_ref());
        let executor = RequestExecutor::from_config(client, &engine);
        let dispatcher = EvaluationDispatcher::new(provider.clone(), policy.clone(), engine.pass_threshold);
        let missions = MissionController::new(
            provider,
            policy,
            executor.clone(),
            resolver.clone(),
            dispatcher.clone(),
        );

        Self {
            templates: stores.templates,
            runs: stores.runs,
            executor,
            dispatcher,
            missions,
            resolver,
            engine,
        }
    }

    /// Build every collaborator from configuration
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be reached, the provider is misconfigured
    /// or an HTTP client cannot be built.
    pub async fn from_config(config: &LitmusConfig) -> Result<Self> {
        let stores = Stores::from_config(config).await?;
        let provider = LLMProviderFactory::from_config(config.llm.as_ref())?;
        let client = Arc::new(HttpTargetClient::new(config.engine.request_timeout)?);
        let resolver = resolver_from_config(&config.files, config.engine.request_timeout)?;
        Ok(Self::new(stores, client, provider, resolver, config))
    }

    /// Execute a run to a terminal state.
    ///
    /// # Errors
    ///
    /// Template errors and store failures other than a vanished run are
    /// returned after the run has been marked `Failed`.
    pub async fn execute(&self, request: RunRequest) -> Result<RunSummary> {
        let mut run = self.runs.open_run(&request.run_id, &request.template_id).await?;
        if run.template_id != request.template_id {
            return Err(TemplateError::Mismatch {
                run_id: run.id,
                expected: run.template_id,
                actual: request.template_id,
            }
            .into());
        }
        if run.status != RunStatus::NotStarted {
            tracing::info!(run_id = %run.id, status = ?run.status, "Run was executed before; restarting");
            run = self.runs.restart_run(&run.id).await?;
        }
        let generation = run.generation;
        let epoch = run.epoch.clone();

        let template = match self.load_template(&request).await {
            Ok(template) => template,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Run aborted before execution");
                self.fail_run(&run.id, &epoch, &e).await;
                return Err(e);
            }
        };

        let units: Vec<(usize, Unit)> = template
            .runnable_units()
            .map(|(index, unit)| (index, unit.clone()))
            .collect();
        let total = units.len();

        let mut summary = RunSummary {
            run_id: run.id.clone(),
            template_id: template.id.clone(),
            generation,
            status: RunStatus::Running,
            progress: Progress { completed: 0, total },
            passed: 0,
            failed: 0,
            errored: 0,
            cancelled: false,
            failure_reason: None,
        };

        match self.runs.start_run(&run.id, &epoch, total).await {
            Ok(_) => {}
            Err(StoreError::RunGone(_)) => {
                summary.status = run.status;
                summary.cancelled = true;
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            run_id = %run.id,
            template_id = %template.id,
            kind = ?template.kind,
            units = total,
            blocked = template.units.len() - total,
            max_concurrency = self.engine.max_concurrency,
            "Run started"
        );

        let template = Arc::new(template);
        let request = Arc::new(request);
        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.engine.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut pending = BTreeMap::new();

        for (index, unit) in units {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| LitmusError::Other(format!("Unit scheduler closed: {}", e)))?,
            };

            pending.insert(index, unit.clone());
            let this = self.clone();
            let template = template.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            let run_id = run.id.clone();
            let epoch = epoch.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = this
                    .execute_unit(&run_id, &epoch, template, request, index, unit, cancel)
                    .await;
                (index, outcome)
            });
        }

        let mut tally = Tally::default();
        let mut store_failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(reported) => reported,
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "Unit task failed to complete");
                    continue;
                }
            };
            pending.remove(&index);
            match outcome {
                UnitOutcome::Recorded(status, progress) => tally.add(status, progress),
                UnitOutcome::Skipped => {}
                UnitOutcome::Gone => summary.cancelled = true,
                UnitOutcome::StoreFailed(e) => {
                    cancel.cancel();
                    store_failure.get_or_insert(e);
                }
            }
        }

        // Units whose task died before reporting still get a result
        if !summary.cancelled && store_failure.is_none() {
            for (index, unit) in pending {
                let result = TestCaseResult::errored(
                    &run.id,
                    index,
                    &unit,
                    UnitError::Aborted("unit task failed to complete".into()),
                );
                match self.runs.record_result(&run.id, &epoch, &result).await {
                    Ok(progress) => tally.add(ResultStatus::Errored, progress),
                    Err(StoreError::RunGone(_)) => {
                        summary.cancelled = true;
                        break;
                    }
                    Err(e) => {
                        store_failure = Some(e);
                        break;
                    }
                }
            }
        }

        summary.passed = tally.passed;
        summary.failed = tally.failed;
        summary.errored = tally.errored;
        summary.progress = Progress {
            completed: tally.progress.completed.max(tally.recorded()).min(total),
            total,
        };

        if summary.cancelled {
            tracing::warn!(run_id = %run.id, generation, "Run was deleted or restarted; execution cancelled");
            return Ok(summary);
        }

        if let Some(e) = store_failure {
            let err = LitmusError::Store(e);
            self.fail_run(&run.id, &epoch, &err).await;
            return Err(err);
        }

        let status = terminal_status(tally.errored, total, self.engine.all_errored_policy);
        let reason = (status == RunStatus::Failed).then(|| "Every unit errored".to_string());
        match self.runs.finish_run(&run.id, &epoch, status, reason.clone()).await {
            Ok(_) => {}
            Err(StoreError::RunGone(_)) => {
                summary.cancelled = true;
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        }

        summary.status = status;
        summary.failure_reason = reason;
        tracing::info!(
            run_id = %run.id,
            status = ?status,
            passed = summary.passed,
            failed = summary.failed,
            errored = summary.errored,
            "Run finished"
        );
        Ok(summary)
    }

    async fn load_template(&self, request: &RunRequest) -> Result<Template> {
        let mut template = match self.templates.get_template(&request.template_id).await {
            Ok(Some(template)) => template,
            Ok(None) => return Err(TemplateError::NotFound(request.template_id.clone()).into()),
            Err(StoreError::InvalidDocument { id, reason }) => {
                return Err(TemplateError::Malformed { id, reason }.into());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(payload) = &request.pre_request {
            template.pre_request = Some(payload.clone());
        }
        if let Some(payload) = &request.post_request {
            template.post_request = Some(payload.clone());
        }
        if let Some(types) = &request.evaluation_types {
            template.evaluation_types = types.clone();
        }
        if template.kind == TemplateKind::Mission && template.mission_duration.is_none() {
            template.mission_duration = self.engine.default_mission_duration;
        }

        template.validate()?;
        Ok(template)
    }

    async fn fail_run(&self, run_id: &str, epoch: &str, error: &LitmusError) {
        if let Err(e) = self
            .runs
            .finish_run(run_id, epoch, RunStatus::Failed, Some(error.to_string()))
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "Could not mark run as failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_unit(
        &self,
        run_id: &str,
        epoch: &str,
        template: Arc<Template>,
        request: Arc<RunRequest>,
        index: usize,
        unit: Unit,
        cancel: CancellationToken,
    ) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::Skipped;
        }

        let this = self.clone();
        let owned_run_id = run_id.to_string();
        let pipeline_unit = unit.clone();
        let mut pipeline = tokio::spawn(async move {
            this.run_pipeline(&owned_run_id, &template, &request, index, &pipeline_unit)
                .await
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                pipeline.abort();
                return UnitOutcome::Skipped;
            }
            joined = &mut pipeline => match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(run_id = %run_id, unit = index, error = %e, "Unit pipeline aborted");
                    TestCaseResult::errored(run_id, index, &unit, UnitError::Aborted(e.to_string()))
                }
            },
        };

        match self.runs.record_result(run_id, epoch, &result).await {
            Ok(progress) => {
                tracing::info!(
                    run_id = %run_id,
                    unit = index,
                    tracing_id = %result.tracing_id,
                    status = ?result.status,
                    progress = %progress,
                    "Unit completed"
                );
                UnitOutcome::Recorded(result.status, progress)
            }
            Err(StoreError::RunGone(_)) => {
                cancel.cancel();
                UnitOutcome::Gone
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, unit = index, error = %e, "Failed to persist unit result");
                UnitOutcome::StoreFailed(e)
            }
        }
    }

    /// Expand placeholders and file references of one payload
    async fn prepare(&self, payload: &Value, bindings: &Bindings, warnings: &mut Vec<ResolutionWarning>) -> Value {
        let (resolved, found) = resolve_files(&expand(payload, bindings), self.resolver.as_ref()).await;
        for warning in found {
            if !warnings.iter().any(|w| w.name == warning.name) {
                warnings.push(warning);
            }
        }
        resolved
    }

    async fn run_pipeline(
        &self,
        run_id: &str,
        template: &Template,
        request: &RunRequest,
        index: usize,
        unit: &Unit,
    ) -> TestCaseResult {
        let bindings = Bindings::for_unit(unit, request.auth_token.as_deref());
        let mut warnings = Vec::new();
        let mut result = TestCaseResult::errored(run_id, index, unit, UnitError::Aborted("not executed".into()));

        let pre = match &template.pre_request {
            Some(payload) => Some(self.prepare(payload, &bindings, &mut warnings).await),
            None => None,
        };
        result.pre_request = self.executor.execute_hook(RequestPhase::Pre, pre.as_ref()).await;

        let evaluation_input = EvaluationInput {
            query: unit.query.clone(),
            golden: unit.response.clone(),
            judge_prompt: template.judge_prompt.clone(),
            context: unit.source.clone(),
            metrics: template.metrics.clone(),
            ..Default::default()
        };

        let (error, evaluated) = match template.kind {
            TemplateKind::SingleTurn => {
                let payload = self.prepare(&template.request, &bindings, &mut warnings).await;
                match self.executor.execute(RequestPhase::Main, &payload).await {
                    Ok(exchange) => {
                        result.tracing_id = exchange.tracing_id().to_string();
                        result.actual = exchange
                            .body()
                            .and_then(|body| output_text(body, template.output_field.as_deref()));
                        let error = exchange.error.clone();
                        result.request = Some(exchange.record);

                        let evaluated = match &error {
                            Some(_) => None,
                            None => {
                                let input = EvaluationInput {
                                    actual: result.actual.clone().unwrap_or_default(),
                                    ..evaluation_input
                                };
                                Some(self.dispatcher.dispatch(&template.evaluation_types, &input).await)
                            }
                        };
                        (error, evaluated)
                    }
                    Err(e) => (Some(e), None),
                }
            }
            TemplateKind::Mission => {
                let outcome = self
                    .missions
                    .run(MissionSpec {
                        description: &unit.query,
                        golden: &unit.response,
                        payload: &template.request,
                        bindings: &bindings,
                        output_field: template.output_field.as_deref(),
                        judge_prompt: template.judge_prompt.as_deref(),
                        duration: template.mission_duration.unwrap_or(1),
                        evaluation_input,
                        evaluation_types: &template.evaluation_types,
                    })
                    .await;

                if let Some(last) = outcome.last_exchange() {
                    result.tracing_id = last.tracing_id.clone();
                    result.request = Some(last.clone());
                }
                if !outcome.transcript.is_empty() {
                    result.actual = Some(outcome.transcript.render());
                }
                for warning in outcome.warnings {
                    if !warnings.iter().any(|w| w.name == warning.name) {
                        warnings.push(warning);
                    }
                }
                let completed = outcome.transcript.completed;
                result.transcript = Some(outcome.transcript);

                // Without a deciding strategy a mission passes only when it reported done
                let evaluated = outcome.evaluation.map(|mut evaluated| {
                    if evaluated.verdict.is_none() && !completed {
                        evaluated.verdict = Some(ResultStatus::Failed);
                    }
                    evaluated
                });
                (outcome.error, evaluated)
            }
        };

        let post = match &template.post_request {
            Some(payload) => Some(self.prepare(payload, &bindings, &mut warnings).await),
            None => None,
        };
        result.post_request = self.executor.execute_hook(RequestPhase::Post, post.as_ref()).await;

        result.status = unit_status(error.as_ref(), result.actual.as_deref(), evaluated.as_ref());
        result.error = error.map(|e| e.to_string());
        result.evaluations = evaluated.map(|e| e.results).unwrap_or_default();
        result.warnings = warnings;
        result.completed_at = Utc::now();
        result
    }
}
