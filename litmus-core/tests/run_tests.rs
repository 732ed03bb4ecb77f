//! End-to-end runs against scripted targets and providers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use litmus_core::config::{AllErroredPolicy, LitmusConfig};
use litmus_core::error::{LitmusError, TemplateError, UnitError};
use litmus_core::executor::{OutboundRequest, ScriptedTarget, TargetClient, TargetResponse};
use litmus_core::files::{FileError, FileResolver, InMemoryFileResolver};
use litmus_core::llm::ScriptedProvider;
use litmus_core::model::{
    EvaluationType, Progress, ResultStatus, Run, RunStatus, Template, TestCaseResult, Unit,
};
use litmus_core::orchestrator::{Orchestrator, RunRequest};
use litmus_core::store::{InMemoryRunStore, InMemoryTemplateRepository, RunStore, StoreError, Stores};
use serde_json::{Value, json};

const JUDGE_NEEDLE: &str = "Best-known response";

fn test_config() -> LitmusConfig {
    let mut config = LitmusConfig::default();
    config.engine.retry.max_attempts = 1;
    config
}

struct Harness {
    orchestrator: Orchestrator,
    runs: Arc<InMemoryRunStore>,
}

fn harness(
    templates: Vec<Template>,
    target: Arc<dyn TargetClient>,
    provider: Arc<ScriptedProvider>,
    resolver: Arc<dyn FileResolver>,
    config: LitmusConfig,
) -> Harness {
    let runs = Arc::new(InMemoryRunStore::new());
    let stores = Stores {
        templates: Arc::new(InMemoryTemplateRepository::with_templates(templates)),
        runs: runs.clone(),
    };
    Harness {
        orchestrator: Orchestrator::new(stores, target, provider, resolver, &config),
        runs,
    }
}

fn query_of(request: &OutboundRequest) -> String {
    request
        .body
        .as_ref()
        .and_then(|b| b.get("q"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn echo_target() -> Arc<ScriptedTarget> {
    Arc::new(ScriptedTarget::new(|req| {
        Ok(TargetResponse::json(200, json!({"answer": format!("answer to {}", query_of(req))})))
    }))
}

fn faq_template(units: Vec<Unit>) -> Template {
    Template::single_turn("faq", json!({"url": "http://bot/ask", "body": {"q": "{query}"}}))
        .with_units(units)
        .with_output_field("answer")
}

fn passing_judge() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new().when(JUDGE_NEEDLE, &[r#"{"similarity": 0.9, "answered": true}"#]))
}

#[tokio::test]
async fn blocked_units_are_skipped() {
    let template = faq_template(vec![
        Unit::new("U1", "a1"),
        Unit::new("U2", "a2").blocked(),
        Unit::new("U3", "a3"),
    ]);
    let target = echo_target();
    let h = harness(
        vec![template],
        target.clone(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let summary = h.orchestrator.execute(RunRequest::new("run-1", "faq")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.progress.to_string(), "2/2");
    assert_eq!(summary.passed, 2);

    let results = h.runs.list_results("run-1").await.unwrap();
    let indices: Vec<usize> = results.iter().map(|r| r.unit_index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert!(results.iter().all(|r| r.query != "U2"));
    assert!(target.requests().iter().all(|r| query_of(r) != "U2"));

    let run = h.runs.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress.completed, 2);
    assert_eq!(run.progress.total, 2);
    assert!(run.start_time.is_some() && run.end_time.is_some());
}

#[tokio::test]
async fn server_error_isolated_to_its_unit() {
    let template = faq_template(vec![
        Unit::new("U1", "a1"),
        Unit::new("U2", "a2"),
        Unit::new("U3", "a3"),
    ]);
    let target = Arc::new(ScriptedTarget::new(|req| {
        if query_of(req) == "U2" {
            Ok(TargetResponse::json(500, json!({"error": "boom"})))
        } else {
            Ok(TargetResponse::json(200, json!({"answer": "fine"})))
        }
    }));
    let h = harness(
        vec![template],
        target,
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let summary = h.orchestrator.execute(RunRequest::new("run-2", "faq")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.passed, 2);

    let results = h.runs.list_results("run-2").await.unwrap();
    assert_eq!(results.len(), 3);
    let u2 = &results[1];
    assert_eq!(u2.query, "U2");
    assert_eq!(u2.status, ResultStatus::Errored);
    assert!(u2.error.as_deref().unwrap().contains("500"));
    assert!(u2.evaluations.is_empty());
    assert_eq!(u2.request.as_ref().unwrap().status, Some(500));

    for result in [&results[0], &results[2]] {
        assert_eq!(result.status, ResultStatus::Passed);
        assert_eq!(result.actual.as_deref(), Some("fine"));
        assert_eq!(result.evaluations[0].scores["similarity"], 0.9);
    }
}

#[tokio::test]
async fn mission_stops_when_done() {
    let template = Template::mission("m1", json!({"url": "http://bot/chat", "body": {"q": "{query}"}}), 5)
        .with_units(vec![Unit::new("Book a table for two", "A reservation confirmation")])
        .with_output_field("answer");
    let provider = Arc::new(
        ScriptedProvider::new()
            .when(
                "What is the next request",
                &[r#"{"request": "Hi"}"#, r#"{"request": "Two people at 7pm"}"#, r#"{"request": "Confirm"}"#],
            )
            .when("has the mission been successfully completed", &["no", "no", "yes"])
            .when(JUDGE_NEEDLE, &[r#"{"similarity": 0.7, "overall_success": "Successful"}"#]),
    );
    let target = echo_target();
    let h = harness(
        vec![template],
        target.clone(),
        provider.clone(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let summary = h.orchestrator.execute(RunRequest::new("run-3", "m1")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let results = h.runs.list_results("run-3").await.unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    let transcript = result.transcript.as_ref().unwrap();
    assert_eq!(transcript.len(), 3);
    assert!(transcript.completed);
    assert_eq!(transcript.turns[1].response, "answer to Two people at 7pm");
    assert_eq!(target.requests().len(), 3);

    assert_eq!(provider.count_matching(JUDGE_NEEDLE), 1);
    assert_eq!(result.evaluations.len(), 1);
    assert_eq!(result.status, ResultStatus::Passed);
    assert_eq!(result.tracing_id, transcript.turns[2].exchange.tracing_id);
}

#[tokio::test]
async fn mission_budget_exhausted_evaluates_once() {
    let template = Template::mission("m2", json!({"url": "http://bot/chat", "body": {"q": "{query}"}}), 2)
        .with_units(vec![Unit::new("Cancel my order", "Order cancelled")])
        .with_output_field("answer");
    let provider = Arc::new(
        ScriptedProvider::new()
            .when("What is the next request", &[r#"{"request": "Please cancel"}"#])
            .when("has the mission been successfully completed", &["no"])
            .when(JUDGE_NEEDLE, &[r#"{"similarity": 0.2}"#]),
    );
    let h = harness(
        vec![template],
        echo_target(),
        provider.clone(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    h.orchestrator.execute(RunRequest::new("run-4", "m2")).await.unwrap();
    let result = &h.runs.list_results("run-4").await.unwrap()[0];
    assert_eq!(result.transcript.as_ref().unwrap().len(), 2);
    assert_eq!(provider.count_matching(JUDGE_NEEDLE), 1);
    assert_eq!(result.status, ResultStatus::Failed);
}

#[tokio::test]
async fn missing_file_reference_is_a_warning() {
    let template = Template::single_turn(
        "files",
        json!({"url": "http://bot/ask", "body": {"q": "{query}", "doc": "[FILE: missing.txt]"}}),
    )
    .with_units(vec![Unit::new("Summarize", "A summary")])
    .with_output_field("answer");
    let target = echo_target();
    let h = harness(
        vec![template],
        target.clone(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    h.orchestrator.execute(RunRequest::new("run-5", "files")).await.unwrap();

    let sent = &target.requests()[0];
    assert_eq!(sent.body.as_ref().unwrap()["doc"], "[FILE: missing.txt]");

    let result = &h.runs.list_results("run-5").await.unwrap()[0];
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].name, "missing.txt");
    assert!(result.error.is_none());
    assert_eq!(result.status, ResultStatus::Passed);
}

#[tokio::test]
async fn resolved_files_and_tracing_headers() {
    let template = Template::single_turn(
        "files",
        json!({
            "url": "http://bot/ask",
            "headers": {"Authorization": "Bearer {auth_token}", "x-litmus-request": "stale"},
            "body": {"q": "{query}", "doc": "[FILE: policy.txt]"}
        }),
    )
    .with_units(vec![Unit::new("Q1", "A1"), Unit::new("Q2", "A2")])
    .with_output_field("answer");
    let target = echo_target();
    let resolver = InMemoryFileResolver::new().with_file("policy.txt", "Refunds within 30 days");
    let h = harness(vec![template], target.clone(), passing_judge(), Arc::new(resolver), test_config());

    h.orchestrator
        .execute(RunRequest::new("run-6", "files").with_auth_token("s3cret"))
        .await
        .unwrap();

    let requests = target.requests();
    assert_eq!(requests.len(), 2);
    let mut ids: Vec<&String> = requests.iter().map(|r| &r.headers["X-Litmus-Request"]).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    for request in &requests {
        assert!(!request.headers.contains_key("x-litmus-request"));
        assert_eq!(request.headers["Authorization"], "Bearer s3cret");
        assert_eq!(request.body.as_ref().unwrap()["doc"], "Refunds within 30 days");
        assert!(uuid::Uuid::parse_str(&request.headers["X-Litmus-Request"]).is_ok());
    }

    let results = h.runs.list_results("run-6").await.unwrap();
    assert!(results.iter().all(|r| r.warnings.is_empty()));
    let recorded: Vec<&str> = results.iter().map(|r| r.tracing_id.as_str()).collect();
    assert!(recorded.iter().all(|id| ids.iter().any(|sent| sent.as_str() == *id)));
}

#[tokio::test]
async fn hooks_and_overrides() {
    let template = faq_template(vec![Unit::new("U1", "a1")]);
    let target = Arc::new(ScriptedTarget::new(|req| {
        if req.url.ends_with("/reset") {
            Ok(TargetResponse::json(503, json!("down")))
        } else {
            Ok(TargetResponse::json(200, json!({"answer": "ok"})))
        }
    }));
    let provider = Arc::new(ScriptedProvider::new());
    let h = harness(
        vec![template],
        target.clone(),
        provider.clone(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let request = RunRequest::new("run-7", "faq")
        .with_pre_request(json!({"url": "http://bot/reset", "body": {"for": "{query}"}}))
        .with_post_request(json!({"url": "http://bot/cleanup", "method": "DELETE"}))
        .with_evaluation_types(Vec::new());
    let summary = h.orchestrator.execute(request).await.unwrap();
    assert_eq!(summary.passed, 1);

    let urls: Vec<String> = target.requests().iter().map(|r| r.url.clone()).collect();
    assert_eq!(urls, vec!["http://bot/reset", "http://bot/ask", "http://bot/cleanup"]);
    assert_eq!(provider.call_count(), 0);

    let result = &h.runs.list_results("run-7").await.unwrap()[0];
    let pre = result.pre_request.as_ref().unwrap();
    assert_eq!(pre.status, Some(503));
    assert!(pre.error.is_some());
    assert_eq!(pre.request_body.as_ref().unwrap()["for"], "U1");
    assert_eq!(result.post_request.as_ref().unwrap().method, "DELETE");
    assert_eq!(result.status, ResultStatus::Passed);
}

#[tokio::test]
async fn judge_failure_does_not_error_unit() {
    let template = faq_template(vec![Unit::new("U1", "a1")])
        .with_evaluation_types(vec![EvaluationType::CustomJudge, EvaluationType::RelevancySuite]);
    let provider = Arc::new(
        ScriptedProvider::new()
            .fail_when(JUDGE_NEEDLE, "rate limited")
            .then_reply(r#"{"score": 0.8, "reason": "on topic"}"#),
    );
    let h = harness(
        vec![template],
        echo_target(),
        provider,
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    h.orchestrator.execute(RunRequest::new("run-8", "faq")).await.unwrap();
    let result = &h.runs.list_results("run-8").await.unwrap()[0];
    assert_eq!(result.evaluations.len(), 2);
    assert!(result.evaluations[0].is_error());
    assert!(!result.evaluations[1].is_error());
    assert_eq!(result.status, ResultStatus::Passed);
}

#[tokio::test]
async fn all_errored_policy_decides_run_status() {
    let failing = || {
        Arc::new(ScriptedTarget::new(|req| {
            Err(UnitError::Transport {
                url: req.url.clone(),
                message: "connection refused".into(),
            })
        }))
    };
    let units = vec![Unit::new("U1", "a1"), Unit::new("U2", "a2")];

    let h = harness(
        vec![faq_template(units.clone())],
        failing(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );
    let summary = h.orchestrator.execute(RunRequest::new("run-9", "faq")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.errored, 2);
    assert_eq!(summary.progress.completed, 2);

    let mut config = test_config();
    config.engine.all_errored_policy = AllErroredPolicy::Completed;
    let h = harness(
        vec![faq_template(units)],
        failing(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        config,
    );
    let summary = h.orchestrator.execute(RunRequest::new("run-9", "faq")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
}

#[tokio::test]
async fn missing_template_fails_run() {
    let target = echo_target();
    let h = harness(
        Vec::new(),
        target.clone(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let err = h
        .orchestrator
        .execute(RunRequest::new("run-10", "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, LitmusError::Template(TemplateError::NotFound(_))));

    let run = h.runs.get_run("run-10").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.unwrap().contains("ghost"));
    assert!(target.requests().is_empty());
}

#[tokio::test]
async fn mission_without_duration_is_malformed() {
    let mut template = Template::mission("m3", json!({"url": "http://bot"}), 1)
        .with_units(vec![Unit::new("Do it", "Done")]);
    template.mission_duration = None;

    let h = harness(
        vec![template.clone()],
        echo_target(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );
    let err = h.orchestrator.execute(RunRequest::new("run-11", "m3")).await.unwrap_err();
    assert!(matches!(
        err,
        LitmusError::Template(TemplateError::MissingMissionDuration(_))
    ));

    let mut config = test_config();
    config.engine.default_mission_duration = Some(1);
    let provider = Arc::new(
        ScriptedProvider::new()
            .when("What is the next request", &[r#"{"request": "go"}"#])
            .when("has the mission been successfully completed", &["yes"])
            .when(JUDGE_NEEDLE, &[r#"{"similarity": 1.0}"#]),
    );
    let h = harness(
        vec![template],
        echo_target(),
        provider,
        Arc::new(InMemoryFileResolver::new()),
        config,
    );
    let summary = h.orchestrator.execute(RunRequest::new("run-11", "m3")).await.unwrap();
    assert_eq!(summary.passed, 1);
}

#[tokio::test]
async fn rerun_restarts_with_new_generation() {
    let h = harness(
        vec![faq_template(vec![Unit::new("U1", "a1")])],
        echo_target(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        test_config(),
    );

    let first = h.orchestrator.execute(RunRequest::new("run-12", "faq")).await.unwrap();
    let second = h.orchestrator.execute(RunRequest::new("run-12", "faq")).await.unwrap();
    assert_eq!(first.generation, 0);
    assert_eq!(second.generation, 1);
    assert_eq!(h.runs.list_results("run-12").await.unwrap().len(), 1);

    let err = h
        .orchestrator
        .execute(RunRequest::new("run-12", "other"))
        .await
        .unwrap_err();
    assert!(matches!(err, LitmusError::Template(TemplateError::Mismatch { .. })));
}

#[tokio::test]
async fn many_units_under_bounded_concurrency() {
    let units: Vec<Unit> = (0..12).map(|i| Unit::new(format!("Q{}", i), "A")).collect();
    let mut config = test_config();
    config.engine.max_concurrency = 3;
    let h = harness(
        vec![faq_template(units)],
        echo_target(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        config,
    );

    let summary = h.orchestrator.execute(RunRequest::new("run-13", "faq")).await.unwrap();
    assert_eq!(summary.progress.to_string(), "12/12");

    let results = h.runs.list_results("run-13").await.unwrap();
    let mut ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    ids.dedup();
    assert_eq!(ids.len(), 12);
    assert_eq!(results[11].id, "run-13:11");
}

#[derive(Clone, Copy)]
enum Interference {
    Delete,
    Restart,
    Recreate,
}

/// Target that changes the run out from under the engine while its first
/// request is in flight
struct InterferingTarget {
    runs: Arc<InMemoryRunStore>,
    run_id: String,
    interference: Interference,
    calls: AtomicUsize,
}

#[async_trait]
impl TargetClient for InterferingTarget {
    async fn send(&self, _request: &OutboundRequest) -> Result<TargetResponse, UnitError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            match self.interference {
                Interference::Delete => self.runs.delete_run(&self.run_id).await.unwrap(),
                Interference::Restart => {
                    self.runs.restart_run(&self.run_id).await.unwrap();
                }
                Interference::Recreate => {
                    self.runs.delete_run(&self.run_id).await.unwrap();
                    self.runs.open_run(&self.run_id, "faq").await.unwrap();
                }
            }
        }
        Ok(TargetResponse::json(200, json!({"answer": "late"})))
    }
}

async fn interfere(
    interference: Interference,
) -> (Arc<InMemoryRunStore>, Arc<InterferingTarget>, litmus_core::orchestrator::RunSummary) {
    let runs = Arc::new(InMemoryRunStore::new());
    let target = Arc::new(InterferingTarget {
        runs: runs.clone(),
        run_id: "run-x".into(),
        interference,
        calls: AtomicUsize::new(0),
    });
    let stores = Stores {
        templates: Arc::new(InMemoryTemplateRepository::with_templates(vec![faq_template(vec![
            Unit::new("U1", "a1"),
            Unit::new("U2", "a2"),
            Unit::new("U3", "a3"),
        ])])),
        runs: runs.clone(),
    };
    let mut config = test_config();
    config.engine.max_concurrency = 1;
    let orchestrator = Orchestrator::new(
        stores,
        target.clone(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        &config,
    );

    let summary = orchestrator.execute(RunRequest::new("run-x", "faq")).await.unwrap();
    (runs, target, summary)
}

#[tokio::test]
async fn deleted_run_stops_execution() {
    let (runs, target, summary) = interfere(Interference::Delete).await;
    assert!(summary.cancelled);
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    assert!(runs.get_run("run-x").await.unwrap().is_none());
    assert!(runs.list_results("run-x").await.unwrap().is_empty());
}

#[tokio::test]
async fn restarted_run_is_not_written_by_old_execution() {
    let (runs, target, summary) = interfere(Interference::Restart).await;
    assert!(summary.cancelled);
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);

    let run = runs.get_run("run-x").await.unwrap().unwrap();
    assert_eq!(run.generation, 1);
    assert_eq!(run.status, RunStatus::NotStarted);
    assert_eq!(run.progress.completed, 0);
    assert!(runs.list_results("run-x").await.unwrap().is_empty());
}

#[tokio::test]
async fn recreated_run_is_not_written_by_old_execution() {
    let (runs, target, summary) = interfere(Interference::Recreate).await;
    assert!(summary.cancelled);
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);

    let run = runs.get_run("run-x").await.unwrap().unwrap();
    assert_eq!(run.generation, 0);
    assert_eq!(run.status, RunStatus::NotStarted);
    assert_eq!(run.progress.completed, 0);
    assert!(run.end_time.is_none());
    assert!(runs.list_results("run-x").await.unwrap().is_empty());
}

/// File resolver that never answers
struct StalledResolver;

#[async_trait]
impl FileResolver for StalledResolver {
    async fn resolve(&self, _name: &str) -> Result<String, FileError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_blob_store_does_not_hang_the_run() {
    let template = Template::single_turn(
        "files",
        json!({"url": "http://bot/ask", "body": {"q": "{query}", "doc": "[FILE: policy.txt]"}}),
    )
    .with_units(vec![Unit::new("Q1", "A1"), Unit::new("Q2", "A2")])
    .with_output_field("answer");
    let target = echo_target();
    let h = harness(
        vec![template],
        target.clone(),
        passing_judge(),
        Arc::new(StalledResolver),
        test_config(),
    );

    let summary = h.orchestrator.execute(RunRequest::new("run-15", "files")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.progress.to_string(), "2/2");

    assert!(target
        .requests()
        .iter()
        .all(|r| r.body.as_ref().unwrap()["doc"] == "[FILE: policy.txt]"));
    for result in h.runs.list_results("run-15").await.unwrap() {
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].name, "policy.txt");
        assert!(result.warnings[0].reason.contains("timed out"));
    }
}

/// Run store whose first write for one unit panics inside the unit task
struct PanickingRunStore {
    inner: InMemoryRunStore,
    unit: usize,
    tripped: AtomicBool,
}

#[async_trait]
impl RunStore for PanickingRunStore {
    async fn open_run(&self, run_id: &str, template_id: &str) -> Result<Run, StoreError> {
        self.inner.open_run(run_id, template_id).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn start_run(&self, run_id: &str, epoch: &str, total: usize) -> Result<Run, StoreError> {
        self.inner.start_run(run_id, epoch, total).await
    }

    async fn record_result(
        &self,
        run_id: &str,
        epoch: &str,
        result: &TestCaseResult,
    ) -> Result<Progress, StoreError> {
        if result.unit_index == self.unit && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("connection reset while writing unit {}", result.unit_index);
        }
        self.inner.record_result(run_id, epoch, result).await
    }

    async fn finish_run(
        &self,
        run_id: &str,
        epoch: &str,
        status: RunStatus,
        failure_reason: Option<String>,
    ) -> Result<Run, StoreError> {
        self.inner.finish_run(run_id, epoch, status, failure_reason).await
    }

    async fn list_results(&self, run_id: &str) -> Result<Vec<TestCaseResult>, StoreError> {
        self.inner.list_results(run_id).await
    }

    async fn restart_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.inner.restart_run(run_id).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        self.inner.delete_run(run_id).await
    }
}

#[tokio::test]
async fn crashed_unit_task_is_recorded_as_errored() {
    let runs = Arc::new(PanickingRunStore {
        inner: InMemoryRunStore::new(),
        unit: 1,
        tripped: AtomicBool::new(false),
    });
    let stores = Stores {
        templates: Arc::new(InMemoryTemplateRepository::with_templates(vec![faq_template(vec![
            Unit::new("U1", "a1"),
            Unit::new("U2", "a2"),
            Unit::new("U3", "a3"),
        ])])),
        runs: runs.clone(),
    };
    let orchestrator = Orchestrator::new(
        stores,
        echo_target(),
        passing_judge(),
        Arc::new(InMemoryFileResolver::new()),
        &test_config(),
    );

    let summary = orchestrator.execute(RunRequest::new("run-16", "faq")).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.progress.to_string(), "3/3");

    let results = runs.list_results("run-16").await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[1].query, "U2");
    assert_eq!(results[1].status, ResultStatus::Errored);
    assert!(results[1].error.as_deref().unwrap().contains("unit task failed"));

    let run = runs.get_run("run-16").await.unwrap().unwrap();
    assert_eq!(run.progress.completed, 3);
    assert_eq!(run.status, RunStatus::Completed);
}
