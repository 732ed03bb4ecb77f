//! Per-unit results, exchanges and mission transcripts

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Unit;
use crate::error::UnitError;

/// Final status of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Passed,
    Failed,
    Errored,
}

/// Which request of a unit an exchange belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Pre,
    Main,
    Post,
}

/// One outbound request and what came back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub phase: RequestPhase,

    /// Value sent in the tracing header
    pub tracing_id: String,

    pub method: String,
    pub url: String,

    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,

    /// JSON when the body parsed, otherwise the raw text as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,

    pub latency_ms: u64,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExchangeRecord {
    /// 2xx response with no transport error
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Unresolved `[FILE: name]` reference; the literal token was kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionWarning {
    pub name: String,
    pub reason: String,
}

/// One turn of a mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// 1-based turn number
    pub index: usize,

    /// Request text synthesized by the completion provider
    pub request: String,

    /// Answer extracted from the target response
    pub response: String,

    pub exchange: ExchangeRecord,
}

/// Ordered turns of one mission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub turns: Vec<ConversationTurn>,

    /// Whether the provider declared the mission done (vs. budget exhausted)
    #[serde(default)]
    pub completed: bool,
}

impl Transcript {
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render as `user: ...` / `assistant: ...` lines for prompts
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .flat_map(|turn| {
                [
                    format!("user: {}", turn.request),
                    format!("assistant: {}", turn.response),
                ]
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Output of one evaluation strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Strategy name (e.g. `custom_judge`)
    pub strategy: String,

    /// Named scores, usually within [0, 1]
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,

    #[serde(default)]
    pub rationale: String,

    /// Structured evaluator output (verdict, per-metric reasons)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Set when the strategy itself failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationResult {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            scores: BTreeMap::new(),
            rationale: String::new(),
            details: None,
            error: None,
        }
    }

    pub fn failed(strategy: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(strategy)
        }
    }

    pub fn with_score(mut self, name: impl Into<String>, score: f64) -> Self {
        self.scores.insert(name.into(), score);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Persisted outcome of one unit within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    /// `<run_id>:<unit_index>`
    #[serde(rename = "result_id")]
    pub id: String,

    pub run_id: String,

    /// Position of the unit in the template
    pub unit_index: usize,

    pub query: String,

    pub golden: String,

    /// Tracing id of the main request (latest turn for missions)
    pub tracing_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_request: Option<ExchangeRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ExchangeRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_request: Option<ExchangeRecord>,

    /// Answer text that was evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,

    #[serde(default)]
    pub evaluations: Vec<EvaluationResult>,

    #[serde(default)]
    pub warnings: Vec<ResolutionWarning>,

    pub status: ResultStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub completed_at: DateTime<Utc>,
}

impl TestCaseResult {
    /// Result id scoped to a run
    pub fn result_id(run_id: &str, unit_index: usize) -> String {
        format!("{}:{}", run_id, unit_index)
    }

    /// An `Errored` result for a unit whose pipeline produced nothing else
    pub fn errored(run_id: &str, unit_index: usize, unit: &Unit, error: UnitError) -> Self {
        Self {
            id: Self::result_id(run_id, unit_index),
            run_id: run_id.to_string(),
            unit_index,
            query: unit.query.clone(),
            golden: unit.response.clone(),
            tracing_id: String::new(),
            pre_request: None,
            request: None,
            post_request: None,
            actual: None,
            transcript: None,
            evaluations: Vec::new(),
            warnings: Vec::new(),
            status: ResultStatus::Errored,
            error: Some(error.to_string()),
            completed_at: Utc::now(),
        }
    }
}
