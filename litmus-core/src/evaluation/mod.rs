//! Evaluation strategies and their dispatcher
//!
//! Every strategy implements [`EvaluationStrategy`]. The dispatcher runs the
//! enabled ones concurrently and isolates failures: a strategy that errors
//! yields an [`EvaluationResult`] with `error` set while the others still
//! score. Strategies that decide pass/fail do so through
//! [`EvaluationStrategy::verdict`], so callers never inspect strategy names.

pub mod judge;
pub mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EvaluationError;
use crate::llm::{CompletionPolicy, LLMProvider};
use crate::model::{EvaluationResult, EvaluationType, ResultStatus, Transcript};

pub use judge::{JudgeStrategy, JudgeVerdict, PASS_THRESHOLD};
pub use metrics::{ReferenceSuite, RelevancySuite};

/// Mission-specific evaluation context
#[derive(Debug, Clone)]
pub struct MissionContext {
    pub description: String,
    pub transcript: Transcript,
}

/// Everything a strategy may look at for one unit
#[derive(Debug, Clone, Default)]
pub struct EvaluationInput {
    /// The question asked (mission description for missions)
    pub query: String,

    /// Answer under evaluation (rendered transcript for missions)
    pub actual: String,

    /// Expected answer
    pub golden: String,

    /// Template instructions for the judge
    pub judge_prompt: Option<String>,

    /// Retrieval context, from the unit's `source`
    pub context: Option<String>,

    /// Set when evaluating a whole mission
    pub mission: Option<MissionContext>,

    /// Metric selection for suites; empty means all
    pub metrics: Vec<String>,
}

/// A scoring strategy
#[async_trait]
pub trait EvaluationStrategy: Send + Sync {
    /// Name recorded in [`EvaluationResult::strategy`]
    fn name(&self) -> &'static str;

    async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluationResult, EvaluationError>;

    /// Pass/fail decision this strategy contributes, if any
    fn verdict(&self, _result: &EvaluationResult) -> Option<ResultStatus> {
        None
    }
}

/// Results of one dispatch
#[derive(Debug, Clone, Default)]
pub struct Evaluated {
    pub results: Vec<EvaluationResult>,

    /// Combined verdict: `Failed` if any strategy failed the unit, `Passed`
    /// if at least one passed it, `None` if none decided
    pub verdict: Option<ResultStatus>,
}

/// Runs enabled strategies for a unit
#[derive(Clone)]
pub struct EvaluationDispatcher {
    strategies: BTreeMap<EvaluationType, Arc<dyn EvaluationStrategy>>,
}

impl EvaluationDispatcher {
    /// Dispatcher without strategies
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Dispatcher with the built-in strategies sharing one provider
    pub fn new(provider: Arc<dyn LLMProvider>, policy: CompletionPolicy, pass_threshold: f64) -> Self {
        Self::empty()
            .with_strategy(
                EvaluationType::CustomJudge,
                Arc::new(JudgeStrategy::new(provider.clone(), policy.clone()).with_threshold(pass_threshold)),
            )
            .with_strategy(
                EvaluationType::ReferenceSuite,
                Arc::new(ReferenceSuite::new(provider.clone(), policy.clone())),
            )
            .with_strategy(
                EvaluationType::RelevancySuite,
                Arc::new(RelevancySuite::new(provider, policy)),
            )
    }

    /// Register or replace the strategy for a type
    pub fn with_strategy(mut self, kind: EvaluationType, strategy: Arc<dyn EvaluationStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// Evaluate `input` with every enabled strategy, concurrently.
    ///
    /// Results come back in the order of `enabled` (duplicates removed).
    /// Types without a registered strategy produce an errored result.
    pub async fn dispatch(&self, enabled: &[EvaluationType], input: &EvaluationInput) -> Evaluated {
        let mut kinds: Vec<EvaluationType> = Vec::with_capacity(enabled.len());
        for kind in enabled {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }

        let runs = kinds.iter().map(|kind| async move {
            let Some(strategy) = self.strategies.get(kind) else {
                return (
                    EvaluationResult::failed(kind.as_str(), "no strategy registered"),
                    None,
                );
            };

            match strategy.evaluate(input).await {
                Ok(result) => {
                    let verdict = strategy.verdict(&result);
                    (result, verdict)
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "Evaluation failed");
                    (EvaluationResult::failed(strategy.name(), e.to_string()), None)
                }
            }
        });

        let outcomes = futures::future::join_all(runs).await;

        let verdicts: Vec<ResultStatus> = outcomes.iter().filter_map(|(_, v)| *v).collect();
        let verdict = if verdicts.contains(&ResultStatus::Failed) {
            Some(ResultStatus::Failed)
        } else if verdicts.contains(&ResultStatus::Passed) {
            Some(ResultStatus::Passed)
        } else {
            None
        };

        Evaluated {
            results: outcomes.into_iter().map(|(result, _)| result).collect(),
            verdict,
        }
    }
}

/// Score from a model reply: numbers, numeric strings and booleans, clamped to [0, 1]
pub(crate) fn coerce_score(value: &serde_json::Value) -> Option<f64> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        serde_json::Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    raw.is_finite().then(|| raw.clamp(0.0, 1.0))
}
