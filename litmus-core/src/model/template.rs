//! Templates and the units they contain

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TemplateError;

/// Kind of run a template drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateKind {
    /// Independent request/response test cases
    #[serde(rename = "single_turn", alias = "Test Run")]
    SingleTurn,
    /// LLM-guided multi-turn dialogues
    #[serde(rename = "mission", alias = "Test Mission")]
    Mission,
}

/// Scoring strategy a template can enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    /// LLM judge comparing actual vs. golden text
    CustomJudge,
    /// Reference-based metric suite (relevancy, similarity, context precision/recall, harmfulness)
    ReferenceSuite,
    /// Answer relevancy suite with pass threshold
    RelevancySuite,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationType::CustomJudge => "custom_judge",
            EvaluationType::ReferenceSuite => "reference_suite",
            EvaluationType::RelevancySuite => "relevancy_suite",
        }
    }
}

impl std::str::FromStr for EvaluationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "custom_judge" | "judge" | "custom" => Ok(EvaluationType::CustomJudge),
            "reference_suite" | "ragas" => Ok(EvaluationType::ReferenceSuite),
            "relevancy_suite" | "deepeval" => Ok(EvaluationType::RelevancySuite),
            other => Err(format!("unknown evaluation type: {}", other)),
        }
    }
}

fn default_evaluation_types() -> Vec<EvaluationType> {
    vec![EvaluationType::CustomJudge]
}

/// One test case (or mission) inside a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Query text; for missions, the mission description
    pub query: String,

    /// Golden/expected response
    #[serde(default)]
    pub response: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Excluded from execution when set
    #[serde(default)]
    pub block: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Unit {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn blocked(mut self) -> Self {
        self.block = true;
        self
    }
}

/// A test template, read-only to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,

    pub kind: TemplateKind,

    /// Units in execution order
    #[serde(default)]
    pub units: Vec<Unit>,

    /// Main request payload (`{url, method, headers, body}` with placeholders)
    pub request: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_request: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_request: Option<Value>,

    /// Instructions prepended to the judge prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_prompt: Option<String>,

    /// Path(s) of the query inside the request payload.
    ///
    /// Metadata kept for the template editor. The engine places the query
    /// through `{query}` placeholders and never reads this field; it is
    /// preserved when templates are loaded and stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_field: Option<String>,

    /// Path(s) of the answer inside the target response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_field: Option<String>,

    /// Turn budget, missions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_duration: Option<usize>,

    #[serde(default = "default_evaluation_types")]
    pub evaluation_types: Vec<EvaluationType>,

    /// Metric names for the reference suite; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
}

impl Template {
    /// Create a single-turn template with the given request payload
    pub fn single_turn(id: impl Into<String>, request: Value) -> Self {
        Self {
            id: id.into(),
            kind: TemplateKind::SingleTurn,
            units: Vec::new(),
            request,
            pre_request: None,
            post_request: None,
            judge_prompt: None,
            input_field: None,
            output_field: None,
            mission_duration: None,
            evaluation_types: default_evaluation_types(),
            metrics: Vec::new(),
        }
    }

    /// Create a mission template with the given turn budget
    pub fn mission(id: impl Into<String>, request: Value, mission_duration: usize) -> Self {
        Self {
            kind: TemplateKind::Mission,
            mission_duration: Some(mission_duration),
            ..Self::single_turn(id, request)
        }
    }

    pub fn with_units(mut self, units: Vec<Unit>) -> Self {
        self.units = units;
        self
    }

    pub fn with_output_field(mut self, field: impl Into<String>) -> Self {
        self.output_field = Some(field.into());
        self
    }

    pub fn with_evaluation_types(mut self, types: Vec<EvaluationType>) -> Self {
        self.evaluation_types = types;
        self
    }

    /// Units that will actually execute, with their template positions
    pub fn runnable_units(&self) -> impl Iterator<Item = (usize, &Unit)> {
        self.units.iter().enumerate().filter(|(_, unit)| !unit.block)
    }

    /// Check the template can drive a run.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] when the request payload is not an object or
    /// a mission lacks a positive turn budget.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let malformed = |reason: &str| TemplateError::Malformed {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if !self.request.is_object() {
            return Err(malformed("request payload must be a JSON object"));
        }
        if self.request.get("url").and_then(Value::as_str).is_none() {
            return Err(malformed("request payload must contain a string 'url'"));
        }
        for (name, hook) in [("pre_request", &self.pre_request), ("post_request", &self.post_request)] {
            if hook.as_ref().is_some_and(|v| !v.is_object()) {
                return Err(malformed(&format!("{} must be a JSON object", name)));
            }
        }
        if self.kind == TemplateKind::Mission && !self.mission_duration.is_some_and(|d| d > 0) {
            return Err(TemplateError::MissingMissionDuration(self.id.clone()));
        }
        Ok(())
    }
}
