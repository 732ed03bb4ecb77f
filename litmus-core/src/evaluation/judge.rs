//! LLM judge comparing an answer (or a whole mission) with the golden response

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{coerce_score, EvaluationInput, EvaluationStrategy};
use crate::error::EvaluationError;
use crate::llm::{CompletionPolicy, LLMProvider};
use crate::model::{EvaluationResult, EvaluationType, ResultStatus};
use crate::parsing::{parse_json_object, strip_references};

/// Similarity at or above which a unit passes
pub const PASS_THRESHOLD: f64 = 0.5;

const VERDICT_FORMAT: &str = r#"Respond only with a JSON object of this form:
{
  "answered": true or false,
  "contradictory": true or false,
  "contradictory_explanation": "...",
  "equivalent": true or false,
  "equivalent_explanation": "...",
  "addlinfo": true or false,
  "addlinfo_explanation": "...",
  "missinginfo": true or false,
  "missinginfo_explanation": "...",
  "similarity": a number between 0 and 1,
  "similarity_explanation": "..."
}"#;

const MISSION_FORMAT: &str = r#"Respond only with a JSON object of this form:
{
  "overall_success": "Successful" or "Partially Successful" or "Failed",
  "positive_observations": "...",
  "areas_for_improvement": "...",
  "similarity": a number between 0 and 1 rating how well the conversation achieved the best-known response,
  "similarity_explanation": "..."
}"#;

const DEFAULT_INSTRUCTIONS: &str = "You compare a statement against a best-known response. \
Decide whether the statement answers the question, contradicts the best-known response, \
is equivalent to it, adds information or misses information.";

/// Structured judge output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contradictory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equivalent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addlinfo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missinginfo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_explanation: Option<String>,
    /// Mission assessments only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_success: Option<String>,
}

fn flag(map: &Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl JudgeVerdict {
    /// Build a verdict from the parsed reply.
    ///
    /// # Errors
    ///
    /// [`EvaluationError::Parse`] when `similarity` is missing or not numeric.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, EvaluationError> {
        let similarity = map
            .get("similarity")
            .and_then(coerce_score)
            .ok_or_else(|| EvaluationError::Parse("judge reply has no numeric 'similarity'".into()))?;

        Ok(Self {
            similarity,
            answered: flag(map, "answered"),
            contradictory: flag(map, "contradictory"),
            equivalent: flag(map, "equivalent"),
            addlinfo: flag(map, "addlinfo"),
            missinginfo: flag(map, "missinginfo"),
            similarity_explanation: text(map, "similarity_explanation"),
            overall_success: text(map, "overall_success"),
        })
    }

    /// Unit status for this verdict
    pub fn status(&self, threshold: f64) -> ResultStatus {
        status_for(self.similarity, threshold)
    }
}

/// `Passed` iff `similarity >= threshold`
pub fn status_for(similarity: f64, threshold: f64) -> ResultStatus {
    if similarity >= threshold {
        ResultStatus::Passed
    } else {
        ResultStatus::Failed
    }
}

fn today_line() -> String {
    let now = Utc::now();
    format!(
        "Today is {}. The current time is {} UTC.",
        now.format("%A, %B %-d %Y"),
        now.format("%-H:%M")
    )
}

/// Prompt comparing a single answer with the golden response
pub fn single_turn_prompt(input: &EvaluationInput) -> String {
    let instructions = input.judge_prompt.as_deref().unwrap_or(DEFAULT_INSTRUCTIONS);
    format!(
        "{today}\n\n{instructions}\n\n{format}\n\nHere is your task:\nQuestion: {query}\nStatement: {statement}\nBest-known response: {golden}\n\nComparison result:\n",
        today = today_line(),
        instructions = instructions,
        format = VERDICT_FORMAT,
        query = input.query,
        statement = strip_references(&input.actual),
        golden = input.golden,
    )
}

/// Prompt assessing a whole mission transcript
pub fn mission_prompt(input: &EvaluationInput, description: &str, conversation: &str) -> String {
    let instructions = input.judge_prompt.as_deref().unwrap_or_default();
    format!(
        "{instructions}\n\nYou are evaluating the success of a test mission. The statement is the mission description.\n\
Was the mission completed successfully? What went well? What could have been improved?\n\n\
{today}\n\nStatement (mission description): {description}\nBest-known response: {golden}\n\n\
Conversation history:\n{conversation}\n\n{format}\n\nComparison result:\n",
        instructions = instructions,
        today = today_line(),
        description = description,
        golden = strip_references(&input.golden),
        conversation = conversation,
        format = MISSION_FORMAT,
    )
}

/// `custom_judge` strategy
pub struct JudgeStrategy {
    provider: Arc<dyn LLMProvider>,
    policy: CompletionPolicy,
    threshold: f64,
}

impl JudgeStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>, policy: CompletionPolicy) -> Self {
        Self {
            provider,
            policy,
            threshold: PASS_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

#[async_trait]
impl EvaluationStrategy for JudgeStrategy {
    fn name(&self) -> &'static str {
        EvaluationType::CustomJudge.as_str()
    }

    async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluationResult, EvaluationError> {
        if input.golden.trim().is_empty() {
            return Err(EvaluationError::MissingInput("golden response".into()));
        }

        let prompt = match &input.mission {
            Some(mission) => mission_prompt(input, &mission.description, &mission.transcript.render()),
            None => {
                if input.actual.trim().is_empty() {
                    return Err(EvaluationError::MissingInput("actual response".into()));
                }
                single_turn_prompt(input)
            }
        };

        let reply = self.policy.complete(self.provider.as_ref(), &prompt).await?;
        let map = parse_json_object(&reply).map_err(|e| EvaluationError::Parse(e.to_string()))?;
        let verdict = JudgeVerdict::from_map(&map)?;

        let rationale = verdict
            .similarity_explanation
            .clone()
            .or_else(|| text(&map, "positive_observations"))
            .unwrap_or_default();

        Ok(EvaluationResult::new(self.name())
            .with_score("similarity", verdict.similarity)
            .with_rationale(rationale)
            .with_details(Value::Object(map)))
    }

    fn verdict(&self, result: &EvaluationResult) -> Option<ResultStatus> {
        result
            .scores
            .get("similarity")
            .map(|s| status_for(*s, self.threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::MissionContext;
    use crate::llm::ScriptedProvider;
    use crate::model::Transcript;
    use serde_json::json;

    fn input() -> EvaluationInput {
        EvaluationInput {
            query: "What is the capital of France?".into(),
            actual: "Paris [1]".into(),
            golden: "Paris".into(),
            ..Default::default()
        }
    }

    fn judge(reply: &str) -> (Arc<ScriptedProvider>, JudgeStrategy) {
        let provider = Arc::new(ScriptedProvider::new().then_reply(reply));
        let strategy = JudgeStrategy::new(provider.clone(), CompletionPolicy::immediate());
        (provider, strategy)
    }

    #[test]
    fn threshold_boundary() {
        assert_eq!(status_for(0.5, PASS_THRESHOLD), ResultStatus::Passed);
        assert_eq!(status_for(0.49, PASS_THRESHOLD), ResultStatus::Failed);
        assert_eq!(status_for(1.0, PASS_THRESHOLD), ResultStatus::Passed);
        assert_eq!(status_for(0.0, PASS_THRESHOLD), ResultStatus::Failed);
    }

    #[test]
    fn verdict_accepts_loose_types() {
        let map = json!({"similarity": "0.75", "answered": "yes", "equivalent": false})
            .as_object()
            .cloned()
            .unwrap();
        let verdict = JudgeVerdict::from_map(&map).unwrap();
        assert_eq!(verdict.similarity, 0.75);
        assert_eq!(verdict.answered, Some(true));
        assert_eq!(verdict.equivalent, Some(false));
        assert_eq!(verdict.contradictory, None);
    }

    #[test]
    fn verdict_requires_similarity() {
        let map = json!({"answered": true}).as_object().cloned().unwrap();
        assert!(matches!(JudgeVerdict::from_map(&map), Err(EvaluationError::Parse(_))));
    }

    #[tokio::test]
    async fn judge_scores_and_strips_references() {
        let (provider, strategy) = judge(
            r#"```json
{"answered": true, "similarity": 0.5, "similarity_explanation": "same city"}
```"#,
        );

        let result = strategy.evaluate(&input()).await.unwrap();
        assert_eq!(result.scores["similarity"], 0.5);
        assert_eq!(result.rationale, "same city");
        assert_eq!(strategy.verdict(&result), Some(ResultStatus::Passed));

        let prompt = &provider.prompts()[0];
        assert!(prompt.contains("Statement: Paris \n"));
        assert!(prompt.contains("Best-known response: Paris"));
    }

    #[tokio::test]
    async fn low_similarity_fails_unit() {
        let (_, strategy) = judge(r#"{"similarity": 0.49}"#);
        let result = strategy.evaluate(&input()).await.unwrap();
        assert_eq!(strategy.verdict(&result), Some(ResultStatus::Failed));
    }

    #[tokio::test]
    async fn custom_threshold_applies() {
        let (_, strategy) = judge(r#"{"similarity": 0.6}"#);
        let strategy = strategy.with_threshold(0.8);
        let result = strategy.evaluate(&input()).await.unwrap();
        assert_eq!(strategy.verdict(&result), Some(ResultStatus::Failed));
    }

    #[tokio::test]
    async fn missing_golden_is_an_input_error() {
        let (provider, strategy) = judge(r#"{"similarity": 1}"#);
        let mut input = input();
        input.golden = "  ".into();
        assert!(matches!(
            strategy.evaluate(&input).await,
            Err(EvaluationError::MissingInput(_))
        ));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_reply_is_a_parse_error() {
        let (_, strategy) = judge("I think they are similar.");
        assert!(matches!(
            strategy.evaluate(&input()).await,
            Err(EvaluationError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn mission_prompt_includes_transcript() {
        let (provider, strategy) = judge(
            r#"{"overall_success": "Successful", "positive_observations": "booked", "similarity": 0.9}"#,
        );
        let input = EvaluationInput {
            query: "Book a flight".into(),
            actual: String::new(),
            golden: "A confirmed booking".into(),
            mission: Some(MissionContext {
                description: "Book a flight".into(),
                transcript: Transcript::default(),
            }),
            ..Default::default()
        };

        let result = strategy.evaluate(&input).await.unwrap();
        assert_eq!(result.rationale, "booked");
        assert_eq!(result.details.unwrap()["overall_success"], "Successful");
        assert!(provider.prompts()[0].contains("Statement (mission description): Book a flight"));
    }
}
