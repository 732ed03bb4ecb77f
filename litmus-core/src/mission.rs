//! Mission loop: LLM-guided multi-turn conversations with the target
//!
//! Each mission unit walks an explicit state machine:
//!
//! ```text
//! Started -> AwaitingNextRequest -> Executing -> CheckingCompletion
//!                 ^                                  |
//!                 +------------ not done ------------+
//!                                                    | done or budget spent
//!                                                    v
//!                                               Evaluating -> Done
//! ```
//!
//! Turns are strictly sequential. A provider or target failure stops the loop
//! and is reported with the partial transcript; evaluation then does not run.

use std::sync::Arc;

use serde_json::Value;

use crate::error::UnitError;
use crate::evaluation::{Evaluated, EvaluationDispatcher, EvaluationInput, MissionContext};
use crate::executor::RequestExecutor;
use crate::files::FileResolver;
use crate::llm::{CompletionPolicy, LLMProvider};
use crate::model::{ConversationTurn, ExchangeRecord, RequestPhase, ResolutionWarning, Transcript};
use crate::parsing::{output_text, parse_json, value_to_text};
use crate::substitution::{expand, resolve_files, Bindings};

/// Mission loop states
#[derive(Debug, Clone, PartialEq)]
pub enum MissionState {
    Started,
    AwaitingNextRequest,
    Executing { request: String },
    CheckingCompletion,
    Evaluating,
    Done,
}

/// Where to go after a completion check
pub fn after_completion_check(done: bool, turns_taken: usize, budget: usize) -> MissionState {
    if done || turns_taken >= budget {
        MissionState::Evaluating
    } else {
        MissionState::AwaitingNextRequest
    }
}

/// Inputs for one mission unit
pub struct MissionSpec<'a> {
    /// Mission description (the unit's query)
    pub description: &'a str,
    /// Expected outcome (the unit's golden response)
    pub golden: &'a str,
    /// Payload template; `{query}` receives each synthesized request
    pub payload: &'a Value,
    pub bindings: &'a Bindings,
    pub output_field: Option<&'a str>,
    pub judge_prompt: Option<&'a str>,
    /// Turn budget
    pub duration: usize,
    pub evaluation_input: EvaluationInput,
    pub evaluation_types: &'a [crate::model::EvaluationType],
}

/// Result of a mission unit
#[derive(Debug, Clone, Default)]
pub struct MissionOutcome {
    pub transcript: Transcript,
    pub warnings: Vec<ResolutionWarning>,
    /// Present when the loop reached `Evaluating`
    pub evaluation: Option<Evaluated>,
    pub error: Option<UnitError>,
}

impl MissionOutcome {
    /// Exchange of the most recent turn
    pub fn last_exchange(&self) -> Option<&ExchangeRecord> {
        self.transcript.turns.last().map(|t| &t.exchange)
    }
}

/// Prompt asking for the next user request
pub fn next_request_prompt(description: &str, transcript: &Transcript) -> String {
    format!(
        "You are helping to complete a test mission.\n\
The mission description is: {description}\n\n\
Here is the conversation history:\n{history}\n\n\
What is the next request that should be sent?\n\
Respond with a JSON object in the following format:\n\
{{\n    \"request\": \"<YOUR-NEXT-INPUT>\"\n}}\n",
        description = description,
        history = transcript.render(),
    )
}

/// Prompt asking whether the mission is complete
pub fn completion_prompt(description: &str, transcript: &Transcript) -> String {
    format!(
        "Mission description: {description}\n\n\
Conversation history:\n{history}\n\n\
Based on the mission description and the conversation history, has the mission been successfully completed?\n\
Answer only with \"yes\" or \"no\".\n",
        description = description,
        history = transcript.render(),
    )
}

/// Extract the next request from a provider reply.
///
/// Accepts `{"request": "..."}` (also fenced or wrapped in prose) and falls
/// back to the plain reply text when it is not JSON.
pub fn parse_next_request(reply: &str, turn: usize) -> Result<String, UnitError> {
    let invalid = |reason: &str| UnitError::InvalidAction {
        turn,
        reason: reason.to_string(),
    };

    match parse_json(reply) {
        Ok(Value::Object(map)) => match map.get("request") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::Null) | None => Err(invalid("reply has no 'request' field")),
            Some(Value::String(_)) => Err(invalid("'request' is empty")),
            Some(other) => Ok(value_to_text(other)),
        },
        Ok(_) => Err(invalid("reply is not a JSON object")),
        Err(_) => {
            let text = reply.trim();
            if text.is_empty() {
                Err(invalid("empty reply"))
            } else {
                Ok(text.to_string())
            }
        }
    }
}

/// Interpret a yes/no completion reply; anything but a clear "yes" is "no"
pub fn parse_done(reply: &str) -> bool {
    let answer: String = reply
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    match answer.split_whitespace().next() {
        Some("yes") => true,
        Some("no") => false,
        _ => {
            tracing::warn!(reply = %reply, "Unexpected completion reply; treating as not done");
            false
        }
    }
}

/// Drives mission units
#[derive(Clone)]
pub struct MissionController {
    provider: Arc<dyn LLMProvider>,
    policy: CompletionPolicy,
    executor: RequestExecutor,
    resolver: Arc<dyn FileResolver>,
    dispatcher: EvaluationDispatcher,
}

impl MissionController {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        policy: CompletionPolicy,
        executor: RequestExecutor,
        resolver: Arc<dyn FileResolver>,
        dispatcher: EvaluationDispatcher,
    ) -> Self {
        Self {
            provider,
            policy,
            executor,
            resolver,
            dispatcher,
        }
    }

    /// Run one mission to completion
    pub async fn run(&self, spec: MissionSpec<'_>) -> MissionOutcome {
        let mut state = MissionState::Started;
        let mut outcome = MissionOutcome::default();

        while state != MissionState::Done {
            state = match self.step(state, &spec, &mut outcome).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(
                        mission = %spec.description,
                        turns = outcome.transcript.len(),
                        error = %e,
                        "Mission aborted"
                    );
                    outcome.error = Some(e);
                    MissionState::Done
                }
            };
        }

        outcome
    }

    /// One transition of the state machine
    pub async fn step(
        &self,
        state: MissionState,
        spec: &MissionSpec<'_>,
        outcome: &mut MissionOutcome,
    ) -> Result<MissionState, UnitError> {
        let turn = outcome.transcript.len() + 1;
        match state {
            MissionState::Started => Ok(MissionState::AwaitingNextRequest),

            MissionState::AwaitingNextRequest => {
                let prompt = next_request_prompt(spec.description, &outcome.transcript);
                let reply = self
                    .policy
                    .complete(self.provider.as_ref(), &prompt)
                    .await
                    .map_err(|e| UnitError::Provider {
                        turn,
                        message: e.to_string(),
                    })?;
                let request = parse_next_request(&reply, turn)?;
                Ok(MissionState::Executing { request })
            }

            MissionState::Executing { request } => {
                let expanded = expand(spec.payload, &spec.bindings.with_query(request.clone()));
                let (payload, warnings) = resolve_files(&expanded, self.resolver.as_ref()).await;
                for warning in warnings {
                    if !outcome.warnings.iter().any(|w| w.name == warning.name) {
                        outcome.warnings.push(warning);
                    }
                }

                let exchange = self.executor.execute(RequestPhase::Main, &payload).await?;
                let response = exchange
                    .body()
                    .and_then(|body| output_text(body, spec.output_field))
                    .unwrap_or_default();
                let error = exchange.error.clone();

                tracing::debug!(turn, tracing_id = %exchange.tracing_id(), "Mission turn executed");
                outcome.transcript.turns.push(ConversationTurn {
                    index: turn,
                    request,
                    response,
                    exchange: exchange.record,
                });

                match error {
                    Some(e) => Err(e),
                    None => Ok(MissionState::CheckingCompletion),
                }
            }

            MissionState::CheckingCompletion => {
                let taken = outcome.transcript.len();
                let prompt = completion_prompt(spec.description, &outcome.transcript);
                let reply = self
                    .policy
                    .complete(self.provider.as_ref(), &prompt)
                    .await
                    .map_err(|e| UnitError::Provider {
                        turn: taken,
                        message: e.to_string(),
                    })?;
                let done = parse_done(&reply);
                outcome.transcript.completed = done;
                Ok(after_completion_check(done, taken, spec.duration))
            }

            MissionState::Evaluating => {
                let mut input = spec.evaluation_input.clone();
                input.query = spec.description.to_string();
                input.golden = spec.golden.to_string();
                input.judge_prompt = spec.judge_prompt.map(str::to_string);
                input.actual = outcome.transcript.render();
                input.mission = Some(MissionContext {
                    description: spec.description.to_string(),
                    transcript: outcome.transcript.clone(),
                });

                outcome.evaluation = Some(self.dispatcher.dispatch(spec.evaluation_types, &input).await);
                Ok(MissionState::Done)
            }

            MissionState::Done => Ok(MissionState::Done),
        }
    }
}
