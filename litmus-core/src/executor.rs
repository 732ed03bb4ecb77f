//! Request execution against the endpoint under test
//!
//! A payload is a JSON object `{url, method?, headers?, body?}`. Every
//! outbound request gets a fresh UUIDv4 in the tracing header so the
//! capturing proxy can correlate traffic with results.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{LitmusError, UnitError};
use crate::model::{ExchangeRecord, RequestPhase};
use crate::parsing::value_to_text;

const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];
const MAX_ERROR_BODY: usize = 2048;

/// A fully expanded request, ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    /// Parse an expanded payload.
    ///
    /// # Errors
    ///
    /// [`UnitError::InvalidPayload`] when the payload is not an object, lacks
    /// a string `url`, names an unsupported method or has non-object headers.
    pub fn from_payload(payload: &Value) -> Result<Self, UnitError> {
        let object = payload
            .as_object()
            .ok_or_else(|| UnitError::InvalidPayload("payload must be a JSON object".into()))?;

        let url = object
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| UnitError::InvalidPayload("payload needs a non-empty string 'url'".into()))?
            .to_string();

        let method = match object.get("method") {
            None | Some(Value::Null) => "POST".to_string(),
            Some(Value::String(m)) => {
                let upper = m.trim().to_uppercase();
                if !METHODS.contains(&upper.as_str()) {
                    return Err(UnitError::InvalidPayload(format!("unsupported method '{}'", m)));
                }
                upper
            }
            Some(other) => {
                return Err(UnitError::InvalidPayload(format!(
                    "method must be a string, got {}",
                    other
                )));
            }
        };

        let headers = match object.get("headers") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_text(v)))
                .collect(),
            Some(_) => {
                return Err(UnitError::InvalidPayload("headers must be a JSON object".into()));
            }
        };

        let body = object.get("body").filter(|b| !b.is_null()).cloned();

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }
}

/// What the target sent back
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// JSON when the body parsed, the raw text otherwise, `Null` when empty
    pub body: Value,
}

impl TargetResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to the endpoint under test
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Send one request. Non-2xx responses are `Ok`; only transport
    /// failures are errors.
    async fn send(&self, request: &OutboundRequest) -> Result<TargetResponse, UnitError>;
}

/// `reqwest` based client
pub struct HttpTargetClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTargetClient {
    pub fn new(timeout: Duration) -> Result<Self, LitmusError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            LitmusError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self { client, timeout })
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    async fn send(&self, request: &OutboundRequest) -> Result<TargetResponse, UnitError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| UnitError::InvalidPayload(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Some(Value::String(text)) => builder.body(text.clone()),
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UnitError::Timeout(self.timeout)
            } else {
                UnitError::Transport {
                    url: request.url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = response.text().await.map_err(|e| UnitError::Transport {
            url: request.url.clone(),
            message: format!("failed to read response body: {}", e),
        })?;

        Ok(TargetResponse {
            status,
            headers,
            body: parse_body(text),
        })
    }
}

type Responder = dyn Fn(&OutboundRequest) -> Result<TargetResponse, UnitError> + Send + Sync;

/// In-process target answering from a closure; records every request
pub struct ScriptedTarget {
    responder: Box<Responder>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTarget {
    pub fn new(
        responder: impl Fn(&OutboundRequest) -> Result<TargetResponse, UnitError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TargetClient for ScriptedTarget {
    async fn send(&self, request: &OutboundRequest) -> Result<TargetResponse, UnitError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        (self.responder)(request)
    }
}

/// One sent request: its record and, for failures, the unit error
#[derive(Debug, Clone)]
pub struct Exchange {
    pub record: ExchangeRecord,
    pub error: Option<UnitError>,
}

impl Exchange {
    pub fn tracing_id(&self) -> &str {
        &self.record.tracing_id
    }

    /// Response body of a successful exchange
    pub fn body(&self) -> Option<&Value> {
        match self.error {
            None => self.record.response_body.as_ref(),
            Some(_) => None,
        }
    }
}

/// Executes pre/main/post requests with tracing ids and timeouts
#[derive(Clone)]
pub struct RequestExecutor {
    client: Arc<dyn TargetClient>,
    tracing_header: String,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(client: Arc<dyn TargetClient>, tracing_header: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            tracing_header: tracing_header.into(),
            timeout,
        }
    }

    pub fn from_config(client: Arc<dyn TargetClient>, engine: &EngineConfig) -> Self {
        Self::new(client, engine.tracing_header.clone(), engine.request_timeout)
    }

    /// Send an expanded payload.
    ///
    /// # Errors
    ///
    /// Only an unusable payload is an `Err`, since nothing was sent. Transport
    /// failures, timeouts and non-2xx responses come back as an [`Exchange`]
    /// with `error` set.
    pub async fn execute(&self, phase: RequestPhase, payload: &Value) -> Result<Exchange, UnitError> {
        let mut request = OutboundRequest::from_payload(payload)?;
        let tracing_id = Uuid::new_v4().to_string();
        request
            .headers
            .retain(|name, _| !name.eq_ignore_ascii_case(&self.tracing_header));
        request
            .headers
            .insert(self.tracing_header.clone(), tracing_id.clone());

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.client.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(UnitError::Timeout(self.timeout)),
        };
        let latency_ms = clock.elapsed().as_millis() as u64;

        let mut record = ExchangeRecord {
            phase,
            tracing_id,
            method: request.method,
            url: request.url,
            request_headers: request.headers,
            request_body: request.body,
            status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            latency_ms,
            started_at,
            error: None,
        };

        let error = match outcome {
            Ok(response) => {
                let error = (!response.is_success()).then(|| UnitError::Status {
                    status: response.status,
                    body: truncate(&value_to_text(&response.body), MAX_ERROR_BODY),
                });
                record.status = Some(response.status);
                record.response_headers = response.headers;
                record.response_body = Some(response.body);
                error
            }
            Err(e) => Some(e),
        };
        record.error = error.as_ref().map(ToString::to_string);

        tracing::info!(
            tracing_id = %record.tracing_id,
            phase = ?record.phase,
            method = %record.method,
            url = %record.url,
            status = record.status,
            latency_ms = record.latency_ms,
            error = record.error.as_deref(),
            "Target request completed"
        );

        Ok(Exchange { record, error })
    }

    /// Run an optional pre/post hook. Failures are recorded, never raised.
    pub async fn execute_hook(&self, phase: RequestPhase, payload: Option<&Value>) -> Option<ExchangeRecord> {
        let payload = payload?;
        match self.execute(phase, payload).await {
            Ok(exchange) => {
                if let Some(e) = &exchange.error {
                    tracing::warn!(phase = ?phase, error = %e, "Hook request failed");
                }
                Some(exchange.record)
            }
            Err(e) => {
                tracing::warn!(phase = ?phase, error = %e, "Hook payload is invalid; skipped");
                None
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
