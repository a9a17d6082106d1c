//! The two-step chat workflow: create a session, then chat within it.
//!
//! Each iteration walks an explicit state machine:
//!
//! ```text
//! Start -> SessionCreating -+-> SessionCreated -+-> ChatSending -+-> Completed
//!                           |                   |                +-> ChatFailed
//!                           |                   +-> Completed (no chat step)
//!                           +-> SessionFailed
//! ```
//!
//! A failed session creation short-circuits the iteration: the chat step is never attempted.
//! Every terminal state records exactly one `end_to_end_duration` observation.

use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::EnumString;

use crate::client::HttpClient;
use crate::config::{TestConfig, TestDataSet};
use crate::metrics::{MetricObservation, MetricsSink, END_TO_END_DURATION};
use crate::step::WorkflowStep;
use crate::StressError;

/// Names the session step's metrics.
pub const SESSION_STEP: &str = "session_creation";
/// Names the chat step's metrics.
pub const CHAT_STEP: &str = "chat_response";
/// The `code` an authenticated session response carries on success.
pub const SESSION_SUCCESS_CODE: &str = "20000";

const GUEST_SESSION_PATH: &str = "/godgpt/guest/create-session";
const AUTHENTICATED_SESSION_PATH: &str = "/godgpt/create-session";
const GUEST_CHAT_PATH: &str = "/godgpt/guest/chat";
const AUTHENTICATED_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

// Headers of a desktop Chrome browser calling the service cross-origin.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("content-type", "application/json"),
    (
        "sec-ch-ua",
        "\"Not)A;Brand\";v=\"8\", \"Chromium\";v=\"138\", \"Google Chrome\";v=\"138\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "cross-site"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
    ),
];

/// Which variant of the service the workflow calls.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    /// Anonymous session and chat.
    Guest,
    /// Bearer-token session, whose response carries the session id.
    Authenticated,
}

/// Where an iteration is in the workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Start,
    SessionCreating,
    SessionCreated,
    ChatSending,
    Completed,
    ChatFailed,
    SessionFailed,
}
impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::ChatFailed | WorkflowState::SessionFailed
        )
    }
}

/// What one iteration did. Created per iteration, handed to the observer, then dropped.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub state: WorkflowState,
    pub session_created: bool,
    /// Only the authenticated flow parses a session id.
    pub session_id: Option<String>,
    pub chat_succeeded: bool,
    /// Latency of each executed step, by step name.
    pub step_latencies_ms: BTreeMap<String, f64>,
    pub end_to_end_ms: f64,
}
impl Default for WorkflowResult {
    fn default() -> Self {
        WorkflowResult {
            state: WorkflowState::Start,
            session_created: false,
            session_id: None,
            chat_succeeded: false,
            step_latencies_ms: BTreeMap::new(),
            end_to_end_ms: 0.0,
        }
    }
}

/// Extract the session id from an authenticated session response,
/// `{"code": "20000", "data": "<id>"}`. Any other shape yields `None`.
pub fn parse_session_id(body: &str) -> Option<String> {
    let document: Value = match serde_json::from_str(body) {
        Ok(document) => document,
        Err(e) => {
            debug!("session response is not json: {}", e);
            return None;
        }
    };
    if document.get("code").and_then(Value::as_str) != Some(SESSION_SUCCESS_CODE) {
        return None;
    }
    match document.get("data") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.to_string()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// The per-iteration workflow, shared read-only by all VUs.
#[derive(Clone, Debug)]
pub struct ChatWorkflow {
    flow: FlowKind,
    base_url: String,
    session_step: WorkflowStep,
    chat_step: Option<WorkflowStep>,
    test_data: Option<Arc<TestDataSet>>,
}
impl ChatWorkflow {
    /// Build the workflow for a flow. The chat step is included iff test data is provided.
    ///
    /// Fails if the config can't produce valid headers, or the authenticated flow has no
    /// token.
    pub fn new(
        flow: FlowKind,
        test_config: &TestConfig,
        test_data: Option<Arc<TestDataSet>>,
    ) -> Result<ChatWorkflow, StressError> {
        let headers = browser_headers(test_config)?;

        let session_step = match flow {
            FlowKind::Guest => WorkflowStep::new(SESSION_STEP, Method::POST, GUEST_SESSION_PATH)
                .set_headers(headers.clone()),
            FlowKind::Authenticated => {
                let token = test_config.token().ok_or_else(|| StressError::InvalidOption {
                    option: "--auth-token".to_string(),
                    value: "".to_string(),
                    detail: "The authenticated flow requires a bearer token.".to_string(),
                })?;
                let mut session_headers = headers.clone();
                session_headers.insert(
                    AUTHORIZATION,
                    header_value("authorization", &format!("Bearer {}", token))?,
                );
                session_headers.insert(
                    HeaderName::from_static("priority"),
                    HeaderValue::from_static("u=1, i"),
                );
                WorkflowStep::new(SESSION_STEP, Method::POST, AUTHENTICATED_SESSION_PATH)
                    .set_headers(session_headers)
                    .set_timeout(AUTHENTICATED_SESSION_TIMEOUT)
            }
        }
        .set_payload(json!({ "guider": "" }));

        let chat_step = test_data.as_ref().map(|_| {
            let mut chat_headers = headers.clone();
            chat_headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            WorkflowStep::new(CHAT_STEP, Method::POST, GUEST_CHAT_PATH).set_headers(chat_headers)
        });

        Ok(ChatWorkflow {
            flow,
            base_url: test_config.base_url.clone(),
            session_step,
            chat_step,
            test_data,
        })
    }

    pub fn flow(&self) -> FlowKind {
        self.flow
    }

    pub fn session_step(&self) -> &WorkflowStep {
        &self.session_step
    }

    pub fn chat_step(&self) -> Option<&WorkflowStep> {
        self.chat_step.as_ref()
    }

    /// Run one iteration to a terminal state.
    pub async fn run_iteration(
        &self,
        client: &dyn HttpClient,
        sink: &dyn MetricsSink,
    ) -> WorkflowResult {
        let started = Instant::now();
        let mut result = WorkflowResult::default();

        while !result.state.is_terminal() {
            result.state = match result.state {
                WorkflowState::Start => WorkflowState::SessionCreating,
                WorkflowState::SessionCreating => {
                    let outcome = self
                        .session_step
                        .execute(client, &self.base_url, sink)
                        .await;
                    result
                        .step_latencies_ms
                        .insert(self.session_step.name.clone(), outcome.latency_ms);

                    if outcome.succeeded() {
                        result.session_created = true;
                        if self.flow == FlowKind::Authenticated {
                            result.session_id = parse_session_id(&outcome.body);
                            match result.session_id.as_ref() {
                                Some(id) => debug!("created session {}", id),
                                None => warn!(
                                    "session created but no session id in response: {}",
                                    crate::util::truncate_string(&outcome.body, 120)
                                ),
                            }
                        }
                        WorkflowState::SessionCreated
                    } else {
                        WorkflowState::SessionFailed
                    }
                }
                WorkflowState::SessionCreated => {
                    if self.chat_step.is_some() {
                        WorkflowState::ChatSending
                    } else {
                        WorkflowState::Completed
                    }
                }
                WorkflowState::ChatSending => match (&self.chat_step, &self.test_data) {
                    (Some(chat_step), Some(test_data)) => {
                        let payload = json!({
                            "content": test_data.random_message(),
                            "region": "",
                        });
                        let outcome = chat_step
                            .execute_with(client, &self.base_url, payload, sink)
                            .await;
                        result
                            .step_latencies_ms
                            .insert(chat_step.name.clone(), outcome.latency_ms);

                        if outcome.succeeded() {
                            result.chat_succeeded = true;
                            WorkflowState::Completed
                        } else {
                            WorkflowState::ChatFailed
                        }
                    }
                    // Unreachable through SessionCreated, kept total for the state machine.
                    _ => WorkflowState::Completed,
                },
                terminal => terminal,
            };
        }

        result.end_to_end_ms = started.elapsed().as_secs_f64() * 1_000.0;
        sink.record(MetricObservation::trend(
            END_TO_END_DURATION,
            result.end_to_end_ms,
        ));

        result
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, StressError> {
    HeaderValue::from_str(value).map_err(|e| StressError::InvalidOption {
        option: name.to_string(),
        value: value.to_string(),
        detail: format!("invalid header value: {}", e),
    })
}

// Browser headers plus the configured origin and referer.
fn browser_headers(test_config: &TestConfig) -> Result<HeaderMap, StressError> {
    let mut headers = HeaderMap::new();
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if !test_config.origin.is_empty() {
        headers.insert("origin", header_value("origin", &test_config.origin)?);
    }
    if !test_config.referer.is_empty() {
        headers.insert("referer", header_value("referer", &test_config.referer)?);
    }
    Ok(headers)
}
