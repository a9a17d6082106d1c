//! A single HTTP call within a workflow.

use http::{HeaderMap, Method};
use std::time::Duration;

use crate::client::{HttpClient, StepRequest};
use crate::metrics::{MetricObservation, MetricsSink, HTTP_REQ_DURATION};
use crate::util;

/// The definition of one HTTP call: method, fixed path, payload, headers and timeout.
///
/// Each execution records three metrics into the sink:
///  - `<name>_success_rate` (Rate), every execution.
///  - `<name>_duration` (Trend), whenever a response arrived.
///  - `http_req_duration` (Trend), whenever a response arrived.
#[derive(Clone, Debug)]
pub struct WorkflowStep {
    /// Names the step's metrics.
    pub name: String,
    pub method: Method,
    /// Appended to the base URL.
    pub path: String,
    /// Default JSON body.
    pub payload: Option<serde_json::Value>,
    pub headers: HeaderMap,
    /// Overrides the client timeout.
    pub timeout: Option<Duration>,
}

/// The result of executing a [`WorkflowStep`].
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    /// `0` when no response arrived.
    pub status: u16,
    pub body: String,
    pub latency_ms: f64,
    pub error: Option<String>,
}
impl StepOutcome {
    /// The step succeeds on exactly HTTP 200 with the complete body read.
    pub fn succeeded(&self) -> bool {
        is_success(self.status) && self.error.is_none()
    }
}

/// The success predicate shared by every step.
pub fn is_success(status: u16) -> bool {
    status == 200
}

impl WorkflowStep {
    pub fn new(name: &str, method: Method, path: &str) -> Self {
        WorkflowStep {
            name: name.to_string(),
            method,
            path: path.to_string(),
            payload: None,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    pub fn set_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn set_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `<name>_success_rate`
    pub fn success_metric(&self) -> String {
        format!("{}_success_rate", self.name)
    }

    /// `<name>_duration`
    pub fn duration_metric(&self) -> String {
        format!("{}_duration", self.name)
    }

    /// Execute with the step's own payload.
    pub async fn execute(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        sink: &dyn MetricsSink,
    ) -> StepOutcome {
        self.send(client, base_url, self.payload.clone(), sink).await
    }

    /// Execute with a payload built for this iteration.
    pub async fn execute_with(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        payload: serde_json::Value,
        sink: &dyn MetricsSink,
    ) -> StepOutcome {
        self.send(client, base_url, Some(payload), sink).await
    }

    async fn send(
        &self,
        client: &dyn HttpClient,
        base_url: &str,
        payload: Option<serde_json::Value>,
        sink: &dyn MetricsSink,
    ) -> StepOutcome {
        let url = util::join_url(base_url, &self.path);
        trace!("{}: {} {}", self.name, self.method, url);

        let response = client
            .send(StepRequest {
                method: self.method.clone(),
                url,
                body: payload,
                headers: self.headers.clone(),
                timeout: self.timeout,
            })
            .await;

        let outcome = StepOutcome {
            status: response.status,
            body: response.body,
            latency_ms: response.latency.as_secs_f64() * 1_000.0,
            error: response.error,
        };

        sink.record(MetricObservation::rate(
            &self.success_metric(),
            outcome.succeeded(),
        ));
        if outcome.status > 0 {
            sink.record(MetricObservation::trend(
                &self.duration_metric(),
                outcome.latency_ms,
            ));
            sink.record(MetricObservation::trend(
                HTTP_REQ_DURATION,
                outcome.latency_ms,
            ));
        }

        if !outcome.succeeded() {
            debug!(
                "{} failed: status {}{}",
                self.name,
                outcome.status,
                outcome
                    .error
                    .as_ref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }

        outcome
    }
}
