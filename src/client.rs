//! The HTTP client seam.
//!
//! Workflow steps never talk to [`reqwest`](https://docs.rs/reqwest/) directly, they hand a
//! [`StepRequest`] to an [`HttpClient`]. Transport failures are folded into the returned
//! [`StepResponse`] with a status of `0`, so a failed request is always a metric and never an
//! error.

use async_trait::async_trait;
use http::{HeaderMap, Method};
use reqwest::Client;
use std::time::{Duration, Instant};

use crate::StressError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A single outgoing request.
#[derive(Clone, Debug)]
pub struct StepRequest {
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    /// Overrides the client timeout for this request.
    pub timeout: Option<Duration>,
}

/// What came back, or a status of `0` and an error if the complete response didn't.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResponse {
    pub status: u16,
    pub body: String,
    pub latency: Duration,
    pub error: Option<String>,
}
impl StepResponse {
    /// A response representing a request that never completed.
    pub fn transport_failure(latency: Duration, error: impl ToString) -> Self {
        StepResponse {
            status: 0,
            body: String::new(),
            latency,
            error: Some(error.to_string()),
        }
    }
}

/// Sends requests on behalf of a VU.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the request and wait for the complete response body.
    async fn send(&self, request: StepRequest) -> StepResponse;
}

/// The production [`HttpClient`], one per VU so each keeps its own cookies.
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: Client,
}
impl ReqwestClient {
    /// Build a client with the given default timeout.
    pub fn new(timeout: Option<Duration>) -> Result<ReqwestClient, StressError> {
        let builder = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT));
        #[cfg(feature = "cookies")]
        let builder = builder.cookie_store(true);

        Ok(ReqwestClient {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: StepRequest) -> StepResponse {
        let started = Instant::now();

        let mut request_builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers);
        if let Some(body) = request.body.as_ref() {
            request_builder = request_builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            request_builder = request_builder.timeout(timeout);
        }

        match request_builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("{} {}: status_code {}", request.method, request.url, status);
                // Timing includes receiving the full body, streamed responses included.
                match response.text().await {
                    Ok(body) => StepResponse {
                        status,
                        body,
                        latency: started.elapsed(),
                        error: None,
                    },
                    // A body cut short by a timeout or reset is a failed request.
                    Err(e) => {
                        warn!("{}: failed to read response body: {}", request.url, e);
                        StepResponse::transport_failure(started.elapsed(), e)
                    }
                }
            }
            Err(e) => {
                warn!("{} {}: {}", request.method, request.url, e);
                StepResponse::transport_failure(started.elapsed(), e)
            }
        }
    }
}
