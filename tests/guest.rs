use httpmock::prelude::*;
use serde_json::json;

mod common;

use chat_stress::metrics::END_TO_END_DURATION;
use chat_stress::prelude::*;

const SESSION_PATH: &str = "/godgpt/guest/create-session";
const CHAT_PATH: &str = "/godgpt/guest/chat";

// Mock the session endpoint, returning `status`.
fn mock_session(server: &MockServer, status: u16) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST)
            .path(SESSION_PATH)
            .header("content-type", "application/json")
            .header("origin", "https://chat.example.com")
            .json_body(json!({ "guider": "" }));
        then.status(status).body("{}");
    })
}

// Mock the streaming chat endpoint.
fn mock_chat(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST)
            .path(CHAT_PATH)
            .header("accept", "text/event-stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body("data: {\"content\":\"hi\"}\n\ndata: [DONE]\n\n");
    })
}

#[tokio::test]
/// Every VU creates a session and then chats, all steps succeed.
async fn test_guest_flow() {
    let server = MockServer::start();
    let session = mock_session(&server, 200);
    let chat = mock_chat(&server);

    let configuration = common::build_configuration(
        &server,
        "guest-flow",
        vec!["--scenario", "spike", "--vus", "10", "--iterations", "1"],
    );
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert_eq!(session.hits(), 10);
    assert_eq!(chat.hits(), 10);

    assert_eq!(metrics.scenario, "spike");
    assert_eq!(metrics.flow, Some(FlowKind::Guest));
    assert_eq!(metrics.vus, 10);
    assert_eq!(metrics.iterations, 10);
    assert_eq!(metrics.rate("session_creation_success_rate"), Some(1.0));
    assert_eq!(metrics.rate("chat_response_success_rate"), Some(1.0));
    assert_eq!(metrics.trend(END_TO_END_DURATION).unwrap().count, 10);
    assert_eq!(metrics.trend("session_creation_duration").unwrap().count, 10);
    assert_eq!(metrics.trend("chat_response_duration").unwrap().count, 10);
    assert_eq!(metrics.trend("http_req_duration").unwrap().count, 20);

    // The default spike thresholds were evaluated.
    assert_eq!(metrics.thresholds.verdicts.len(), 3);
    assert!(metrics
        .thresholds
        .verdict("session_creation_success_rate", "rate>0.99")
        .unwrap()
        .passed);
    assert!(metrics
        .thresholds
        .verdict("chat_response_success_rate", "rate>0.99")
        .unwrap()
        .passed);

    common::cleanup("guest-flow");
}

#[tokio::test]
/// A failed session never leads to a chat request.
async fn test_failed_session_skips_chat() {
    let server = MockServer::start();
    let session = mock_session(&server, 500);
    let chat = mock_chat(&server);

    let configuration = common::build_configuration(
        &server,
        "failed-session",
        vec!["--vus", "2", "--iterations", "3"],
    );
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert_eq!(session.hits(), 6);
    assert_eq!(chat.hits(), 0);

    assert_eq!(metrics.iterations, 6);
    assert_eq!(metrics.rate("session_creation_success_rate"), Some(0.0));
    assert!(metrics.rate_aggregate("chat_response_success_rate").is_none());
    // Every iteration still records its end to end duration.
    assert_eq!(metrics.trend(END_TO_END_DURATION).unwrap().count, 6);

    // Threshold failures are reported, not raised.
    assert!(!metrics.thresholds.passed());
    let chat_verdict = metrics
        .thresholds
        .verdict("chat_response_success_rate", "rate>0.99")
        .unwrap();
    assert!(!chat_verdict.passed);
    assert_eq!(chat_verdict.observed_value, None);
    let session_verdict = metrics
        .thresholds
        .verdict("session_creation_success_rate", "rate>0.99")
        .unwrap();
    assert_eq!(session_verdict.observed_value, Some(0.0));

    common::cleanup("failed-session");
}

#[tokio::test]
/// Without an iteration cap VUs run until the duration expires.
async fn test_duration_bound() {
    let server = MockServer::start();
    let session = mock_session(&server, 200);
    mock_chat(&server);

    let configuration = common::build_configuration(
        &server,
        "duration-bound",
        vec!["--vus", "2", "--duration", "1"],
    );
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert!(metrics.iterations > 0);
    assert_eq!(session.hits(), metrics.iterations);
    assert_eq!(
        metrics.trend(END_TO_END_DURATION).unwrap().count,
        metrics.iterations
    );
    assert!(metrics.started.is_some());
    assert!(metrics.stopped.is_some());

    common::cleanup("duration-bound");
}

#[tokio::test]
/// VUs launch over the startup time.
async fn test_startup_time() {
    let server = MockServer::start();
    mock_session(&server, 200);
    mock_chat(&server);

    let configuration = common::build_configuration(
        &server,
        "startup-time",
        vec!["--vus", "3", "--startup-time", "1", "--iterations", "1"],
    );
    let started = std::time::Instant::now();
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert_eq!(metrics.vus, 3);
    assert_eq!(metrics.iterations, 3);
    // The third VU launches two intervals after the first.
    assert!(started.elapsed() >= std::time::Duration::from_millis(600));

    common::cleanup("startup-time");
}

#[tokio::test]
/// Custom thresholds and the json report.
async fn test_thresholds_and_report() {
    let server = MockServer::start();
    mock_session(&server, 200);
    mock_chat(&server);

    let report_file = common::fixture_dir("report")
        .join("report.json")
        .to_string_lossy()
        .to_string();
    let configuration = common::build_configuration(
        &server,
        "report",
        vec![
            "--iterations",
            "2",
            "--no-default-thresholds",
            "--threshold",
            "end_to_end_duration:max<60000",
            "--threshold",
            "session_creation_success_rate:rate<0.5",
            "--report-file",
            report_file.as_str(),
        ],
    );
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert_eq!(metrics.thresholds.verdicts.len(), 2);
    assert!(metrics
        .thresholds
        .verdict("end_to_end_duration", "max<60000")
        .unwrap()
        .passed);
    assert!(!metrics
        .thresholds
        .verdict("session_creation_success_rate", "rate<0.5")
        .unwrap()
        .passed);
    assert_eq!(metrics.thresholds.failed().len(), 1);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_file).unwrap()).unwrap();
    assert_eq!(report["scenario"], "spike");
    assert_eq!(report["flow"], "guest");
    assert_eq!(report["iterations"], 2);
    assert_eq!(report["thresholds_passed"], false);
    assert_eq!(report["thresholds"].as_array().unwrap().len(), 2);

    common::cleanup("report");
}
