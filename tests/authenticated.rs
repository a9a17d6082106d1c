use httpmock::prelude::*;
use serial_test::serial;
use std::sync::{Arc, Mutex};

mod common;

use chat_stress::prelude::*;

const SESSION_PATH: &str = "/godgpt/create-session";

/// Collects the session id of every iteration.
#[derive(Default)]
struct SessionIds {
    ids: Mutex<Vec<Option<String>>>,
    teardown: Mutex<bool>,
}
impl AttackObserver for SessionIds {
    fn on_iteration_complete(&self, _vu_number: usize, result: &WorkflowResult) {
        self.ids.lock().unwrap().push(result.session_id.clone());
    }

    fn on_teardown(&self, _metrics: &StressMetrics) {
        *self.teardown.lock().unwrap() = true;
    }
}

fn mock_session<'a>(server: &'a MockServer, token: &str, body: &str) -> httpmock::Mock<'a> {
    let authorization = format!("Bearer {}", token);
    server.mock(|when, then| {
        when.method(POST)
            .path(SESSION_PATH)
            .header("authorization", authorization.as_str())
            .header("priority", "u=1, i");
        then.status(200)
            .header("content-type", "application/json")
            .body(body);
    })
}

// The baseline scenario doesn't read test data, point it at a file that doesn't exist.
fn baseline_options(custom: Vec<&str>) -> Vec<&str> {
    let mut options = vec!["--scenario", "baseline", "--test-data", "/nonexistent/test-data.json"];
    options.extend(custom);
    options
}

#[tokio::test]
#[serial]
/// The authenticated flow sends the bearer token and parses the session id.
async fn test_authenticated_session() {
    std::env::remove_var("AUTH_TOKEN");
    let server = MockServer::start();
    let session = mock_session(&server, "secret-token", r#"{"code":"20000","data":"abc-123"}"#);
    let chat = server.mock(|when, then| {
        when.path("/godgpt/guest/chat");
        then.status(200);
    });

    let configuration = common::build_configuration(
        &server,
        "authenticated",
        baseline_options(vec!["--auth-token", "secret-token", "--iterations", "2"]),
    );
    let observer = Arc::new(SessionIds::default());
    let metrics = common::run_load_test(
        StressAttack::initialize_with_config(configuration)
            .unwrap()
            .set_observer(observer.clone()),
    )
    .await;

    assert_eq!(session.hits(), 2);
    // The baseline never chats.
    assert_eq!(chat.hits(), 0);
    assert_eq!(
        *observer.ids.lock().unwrap(),
        vec![Some("abc-123".to_string()), Some("abc-123".to_string())]
    );
    assert!(*observer.teardown.lock().unwrap());

    assert_eq!(metrics.scenario, "baseline");
    assert_eq!(metrics.flow, Some(FlowKind::Authenticated));
    assert_eq!(metrics.rate("session_creation_success_rate"), Some(1.0));
    assert!(metrics.rate_aggregate("chat_response_success_rate").is_none());
    assert!(metrics.thresholds.passed());
    assert!(metrics
        .thresholds
        .verdict("http_req_duration", "p(95)<10000")
        .unwrap()
        .passed);

    common::cleanup("authenticated");
}

#[tokio::test]
#[serial]
/// A session response without the success code still counts on status alone.
async fn test_unexpected_session_body() {
    std::env::remove_var("AUTH_TOKEN");
    let server = MockServer::start();
    mock_session(&server, "secret-token", r#"{"code":"50001","message":"busy"}"#);

    let configuration = common::build_configuration(
        &server,
        "unexpected-body",
        baseline_options(vec!["--auth-token", "secret-token", "--iterations", "1"]),
    );
    let observer = Arc::new(SessionIds::default());
    let metrics = common::run_load_test(
        StressAttack::initialize_with_config(configuration)
            .unwrap()
            .set_observer(observer.clone()),
    )
    .await;

    assert_eq!(*observer.ids.lock().unwrap(), vec![None]);
    assert_eq!(metrics.rate("session_creation_success_rate"), Some(1.0));

    common::cleanup("unexpected-body");
}

#[tokio::test]
#[serial]
/// The token can come from AUTH_TOKEN.
async fn test_token_from_environment() {
    let server = MockServer::start();
    let session = mock_session(&server, "env-token", r#"{"code":"20000","data":"xyz"}"#);

    std::env::set_var("AUTH_TOKEN", "env-token");
    let configuration = common::build_configuration(
        &server,
        "env-token",
        baseline_options(vec!["--iterations", "1"]),
    );
    let metrics =
        common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;
    std::env::remove_var("AUTH_TOKEN");

    assert_eq!(session.hits(), 1);
    assert_eq!(metrics.rate("session_creation_success_rate"), Some(1.0));

    common::cleanup("env-token");
}

#[tokio::test]
#[serial]
/// The token can come from the environment config document.
async fn test_token_from_env_config() {
    std::env::remove_var("AUTH_TOKEN");
    let server = MockServer::start();
    let session = mock_session(&server, "document-token", r#"{"code":"20000","data":"1"}"#);

    let dir = common::fixture_dir("document-token");
    let env_config = common::write_env_config(&dir, &server.base_url(), Some("document-token"));
    let configuration = common::build_configuration(
        &server,
        "document-token",
        baseline_options(vec!["--env-config", env_config.as_str(), "--iterations", "1"]),
    );
    common::run_load_test(StressAttack::initialize_with_config(configuration).unwrap()).await;

    assert_eq!(session.hits(), 1);

    common::cleanup("document-token");
}

#[tokio::test]
#[serial]
/// Without a token the load test never starts.
async fn test_missing_token() {
    std::env::remove_var("AUTH_TOKEN");
    let server = MockServer::start();
    let session = mock_session(&server, "", "{}");

    let configuration =
        common::build_configuration(&server, "missing-token", baseline_options(vec![]));
    let result = StressAttack::initialize_with_config(configuration)
        .unwrap()
        .execute()
        .await;

    match result {
        Err(StressError::InvalidOption { option, .. }) => assert_eq!(option, "--auth-token"),
        other => panic!("expected a missing token error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(session.hits(), 0);

    common::cleanup("missing-token");
}
