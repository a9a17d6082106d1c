use gumdrop::Options;
use httpmock::MockServer;
use std::path::{Path, PathBuf};

use chat_stress::config::StressConfiguration;
use chat_stress::metrics::StressMetrics;
use chat_stress::StressAttack;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// Messages written to every test data fixture.
#[allow(dead_code)]
pub const MESSAGES: &[&str] = &["hello", "what can you do?", "tell me a story"];

/// A per-test directory for fixtures and artifacts.
pub fn fixture_dir(test_name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "chat-stress-{}-{}",
        test_name,
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("failed to create fixture directory");
    dir
}

/// Write an environment config document pointing at the mock server.
pub fn write_env_config(dir: &Path, base_url: &str, auth_token: Option<&str>) -> String {
    let mut document = serde_json::json!({
        "baseUrl": base_url,
        "origin": "https://chat.example.com",
        "referer": "https://chat.example.com/",
    });
    if let Some(token) = auth_token {
        document["authToken"] = serde_json::json!(token);
    }
    let path = dir.join("env.json");
    std::fs::write(&path, document.to_string()).expect("failed to write env config");
    path.to_string_lossy().to_string()
}

/// Write a test data document with the given messages.
pub fn write_test_data(dir: &Path, messages: &[&str]) -> String {
    let document = serde_json::json!({
        "messages": messages
            .iter()
            .map(|content| serde_json::json!({ "content": content }))
            .collect::<Vec<_>>(),
    });
    let path = dir.join("test-data.json");
    std::fs::write(&path, document.to_string()).expect("failed to write test data");
    path.to_string_lossy().to_string()
}

/// The following options are configured by default, if not set to a custom value:
///  --env-config <fixture pointing at the mock server>
///  --test-data <fixture with MESSAGES>
///  --vus 1
///  --duration 10
///  --no-print-metrics
pub fn build_configuration(
    server: &MockServer,
    test_name: &str,
    custom: Vec<&str>,
) -> StressConfiguration {
    let dir = fixture_dir(test_name);
    // Declare these here no matter what, so their lifetime is sufficient when needed.
    let env_config = write_env_config(&dir, &server.base_url(), None);
    let test_data = write_test_data(&dir, MESSAGES);

    // Merge in all custom options first.
    let mut configuration: Vec<&str> = vec![];
    configuration.extend_from_slice(&custom);

    if !configuration.contains(&"--env-config") {
        configuration.extend_from_slice(&["--env-config", &env_config]);
    }
    if !configuration.contains(&"--test-data") {
        configuration.extend_from_slice(&["--test-data", &test_data]);
    }
    if !configuration.contains(&"--vus") {
        configuration.extend_from_slice(&["--vus", "1"]);
    }
    if !configuration.contains(&"--duration") {
        configuration.extend_from_slice(&["--duration", "10"]);
    }
    if !configuration.contains(&"--no-print-metrics") {
        configuration.push("--no-print-metrics");
    }

    // Parse these options to generate a StressConfiguration.
    StressConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run the load test, returning the final metrics.
#[allow(dead_code)]
pub async fn run_load_test(stress_attack: StressAttack) -> StressMetrics {
    stress_attack
        .execute()
        .await
        .expect("load test failed to run")
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup(test_name: &str) {
    let dir = fixture_dir(test_name);
    if dir.exists() {
        std::fs::remove_dir_all(dir).expect("failed to remove fixture directory");
    }
}
