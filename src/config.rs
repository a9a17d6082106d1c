//! Functions and structures related to configuring a chat-stress load test.
//!
//! Run parameters are defined by the [`StressConfiguration`] structure, parsed from the
//! command line. A value set on the command line wins over the matching environment
//! variable (`VUS_COUNT`, `TEST_DURATION`, `AUTH_TOKEN`), which in turn wins over the
//! defaults of the selected [`ScenarioPreset`].
//!
//! The target service is described by a [`TestConfig`] JSON document, and the messages sent
//! by the chat step by a [`TestDataSet`] JSON document. Both are loaded and validated before
//! any VU is launched.

use gumdrop::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strum_macros::EnumString;

use crate::threshold::Threshold;
use crate::util;
use crate::workflow::FlowKind;
use crate::StressError;

/// Default path of the environment config document.
pub const DEFAULT_ENV_CONFIG: &str = "config/env.dev.json";
/// Default path of the test data document.
pub const DEFAULT_TEST_DATA: &str = "config/test-data.json";

/// Runtime options available when launching a chat-stress load test.
///
/// chat-stress leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the help output
/// from this structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"chat-stress drives a session-then-chat HTTP workflow with concurrent virtual
users, aggregates custom metrics, and evaluates pass/fail thresholds.

The following runtime options are available:"#
)]
pub struct StressConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V", help = "Prints version information\n")]
    pub version: bool,

    /// Selects a scenario preset (spike, baseline)
    #[options(no_short, meta = "PRESET")]
    pub scenario: Option<ScenarioPreset>,
    /// Sets the environment config file (default: config/env.dev.json)
    #[options(no_short, meta = "PATH")]
    pub env_config: String,
    /// Sets the test data file (default: config/test-data.json)
    #[options(no_short, meta = "PATH")]
    pub test_data: String,
    /// Sets the bearer token for the authenticated flow
    #[options(no_short, meta = "TOKEN", help = "Sets the bearer token for the authenticated flow\n")]
    pub auth_token: String,

    /// Sets concurrent virtual users (env: VUS_COUNT)
    #[options(short = "u")]
    pub vus: Option<usize>,
    /// Stops load test after (30s, 1m, 1h30m, etc) (env: TEST_DURATION)
    #[options(short = "t", meta = "TIME")]
    pub duration: String,
    /// Stops each VU after this many iterations (default: unlimited)
    #[options(short = "i")]
    pub iterations: Option<usize>,
    /// Launches VUs evenly over (30s, 1m, etc) (default: all at once)
    #[options(short = "s", meta = "TIME")]
    pub startup_time: String,
    /// Sets per-request timeout in seconds (default: 60)
    #[options(no_short, meta = "VALUE", help = "Sets per-request timeout in seconds (default: 60)\n\nThresholds:")]
    pub timeout: Option<String>,

    /// Adds a threshold, as metric:expression (ie rate>0.99)
    #[options(no_short, meta = "METRIC:EXPR")]
    pub threshold: Vec<String>,
    /// Doesn't apply the scenario's default thresholds
    #[options(no_short)]
    pub no_default_thresholds: bool,
    /// Exits with code 99 when a threshold fails
    #[options(no_short, help = "Exits with code 99 when a threshold fails\n\nReporting:")]
    pub strict_thresholds: bool,

    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Writes a json-formatted summary report
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// The built-in scenarios.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, strum_macros::Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioPreset {
    /// Guest flow, session creation then chat, under heavy concurrency.
    Spike,
    /// Authenticated flow, session creation only, single VU.
    Baseline,
}
impl ScenarioPreset {
    /// Which flow this preset drives.
    pub fn flow(&self) -> FlowKind {
        match self {
            ScenarioPreset::Spike => FlowKind::Guest,
            ScenarioPreset::Baseline => FlowKind::Authenticated,
        }
    }

    /// Whether the chat step follows a successful session creation.
    pub fn includes_chat(&self) -> bool {
        matches!(self, ScenarioPreset::Spike)
    }

    /// VUs to launch when neither `--vus` nor `VUS_COUNT` is set.
    pub fn default_vus(&self) -> usize {
        match self {
            ScenarioPreset::Spike => 100,
            ScenarioPreset::Baseline => 1,
        }
    }

    /// Duration when neither `--duration` nor `TEST_DURATION` is set.
    pub fn default_duration(&self) -> &'static str {
        match self {
            ScenarioPreset::Spike => "1m",
            ScenarioPreset::Baseline => "6s",
        }
    }

    /// Thresholds applied unless `--no-default-thresholds` is set.
    pub fn default_thresholds(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            ScenarioPreset::Spike => vec![
                ("session_creation_success_rate", "rate>0.99"),
                ("chat_response_success_rate", "rate>0.99"),
                ("end_to_end_duration", "avg<300"),
            ],
            ScenarioPreset::Baseline => vec![
                ("http_req_duration", "p(95)<10000"),
                ("session_creation_success_rate", "rate>0.99"),
            ],
        }
    }

    /// Human readable title, used in banners.
    pub fn title(&self) -> &'static str {
        match self {
            ScenarioPreset::Spike => "Guest chat spike test",
            ScenarioPreset::Baseline => "User create-session baseline test",
        }
    }
}

/// A fully resolved and validated load test plan.
#[derive(Clone, Debug)]
pub struct ScenarioSpec {
    /// Preset name, for reports.
    pub name: String,
    /// Which flow every iteration runs.
    pub flow: FlowKind,
    /// Whether the chat step runs after a created session.
    pub include_chat: bool,
    /// Concurrent VUs, at least 1.
    pub vus: usize,
    /// Seconds to run once all VUs launched, at least 1.
    pub duration: usize,
    /// Iterations per VU, 0 for unbounded.
    pub iterations: usize,
    /// Seconds over which VUs are launched, 0 to launch all at once.
    pub startup_time: usize,
    /// Thresholds in declaration order.
    pub thresholds: Vec<Threshold>,
}

/// A value candidate for a configuration option, in precedence order.
pub(crate) struct StressValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Skip this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait StressConfigure<T> {
    /// Return the first unfiltered value.
    fn get_value(&self, values: Vec<StressValue<T>>) -> Option<T>;
}
impl<T: fmt::Display> StressConfigure<T> for StressConfiguration {
    fn get_value(&self, values: Vec<StressValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                } else {
                    if !value.message.is_empty() {
                        info!("{} = {}", value.message, v)
                    }
                    return Some(v);
                }
            }
        }
        None
    }
}

// Read an environment variable, treating an empty value as unset.
fn env_value(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

impl StressConfiguration {
    /// Resolve every option from the command line, the environment, and the scenario
    /// preset, then initialize the logger.
    pub(crate) fn configure(&mut self) -> Result<(), StressError> {
        // The logger comes first so the remaining choices are logged.
        self.initialize_logger();

        let scenario = self.scenario.unwrap_or(ScenarioPreset::Spike);
        info!("scenario = {}", scenario);
        self.scenario = Some(scenario);

        // Configure `vus`.
        let env_vus = match env_value("VUS_COUNT") {
            Some(value) => Some(usize::from_str(&value).map_err(|e| {
                StressError::InvalidOption {
                    option: "VUS_COUNT".to_string(),
                    value: value.clone(),
                    detail: format!("`VUS_COUNT` must be a whole number: {}", e),
                }
            })?),
            None => None,
        };
        self.vus = self.get_value(vec![
            // Use --vus if set.
            StressValue {
                value: self.vus,
                filter: self.vus.is_none(),
                message: "vus",
            },
            // Otherwise use VUS_COUNT if set.
            StressValue {
                value: env_vus,
                filter: env_vus.is_none(),
                message: "vus (VUS_COUNT)",
            },
            // Otherwise use the preset default.
            StressValue {
                value: Some(scenario.default_vus()),
                filter: false,
                message: "vus (default)",
            },
        ]);

        // Configure `duration`.
        let env_duration = env_value("TEST_DURATION");
        self.duration = self
            .get_value(vec![
                // Use --duration if set.
                StressValue {
                    value: Some(self.duration.to_string()),
                    filter: self.duration.is_empty(),
                    message: "duration",
                },
                // Otherwise use TEST_DURATION if set.
                StressValue {
                    value: env_duration.clone(),
                    filter: env_duration.is_none(),
                    message: "duration (TEST_DURATION)",
                },
                // Otherwise use the preset default.
                StressValue {
                    value: Some(scenario.default_duration().to_string()),
                    filter: false,
                    message: "duration (default)",
                },
            ])
            .unwrap_or_default();

        // Configure `auth_token`, never logging its value.
        let env_token = env_value("AUTH_TOKEN");
        self.auth_token = self
            .get_value(vec![
                StressValue {
                    value: Some(self.auth_token.to_string()),
                    filter: self.auth_token.is_empty(),
                    message: "",
                },
                StressValue {
                    value: env_token.clone(),
                    filter: env_token.is_none(),
                    message: "",
                },
            ])
            .unwrap_or_default();

        if self.env_config.is_empty() {
            self.env_config = DEFAULT_ENV_CONFIG.to_string();
        }
        if self.test_data.is_empty() {
            self.test_data = DEFAULT_TEST_DATA.to_string();
        }
        if self.startup_time.is_empty() {
            self.startup_time = "0".to_string();
        }

        Ok(())
    }

    /// Validate the resolved configuration, returning the first problem found.
    pub(crate) fn validate(&self) -> Result<(), StressError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(StressError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // Validate `vus`.
        if let Some(vus) = self.vus.as_ref() {
            if vus == &0 {
                return Err(StressError::InvalidOption {
                    option: "`configuration.vus`".to_string(),
                    value: vus.to_string(),
                    detail: "`configuration.vus` must be set to at least 1.".to_string(),
                });
            }
        }

        // Validate `duration`.
        if util::parse_timespan(&self.duration) == 0 {
            return Err(StressError::InvalidOption {
                option: "`configuration.duration`".to_string(),
                value: self.duration.to_string(),
                detail: "`configuration.duration` must be a time span of at least 1 second."
                    .to_string(),
            });
        }

        // Validate `startup_time`.
        if self.startup_time != "0" && util::parse_timespan(&self.startup_time) == 0 {
            return Err(StressError::InvalidOption {
                option: "`configuration.startup_time`".to_string(),
                value: self.startup_time.to_string(),
                detail: "`configuration.startup_time` must be a valid time span.".to_string(),
            });
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match f32::from_str(timeout) {
                Ok(t) if t > 0.0 => (),
                _ => {
                    return Err(StressError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be greater than 0.".to_string(),
                    });
                }
            }
        }

        // If set, iterations must be at least 1.
        if self.iterations == Some(0) {
            return Err(StressError::InvalidOption {
                option: "`configuration.iterations`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.iterations` must be set to at least 1.".to_string(),
            });
        }

        Ok(())
    }

    /// Build the [`ScenarioSpec`] from a configured and validated configuration, parsing
    /// every threshold expression.
    pub(crate) fn scenario_spec(&self) -> Result<ScenarioSpec, StressError> {
        let scenario = self.scenario.unwrap_or(ScenarioPreset::Spike);

        let mut thresholds = Vec::new();
        if !self.no_default_thresholds {
            for (metric, expression) in scenario.default_thresholds() {
                thresholds.push(Threshold::new(metric, expression)?);
            }
        }
        for declared in &self.threshold {
            thresholds.push(Threshold::from_str(declared)?);
        }

        Ok(ScenarioSpec {
            name: scenario.to_string(),
            flow: scenario.flow(),
            include_chat: scenario.includes_chat(),
            vus: self.vus.unwrap_or_else(|| scenario.default_vus()),
            duration: util::parse_timespan(&self.duration),
            iterations: self.iterations.unwrap_or(0),
            startup_time: util::parse_timespan(&self.startup_time),
            thresholds,
        })
    }

    /// The per-request timeout, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout
            .as_ref()
            .and_then(|t| f32::from_str(t).ok())
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f32)
    }

    /// Initialize the logger which writes to standard out and optionally to a log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!("failed to create log file {}: {}", log_to_file.display(), e),
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

/// The target service, loaded once per run from the environment config document.
///
/// ```json
/// {
///   "baseUrl": "https://api.example.com",
///   "origin": "https://chat.example.com",
///   "referer": "https://chat.example.com/",
///   "authToken": "optional bearer token"
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    /// Base URL all step paths are appended to.
    pub base_url: String,
    /// Sent as the `origin` header.
    #[serde(default)]
    pub origin: String,
    /// Sent as the `referer` header.
    #[serde(default)]
    pub referer: String,
    /// Bearer token, required by the authenticated flow.
    #[serde(default)]
    pub auth_token: Option<String>,
}
impl TestConfig {
    /// Load and parse an environment config document.
    pub fn load(path: &str) -> Result<TestConfig, StressError> {
        let contents = read_document(path)?;
        serde_json::from_str(&contents).map_err(|e| StressError::InvalidConfig {
            path: path.to_string(),
            detail: format!("malformed environment config: {}", e),
        })
    }

    /// Confirm this config can drive the given flow.
    pub fn validate(&self, flow: FlowKind) -> Result<(), StressError> {
        util::is_valid_host(&self.base_url)?;

        if flow == FlowKind::Authenticated && self.token().is_none() {
            return Err(StressError::InvalidOption {
                option: "--auth-token".to_string(),
                value: "".to_string(),
                detail: "The authenticated flow requires a bearer token via --auth-token, AUTH_TOKEN, or `authToken` in the environment config.".to_string(),
            });
        }

        Ok(())
    }

    /// The bearer token, ignoring an empty value.
    pub fn token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Deserialize)]
struct TestDataDocument {
    messages: Vec<TestMessage>,
}

#[derive(Deserialize)]
struct TestMessage {
    content: String,
}

/// The ordered, non-empty set of messages the chat step draws from.
#[derive(Clone, Debug, PartialEq)]
pub struct TestDataSet {
    messages: Vec<String>,
}
impl TestDataSet {
    /// Build a data set, rejecting an empty message list.
    pub fn new(messages: Vec<String>) -> Result<TestDataSet, StressError> {
        if messages.is_empty() {
            return Err(StressError::InvalidConfig {
                path: "".to_string(),
                detail: "test data must contain at least one message".to_string(),
            });
        }
        Ok(TestDataSet { messages })
    }

    /// Load and parse a test data document: `{"messages": [{"content": "..."}]}`.
    pub fn load(path: &str) -> Result<TestDataSet, StressError> {
        let contents = read_document(path)?;
        let document: TestDataDocument =
            serde_json::from_str(&contents).map_err(|e| StressError::InvalidConfig {
                path: path.to_string(),
                detail: format!("malformed test data: {}", e),
            })?;
        let messages = document.messages.into_iter().map(|m| m.content).collect();
        TestDataSet::new(messages).map_err(|_| StressError::InvalidConfig {
            path: path.to_string(),
            detail: "test data must contain at least one message".to_string(),
        })
    }

    /// Draw one message uniformly at random, with replacement.
    pub fn random_message(&self) -> &str {
        let index = rand::rng().random_range(0..self.messages.len());
        &self.messages[index]
    }

    /// All messages, in document order.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn read_document(path: &str) -> Result<String, StressError> {
    std::fs::read_to_string(path).map_err(|e| StressError::InvalidConfig {
        path: path.to_string(),
        detail: e.to_string(),
    })
}
