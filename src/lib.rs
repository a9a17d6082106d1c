//! # chat-stress
//!
//! A load testing harness for HTTP chat services that first create a session and then
//! send a chat message within it.
//!
//! chat-stress runs a configurable number of virtual users (VUs) for a configurable
//! duration. Each VU repeatedly executes a [`ChatWorkflow`](./workflow/struct.ChatWorkflow.html)
//! iteration: a session creation request followed, if the session was created, by a chat
//! request carrying a message drawn at random from a test data set. Every step reports its
//! outcome and latency to a shared [`MetricsAggregator`](./metrics/struct.MetricsAggregator.html),
//! and when the load test completes declared thresholds are evaluated against the aggregated
//! metrics.
//!
//! Two scenario presets are built in:
//!  - `spike`: the guest flow, session then chat, 100 VUs for one minute by default.
//!  - `baseline`: the authenticated flow, session creation only, 1 VU for six seconds.
//!
//! ## Running a load test
//!
//! ```bash
//! $ chat-stress --scenario spike --env-config config/env.dev.json \
//!     --test-data config/test-data.json -u 50 -t 2m
//! ```
//!
//! The number of VUs and the duration can also be set with the `VUS_COUNT` and
//! `TEST_DURATION` environment variables, command line flags take precedence.
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use chat_stress::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StressError> {
//!     let metrics = StressAttack::initialize()?
//!         .set_observer(std::sync::Arc::new(LoggingObserver))
//!         .execute()
//!         .await?;
//!
//!     if !metrics.thresholds.passed() {
//!         eprintln!("thresholds failed");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod metrics;
pub mod observer;
pub mod prelude;
mod report;
pub mod step;
pub mod threshold;
mod user;
pub mod util;
pub mod workflow;

use chrono::prelude::*;
use gumdrop::Options;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, io, time};

use crate::client::{HttpClient, ReqwestClient};
use crate::config::{ScenarioSpec, StressConfiguration, TestConfig, TestDataSet};
use crate::metrics::{MetricsAggregator, StressMetrics};
use crate::observer::{AttackObserver, LoggingObserver};
use crate::workflow::ChatWorkflow;

lazy_static! {
    /// Set by the ctrl-c handler, checked by the running attack.
    static ref CANCELED: AtomicBool = AtomicBool::new(false);
}

/// An enumeration of all errors a [`StressAttack`](./struct.StressAttack.html) can return.
#[derive(Debug)]
pub enum StressError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`tokio::task::JoinError`](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Json(serde_json::Error),
    /// Failed to parse the base URL.
    InvalidHost {
        /// The invalid base URL that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// An environment config or test data file is missing or malformed.
    InvalidConfig {
        /// Path of the file that failed to load.
        path: String,
        /// An explanation of the error.
        detail: String,
    },
    /// A threshold expression could not be parsed.
    InvalidThreshold {
        /// The metric the threshold was declared on, if known.
        metric: String,
        /// The offending expression.
        expression: String,
        /// An explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl StressError {
    fn describe(&self) -> &str {
        match *self {
            StressError::Io(_) => "io::Error",
            StressError::Reqwest(_) => "reqwest::Error",
            StressError::TokioJoin(_) => "tokio::task::JoinError",
            StressError::Json(_) => "serde_json::Error",
            StressError::InvalidHost { .. } => "failed to parse base URL",
            StressError::InvalidOption { .. } => "invalid option or value specified",
            StressError::InvalidConfig { .. } => "failed to load configuration",
            StressError::InvalidThreshold { .. } => "invalid threshold expression",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StressError::Io(ref source) => {
                write!(f, "StressError: {} ({})", self.describe(), source)
            }
            StressError::Reqwest(ref source) => {
                write!(f, "StressError: {} ({})", self.describe(), source)
            }
            StressError::TokioJoin(ref source) => {
                write!(f, "StressError: {} ({})", self.describe(), source)
            }
            StressError::Json(ref source) => {
                write!(f, "StressError: {} ({})", self.describe(), source)
            }
            StressError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "StressError: {} ({}: {})",
                self.describe(),
                host,
                parse_error
            ),
            StressError::InvalidOption { ref detail, .. } => {
                write!(f, "StressError: {} ({})", self.describe(), detail)
            }
            StressError::InvalidConfig {
                ref path,
                ref detail,
            } => write!(f, "StressError: {} ({}: {})", self.describe(), path, detail),
            StressError::InvalidThreshold {
                ref metric,
                ref expression,
                ref detail,
            } => write!(
                f,
                "StressError: {} ({} {}: {})",
                self.describe(),
                metric,
                expression,
                detail
            ),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StressError::Io(ref source) => Some(source),
            StressError::Reqwest(ref source) => Some(source),
            StressError::TokioJoin(ref source) => Some(source),
            StressError::Json(ref source) => Some(source),
            StressError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StressError {
    fn from(err: reqwest::Error) -> StressError {
        StressError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StressError {
    fn from(err: io::Error) -> StressError {
        StressError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StressError {
    fn from(err: tokio::task::JoinError) -> StressError {
        StressError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for StressError {
    fn from(err: serde_json::Error) -> StressError {
        StressError::Json(err)
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A [`StressAttack`](./struct.StressAttack.html) moves through each of the following
/// phases during a complete load test.
pub enum AttackPhase {
    /// Configuration is loaded, no VUs are running yet.
    Idle,
    /// VUs are launching and beginning to generate load.
    Starting,
    /// All VUs have launched and are generating load.
    Running,
    /// VUs are finishing their current iteration and exiting.
    Stopping,
    /// Exiting the load test.
    Shutdown,
}

/// Commands the scheduler can send to a running VU.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum VuCommand {
    /// Finish the current iteration, then exit.
    Exit,
}

/// Internal run state for the load test.
struct StressAttackRunState {
    /// When the previous VU was launched.
    spawn_user_timer: std::time::Instant,
    /// How many milliseconds until the next VU should be launched.
    spawn_user_in_ms: usize,
    /// How many VUs have been launched.
    spawn_user_counter: usize,
    /// Time spent doing other things, subtracted from sleeps to avoid drift.
    drift_timer: tokio::time::Instant,
    /// The shared metrics destination, one handle cloned into each VU.
    aggregator: MetricsAggregator,
    /// Read-only workflow shared by all VUs.
    workflow: Arc<ChatWorkflow>,
    /// Optional client shared by all VUs, otherwise each VU builds its own.
    shared_client: Option<Arc<dyn HttpClient>>,
    /// Collection of all VU tasks so they can be joined later.
    users: Vec<tokio::task::JoinHandle<()>>,
    /// One sender per VU, used to request a graceful exit.
    user_channels: Vec<flume::Sender<VuCommand>>,
}

/// The VU scheduler: owns the configuration, launches VUs, stops them, and reports.
pub struct StressAttack {
    /// Configuration object holding options set when launching the load test.
    configuration: StressConfiguration,
    /// Optional injected HTTP client, shared by all VUs.
    client: Option<Arc<dyn HttpClient>>,
    /// Receives lifecycle callbacks.
    observer: Arc<dyn AttackObserver>,
    /// Which phase the load test is currently operating in.
    attack_phase: AttackPhase,
    /// When all VUs finished launching.
    started: Option<time::Instant>,
    /// Final metrics, populated when the load test stops.
    metrics: StressMetrics,
}
impl StressAttack {
    /// Load configuration from the command line and initialize a
    /// [`StressAttack`](./struct.StressAttack.html).
    pub fn initialize() -> Result<StressAttack, StressError> {
        Self::initialize_with_config(StressConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`StressAttack`](./struct.StressAttack.html) with an already loaded
    /// configuration.
    ///
    /// # Example
    /// ```rust
    /// use chat_stress::StressAttack;
    /// use chat_stress::config::StressConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = StressConfiguration::parse_args_default(&["--vus", "5"]).unwrap();
    /// let stress_attack = StressAttack::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(
        configuration: StressConfiguration,
    ) -> Result<StressAttack, StressError> {
        Ok(StressAttack {
            configuration,
            client: None,
            observer: Arc::new(LoggingObserver),
            attack_phase: AttackPhase::Idle,
            started: None,
            metrics: StressMetrics::default(),
        })
    }

    /// Share a single [`HttpClient`](./client/trait.HttpClient.html) between all VUs instead
    /// of building one [`ReqwestClient`](./client/struct.ReqwestClient.html) per VU.
    pub fn set_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replace the default [`LoggingObserver`](./observer/struct.LoggingObserver.html).
    pub fn set_observer(mut self, observer: Arc<dyn AttackObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The configuration this load test was initialized with.
    pub fn configuration(&self) -> &StressConfiguration {
        &self.configuration
    }

    // Change from one attack_phase to another.
    fn set_attack_phase(&mut self, run_state: &mut StressAttackRunState, phase: AttackPhase) {
        if self.attack_phase == phase {
            return;
        }

        // The drift timer starts at 0 any time the phase is changed.
        run_state.drift_timer = tokio::time::Instant::now();

        info!("entering StressAttack phase: {:?}", &phase);
        self.attack_phase = phase;
    }

    /// Execute the load test, returning the final metrics including threshold verdicts.
    ///
    /// All configuration errors surface here, before any VU is launched. Threshold failures
    /// are reported in the returned metrics and are never an error.
    pub async fn execute(mut self) -> Result<StressMetrics, StressError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        self.configuration.configure()?;
        self.configuration.validate()?;
        let scenario = self.configuration.scenario_spec()?;

        let mut test_config = TestConfig::load(&self.configuration.env_config)?;
        if !self.configuration.auth_token.is_empty() {
            test_config.auth_token = Some(self.configuration.auth_token.clone());
        }
        test_config.validate(scenario.flow)?;

        // Messages are only needed when the chat step runs.
        let test_data = if scenario.include_chat {
            Some(Arc::new(TestDataSet::load(&self.configuration.test_data)?))
        } else {
            None
        };

        let workflow = ChatWorkflow::new(scenario.flow, &test_config, test_data)?;
        info!("base URL configured: {}", test_config.base_url);

        self.start_attack(scenario, test_config, workflow).await
    }

    // Launch VUs, either all at once or spread over `startup_time`.
    async fn spawn_attack(
        &mut self,
        scenario: &ScenarioSpec,
        run_state: &mut StressAttackRunState,
    ) -> Result<(), StressError> {
        // Launch one VU every `spawn_interval_ms`, or all immediately without a ramp.
        let spawn_interval_ms = if scenario.startup_time > 0 {
            scenario.startup_time * 1_000 / scenario.vus
        } else {
            0
        };

        if run_state.spawn_user_in_ms == 0
            || util::ms_timer_expired(run_state.spawn_user_timer, run_state.spawn_user_in_ms)
        {
            while run_state.spawn_user_counter < scenario.vus {
                run_state.spawn_user_timer = std::time::Instant::now();
                run_state.spawn_user_in_ms = spawn_interval_ms;

                // Create a per-VU channel allowing the scheduler to stop the VU.
                let (parent_sender, thread_receiver): (
                    flume::Sender<VuCommand>,
                    flume::Receiver<VuCommand>,
                ) = flume::unbounded();
                run_state.user_channels.push(parent_sender);

                let client: Arc<dyn HttpClient> = match run_state.shared_client.as_ref() {
                    Some(client) => client.clone(),
                    None => Arc::new(ReqwestClient::new(self.configuration.request_timeout())?),
                };

                // VUs are numbered from 1 as they're human-visible in the logs.
                run_state.spawn_user_counter += 1;
                let user = tokio::spawn(user::vu_main(
                    run_state.spawn_user_counter,
                    run_state.workflow.clone(),
                    client,
                    run_state.aggregator.clone(),
                    self.observer.clone(),
                    scenario.iterations,
                    thread_receiver,
                ));
                run_state.users.push(user);
                self.metrics.vus += 1;

                // With a ramp configured, launch only one VU per interval.
                if spawn_interval_ms > 0 {
                    break;
                }
            }
        } else {
            let sleep_duration = tokio::time::Duration::from_millis(
                run_state.spawn_user_in_ms.min(100) as u64,
            );
            run_state.drift_timer =
                util::sleep_minus_drift(sleep_duration, run_state.drift_timer).await;
        }

        if run_state.spawn_user_counter >= scenario.vus {
            info!("launched {} vus...", self.metrics.vus);
            self.set_attack_phase(run_state, AttackPhase::Running);
            self.started = Some(time::Instant::now());
            self.metrics.started = Some(Local::now());
        }

        Ok(())
    }

    // Let the load test run until the duration expires or every VU finished its
    // iterations, then trigger a shut down.
    async fn monitor_attack(
        &mut self,
        scenario: &ScenarioSpec,
        run_state: &mut StressAttackRunState,
    ) -> Result<(), StressError> {
        let expired = match self.started {
            Some(started) => util::timer_expired(started, scenario.duration),
            None => false,
        };
        let all_exited = run_state.users.iter().all(|user| user.is_finished());

        if expired || all_exited {
            if all_exited {
                info!("all vus completed their iterations");
            }
            self.set_attack_phase(run_state, AttackPhase::Stopping);
            self.metrics.stopping = Some(Local::now());
        } else {
            run_state.drift_timer = util::sleep_minus_drift(
                time::Duration::from_millis(100),
                run_state.drift_timer,
            )
            .await;
        }

        Ok(())
    }

    // Tell every VU to exit after its in-flight iteration, then wait for all of them.
    async fn stop_running_users(&mut self, run_state: &mut StressAttackRunState) {
        let elapsed = self.started.map(|s| s.elapsed().as_secs()).unwrap_or(0);
        info!("stopping after {} seconds...", elapsed);

        for (index, send_to_user) in run_state.user_channels.iter().enumerate() {
            match send_to_user.send(VuCommand::Exit) {
                Ok(_) => {
                    debug!("telling vu {} to exit", index + 1);
                }
                Err(e) => {
                    // The VU already exited after its final iteration.
                    debug!("failed to tell vu {} to exit: {}", index + 1, e);
                }
            }
        }
        info!("waiting for vus to exit");

        let users = std::mem::take(&mut run_state.users);
        for result in futures::future::join_all(users).await {
            if let Err(e) = result {
                warn!("vu exited abnormally: {}", e);
            }
        }
        debug!("all vus exited");
    }

    // Finalize metrics, evaluate thresholds, and report.
    async fn stop_attack(
        &mut self,
        scenario: &ScenarioSpec,
        run_state: &mut StressAttackRunState,
    ) -> Result<(), StressError> {
        let mut metrics = run_state.aggregator.finalize();
        metrics.scenario = scenario.name.clone();
        metrics.flow = Some(scenario.flow);
        metrics.vus = self.metrics.vus;
        metrics.duration = self.started.map(|s| s.elapsed().as_secs()).unwrap_or(0) as usize;
        metrics.starting = self.metrics.starting;
        metrics.started = self.metrics.started;
        metrics.stopping = self.metrics.stopping;
        metrics.stopped = Some(Local::now());
        metrics.thresholds = threshold::evaluate(&scenario.thresholds, &metrics.metrics);
        self.metrics = metrics;

        if !self.configuration.no_print_metrics {
            println!("{}", self.metrics);
        }

        if !self.configuration.report_file.is_empty() {
            report::write_report_file(&self.configuration.report_file, &self.metrics).await?;
        }

        Ok(())
    }

    // The scheduler loop, entered in AttackPhase::Idle and exited in AttackPhase::Shutdown.
    async fn start_attack(
        mut self,
        scenario: ScenarioSpec,
        test_config: TestConfig,
        workflow: ChatWorkflow,
    ) -> Result<StressMetrics, StressError> {
        let mut run_state = StressAttackRunState {
            spawn_user_timer: std::time::Instant::now(),
            spawn_user_in_ms: 0,
            spawn_user_counter: 0,
            drift_timer: tokio::time::Instant::now(),
            aggregator: MetricsAggregator::new(),
            workflow: Arc::new(workflow),
            shared_client: self.client.clone(),
            users: Vec::new(),
            user_channels: Vec::new(),
        };

        // Catch ctrl-c to allow clean shutdown to display metrics.
        CANCELED.store(false, Ordering::SeqCst);
        util::setup_ctrlc_handler();

        loop {
            match self.attack_phase {
                AttackPhase::Idle => {
                    self.observer.on_setup(&scenario, &test_config);
                    self.metrics.starting = Some(Local::now());
                    self.set_attack_phase(&mut run_state, AttackPhase::Starting);
                }
                AttackPhase::Starting => {
                    self.spawn_attack(&scenario, &mut run_state).await?;
                }
                AttackPhase::Running => {
                    self.monitor_attack(&scenario, &mut run_state).await?;
                }
                AttackPhase::Stopping => {
                    self.stop_running_users(&mut run_state).await;
                    self.stop_attack(&scenario, &mut run_state).await?;
                    self.observer.on_teardown(&self.metrics);
                    self.set_attack_phase(&mut run_state, AttackPhase::Shutdown);
                }
                AttackPhase::Shutdown => break,
            }

            // Gracefully exit loop if ctrl-c is caught.
            if (self.attack_phase == AttackPhase::Starting
                || self.attack_phase == AttackPhase::Running)
                && CANCELED.load(Ordering::SeqCst)
            {
                self.set_attack_phase(&mut run_state, AttackPhase::Stopping);
                self.metrics.stopping = Some(Local::now());
            }
        }

        Ok(self.metrics)
    }
}
