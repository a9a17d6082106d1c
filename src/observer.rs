//! Lifecycle callbacks for a running load test.
//!
//! An [`AttackObserver`] is notified once before any VU launches, after every completed
//! iteration of every VU, and once after all VUs exited and thresholds were evaluated. All
//! methods have no-op defaults, implement only what's needed.
//!
//! `on_iteration_complete` is called concurrently from every VU and must not block.

use crate::config::{ScenarioSpec, TestConfig};
use crate::metrics::{StressMetrics, END_TO_END_DURATION};
use crate::workflow::WorkflowResult;

pub trait AttackObserver: Send + Sync {
    /// Called once before the first VU launches.
    fn on_setup(&self, _scenario: &ScenarioSpec, _test_config: &TestConfig) {}

    /// Called by each VU after each iteration reached a terminal state.
    fn on_iteration_complete(&self, _vu_number: usize, _result: &WorkflowResult) {}

    /// Called once with the final metrics and threshold verdicts.
    fn on_teardown(&self, _metrics: &StressMetrics) {}
}

/// Logs a banner when the load test starts and a short summary when it ends.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

impl AttackObserver for LoggingObserver {
    fn on_setup(&self, scenario: &ScenarioSpec, test_config: &TestConfig) {
        info!("starting {} scenario ({} flow)", scenario.name, scenario.flow);
        info!("target: {}", test_config.base_url);
        info!(
            "vus: {}, duration: {}s, chat step: {}",
            scenario.vus,
            scenario.duration,
            if scenario.include_chat { "enabled" } else { "disabled" }
        );
        if scenario.iterations > 0 {
            info!("iterations per vu: {}", scenario.iterations);
        }
        for threshold in &scenario.thresholds {
            info!("threshold: {} {}", threshold.metric, threshold.expression);
        }
    }

    fn on_iteration_complete(&self, vu_number: usize, result: &WorkflowResult) {
        if !result.session_created {
            debug!("vu {}: session creation failed", vu_number);
        }
    }

    fn on_teardown(&self, metrics: &StressMetrics) {
        info!(
            "{} scenario finished: {} iterations from {} vus in {}s",
            metrics.scenario, metrics.iterations, metrics.vus, metrics.duration
        );
        for (name, rate) in metrics.metrics.keys().filter_map(|name| {
            metrics.rate(name).map(|rate| (name, rate))
        }) {
            info!("{}: {:.2}%", name, rate * 100.0);
        }
        if let Some(average) = metrics.trend(END_TO_END_DURATION).and_then(|t| t.avg()) {
            info!("{} avg: {:.2} ms", END_TO_END_DURATION, average);
        }
        if metrics.thresholds.passed() {
            info!("all thresholds passed");
        } else {
            warn!(
                "{} of {} thresholds failed",
                metrics.thresholds.failed().len(),
                metrics.thresholds.verdicts.len()
            );
        }
    }
}
