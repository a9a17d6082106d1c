//! Optional metrics collected and aggregated during load tests.
//!
//! Every [`WorkflowStep`](../step/struct.WorkflowStep.html) execution records
//! [`MetricObservation`]s into a [`MetricsSink`]. The production sink is the
//! [`MetricsAggregator`], a cheaply cloneable handle shared by all VUs.
//!
//! Two kinds of metric are supported:
//!  - `Rate`: boolean outcomes, reported as the fraction of `true` observations.
//!  - `Trend`: numeric samples in milliseconds, reported as count, average, minimum,
//!    maximum and percentiles.
//!
//! # Example
//! When viewed with [`std::fmt::Display`], [`StressMetrics`] are displayed in tables:
//! ```text
//!  === RATE METRICS ===
//!  ------------------------------------------------------------------------------
//!  Name                           |     Rate |       Passes |        Fails
//!  ------------------------------------------------------------------------------
//!  chat_response_success_rate     |  100.00% |          991 |            0
//!  session_creation_success_rate  |   99.10% |          991 |            9
//!
//!  === TREND METRICS ===
//!  ------------------------------------------------------------------------------
//!  Name                           |   # obs |  Avg (ms) |    Min |    Max |  p(95)
//!  ------------------------------------------------------------------------------
//!  chat_response_duration         |     991 |    201.37 |    160 |    480 |    300
//!  end_to_end_duration            |   1,000 |    290.14 |      3 |    590 |    400
//! ```

use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::fmt;

use crate::threshold::ThresholdReport;
use crate::util;
use crate::workflow::FlowKind;

/// Built-in trend recording the latency of every completed HTTP request.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Trend recording the wall-clock time of each workflow iteration.
pub const END_TO_END_DURATION: &str = "end_to_end_duration";

/// The two kinds of metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Rate,
    Trend,
}
impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetricKind::Rate => write!(f, "rate"),
            MetricKind::Trend => write!(f, "trend"),
        }
    }
}

/// The value carried by a [`MetricObservation`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    Bool(bool),
    Number(f64),
}

/// One recorded sample.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricObservation {
    pub name: String,
    pub kind: MetricKind,
    pub value: MetricValue,
}
impl MetricObservation {
    /// A boolean sample for a `Rate` metric.
    pub fn rate(name: &str, value: bool) -> Self {
        MetricObservation {
            name: name.to_string(),
            kind: MetricKind::Rate,
            value: MetricValue::Bool(value),
        }
    }

    /// A millisecond sample for a `Trend` metric.
    pub fn trend(name: &str, value: f64) -> Self {
        MetricObservation {
            name: name.to_string(),
            kind: MetricKind::Trend,
            value: MetricValue::Number(value),
        }
    }
}

/// Destination for metric observations, shared by all VUs.
pub trait MetricsSink: Send + Sync {
    fn record(&self, observation: MetricObservation);
}

/// Aggregated `Rate` metric.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RateAggregate {
    /// Observations that were `true`.
    pub passes: usize,
    /// Observations that were `false`.
    pub fails: usize,
}
impl RateAggregate {
    pub fn record(&mut self, value: bool) {
        if value {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.passes + self.fails
    }

    /// Fraction of `true` observations, `None` without observations.
    pub fn rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.passes as f64 / total as f64),
        }
    }
}

/// Aggregated `Trend` metric.
///
/// Count, total, minimum and maximum are kept as running values. Every sample is also
/// kept, so percentiles are exact: a threshold such as `p(95)<10000` is read from the
/// samples themselves and never from a rounded bucket.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrendAggregate {
    pub count: usize,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    /// Every recorded sample, in recording order.
    #[serde(skip)]
    pub samples: Vec<f64>,
}
impl Default for TrendAggregate {
    fn default() -> Self {
        TrendAggregate {
            count: 0,
            total: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: Vec::new(),
        }
    }
}
impl TrendAggregate {
    pub fn record(&mut self, value: f64) {
        // Negative or non-finite samples can't be durations.
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };

        self.count += 1;
        self.total += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.samples.push(value);
    }

    pub fn avg(&self) -> Option<f64> {
        match self.count {
            0 => None,
            count => Some(self.total / count as f64),
        }
    }

    pub fn min(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.min)
        }
    }

    pub fn max(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.max)
        }
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(0.5)
    }

    /// The sample value that `percent` (0.0 to 1.0) of samples are at or below.
    pub fn percentile(&self, percent: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(calculate_percentile(&sorted, percent))
    }
}

/// Nearest-rank percentile of already sorted samples.
pub(crate) fn calculate_percentile(sorted: &[f64], percent: f64) -> f64 {
    let target = ((sorted.len() as f64 * percent).round() as usize).clamp(1, sorted.len());
    trace!(
        "percentile: {}, sample {} of total {}",
        percent,
        target,
        sorted.len()
    );
    sorted[target - 1]
}

/// A metric aggregate, tagged with its kind.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricAggregate {
    Rate(RateAggregate),
    Trend(TrendAggregate),
}
impl MetricAggregate {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Rate => MetricAggregate::Rate(RateAggregate::default()),
            MetricKind::Trend => MetricAggregate::Trend(TrendAggregate::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricAggregate::Rate(_) => MetricKind::Rate,
            MetricAggregate::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        match self {
            MetricAggregate::Rate(rate) => rate.total(),
            MetricAggregate::Trend(trend) => trend.count,
        }
    }
}

/// Thread-safe aggregation of all metric observations.
///
/// Cloning returns another handle to the same aggregate.
#[derive(Clone, Debug, Default)]
pub struct MetricsAggregator {
    metrics: Arc<Mutex<BTreeMap<String, MetricAggregate>>>,
    iterations: Arc<AtomicUsize>,
}
impl MetricsAggregator {
    pub fn new() -> Self {
        MetricsAggregator::default()
    }

    // A panicking VU must not hide everyone else's metrics.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MetricAggregate>> {
        match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one observation. An observation whose kind differs from the kind first
    /// recorded under the same name is dropped.
    pub fn record(&self, observation: MetricObservation) {
        let mut metrics = self.lock();
        let aggregate = metrics
            .entry(observation.name.clone())
            .or_insert_with(|| MetricAggregate::new(observation.kind));

        match (aggregate, observation.value) {
            (MetricAggregate::Rate(rate), MetricValue::Bool(value))
                if observation.kind == MetricKind::Rate =>
            {
                rate.record(value)
            }
            (MetricAggregate::Trend(trend), MetricValue::Number(value))
                if observation.kind == MetricKind::Trend =>
            {
                trend.record(value)
            }
            (aggregate, _) => {
                warn!(
                    "ignoring {} observation for {} metric {}",
                    observation.kind,
                    aggregate.kind(),
                    observation.name
                );
            }
        }
    }

    /// Count one completed workflow iteration.
    pub fn complete_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::SeqCst)
    }

    /// A copy of a single aggregate, if anything was recorded under `name`.
    pub fn get(&self, name: &str) -> Option<MetricAggregate> {
        self.lock().get(name).cloned()
    }

    /// Snapshot all aggregates once every VU has stopped.
    pub fn finalize(&self) -> StressMetrics {
        StressMetrics {
            iterations: self.iterations(),
            metrics: self.lock().clone(),
            ..Default::default()
        }
    }
}
impl MetricsSink for MetricsAggregator {
    fn record(&self, observation: MetricObservation) {
        MetricsAggregator::record(self, observation)
    }
}

/// All metrics from a completed load test, returned by
/// [`StressAttack::execute`](../struct.StressAttack.html#method.execute).
#[derive(Clone, Debug, Default, Serialize)]
pub struct StressMetrics {
    /// Scenario preset name.
    pub scenario: String,
    pub flow: Option<FlowKind>,
    /// VUs launched.
    pub vus: usize,
    /// Seconds the load test ran after all VUs launched.
    pub duration: usize,
    /// Completed workflow iterations across all VUs.
    pub iterations: usize,
    pub starting: Option<chrono::DateTime<chrono::Local>>,
    pub started: Option<chrono::DateTime<chrono::Local>>,
    pub stopping: Option<chrono::DateTime<chrono::Local>>,
    pub stopped: Option<chrono::DateTime<chrono::Local>>,
    /// Aggregates by metric name.
    pub metrics: BTreeMap<String, MetricAggregate>,
    /// Threshold verdicts, evaluated after the load test stopped.
    pub thresholds: ThresholdReport,
}
impl StressMetrics {
    /// The rate of a `Rate` metric.
    pub fn rate(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name) {
            Some(MetricAggregate::Rate(rate)) => rate.rate(),
            _ => None,
        }
    }

    /// A `Rate` aggregate by name.
    pub fn rate_aggregate(&self, name: &str) -> Option<&RateAggregate> {
        match self.metrics.get(name) {
            Some(MetricAggregate::Rate(rate)) => Some(rate),
            _ => None,
        }
    }

    /// A `Trend` aggregate by name.
    pub fn trend(&self, name: &str) -> Option<&TrendAggregate> {
        match self.metrics.get(name) {
            Some(MetricAggregate::Trend(trend)) => Some(trend),
            _ => None,
        }
    }

    /// Iterations completed per second.
    pub fn iterations_per_second(&self) -> f64 {
        if self.duration == 0 {
            0.0
        } else {
            self.iterations as f64 / self.duration as f64
        }
    }

    pub(crate) fn fmt_overview(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === {} ===\n ------------------------------------------------------------------------------",
            if self.scenario.is_empty() {
                "SUMMARY"
            } else {
                self.scenario.as_str()
            }
        )?;
        if let Some(flow) = self.flow {
            writeln!(fmt, " {:<30} | {:>14}", "Flow", flow.to_string())?;
        }
        writeln!(fmt, " {:<30} | {:>14}", "VUs", format_number(self.vus))?;
        writeln!(fmt, " {:<30} | {:>14}", "Duration (s)", format_number(self.duration))?;
        writeln!(
            fmt,
            " {:<30} | {:>14}",
            "Iterations",
            format_number(self.iterations)
        )?;
        writeln!(
            fmt,
            " {:<30} | {:>14.2}",
            "Iterations/s",
            self.iterations_per_second()
        )
    }

    pub(crate) fn fmt_rates(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rates: Vec<(&String, &RateAggregate)> = self
            .metrics
            .iter()
            .filter_map(|(name, aggregate)| match aggregate {
                MetricAggregate::Rate(rate) => Some((name, rate)),
                _ => None,
            })
            .collect();
        // If there's nothing to display, exit immediately.
        if rates.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === RATE METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<30} | {:>8} | {:>12} | {:>12}",
            "Name", "Rate", "Passes", "Fails"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, rate) in rates {
            writeln!(
                fmt,
                " {:<30} | {:>7.2}% | {:>12} | {:>12}",
                util::truncate_string(name, 30),
                rate.rate().unwrap_or(0.0) * 100.0,
                format_number(rate.passes),
                format_number(rate.fails),
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_trends(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trends: Vec<(&String, &TrendAggregate)> = self
            .metrics
            .iter()
            .filter_map(|(name, aggregate)| match aggregate {
                MetricAggregate::Trend(trend) => Some((name, trend)),
                _ => None,
            })
            .collect();
        if trends.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === TREND METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<30} | {:>7} | {:>9} | {:>6} | {:>6} | {:>6}",
            "Name", "# obs", "Avg (ms)", "Min", "Max", "p(95)"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, trend) in &trends {
            writeln!(
                fmt,
                " {:<30} | {:>7} | {:>9.2} | {:>6} | {:>6} | {:>6}",
                util::truncate_string(name, 30),
                format_number(trend.count),
                trend.avg().unwrap_or(0.0),
                format_float(trend.min()),
                format_float(trend.max()),
                format_float(trend.percentile(0.95)),
            )?;
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------\n Slowest samples within specified percentile (in ms):\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<30} | {:>8} | {:>8} | {:>8} | {:>8}",
            "Name", "50%", "90%", "99%", "100%"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, trend) in &trends {
            writeln!(
                fmt,
                " {:<30} | {:>8} | {:>8} | {:>8} | {:>8}",
                util::truncate_string(name, 30),
                format_float(trend.percentile(0.5)),
                format_float(trend.percentile(0.9)),
                format_float(trend.percentile(0.99)),
                format_float(trend.max()),
            )?;
        }
        Ok(())
    }
}

/// Implement format trait to allow displaying metrics.
impl fmt::Display for StressMetrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        self.fmt_rates(fmt)?;
        self.fmt_trends(fmt)?;
        write!(fmt, "{}", self.thresholds)
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

// Whole milliseconds for table cells.
fn format_float(value: Option<f64>) -> String {
    match value {
        Some(v) => format_number(v.round() as usize),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nearest_rank() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(calculate_percentile(&sorted, 0.0), 10.0);
        assert_eq!(calculate_percentile(&sorted, 0.5), 20.0);
        assert_eq!(calculate_percentile(&sorted, 0.75), 30.0);
        assert_eq!(calculate_percentile(&sorted, 1.0), 40.0);
        assert_eq!(calculate_percentile(&[7.5], 0.99), 7.5);
    }

    #[test]
    fn rate_aggregate() {
        let mut rate = RateAggregate::default();
        assert_eq!(rate.rate(), None);
        for i in 0..200 {
            rate.record(i != 0);
        }
        assert_eq!(rate.total(), 200);
        assert_eq!(rate.passes, 199);
        assert_eq!(rate.fails, 1);
        assert!((rate.rate().unwrap() - 0.995).abs() < f64::EPSILON);
    }

    #[test]
    fn trend_aggregate() {
        let mut trend = TrendAggregate::default();
        assert_eq!(trend.avg(), None);
        assert_eq!(trend.percentile(0.95), None);

        for value in 1..=100 {
            trend.record(value as f64);
        }
        assert_eq!(trend.count, 100);
        assert!((trend.avg().unwrap() - 50.5).abs() < f64::EPSILON);
        assert_eq!(trend.min(), Some(1.0));
        assert_eq!(trend.max(), Some(100.0));
        assert_eq!(trend.median(), Some(50.0));
        assert_eq!(trend.percentile(0.95), Some(95.0));
        assert_eq!(trend.percentile(1.0), Some(100.0));

        // Samples are exact, whatever their order or size.
        let mut trend = TrendAggregate::default();
        trend.record(1_400.0);
        trend.record(1_234.0);
        assert_eq!(trend.percentile(0.95), Some(1_400.0));
        assert_eq!(trend.percentile(0.5), Some(1_234.0));
        assert_eq!(trend.max(), Some(1_400.0));
    }

    #[test]
    fn slow_tail_percentile() {
        // 96 samples just under ten seconds and a slow tail above it.
        let mut trend = TrendAggregate::default();
        for _ in 0..96 {
            trend.record(9_600.0);
        }
        for _ in 0..4 {
            trend.record(12_000.0);
        }
        assert_eq!(trend.percentile(0.95), Some(9_600.0));
        assert_eq!(trend.percentile(0.99), Some(12_000.0));
        assert_eq!(trend.median(), Some(9_600.0));
    }

    #[test]
    fn aggregator_is_shared() {
        let aggregator = MetricsAggregator::new();
        let handle = aggregator.clone();

        handle.record(MetricObservation::rate("session_creation_success_rate", true));
        aggregator.record(MetricObservation::rate("session_creation_success_rate", false));
        handle.record(MetricObservation::trend(END_TO_END_DURATION, 120.0));
        handle.complete_iteration();

        let metrics = aggregator.finalize();
        assert_eq!(metrics.iterations, 1);
        assert_eq!(metrics.rate("session_creation_success_rate"), Some(0.5));
        assert_eq!(metrics.trend(END_TO_END_DURATION).unwrap().count, 1);
        assert!(metrics.trend("session_creation_success_rate").is_none());
    }

    #[test]
    fn mismatched_kind_is_ignored() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(MetricObservation::trend(HTTP_REQ_DURATION, 10.0));
        aggregator.record(MetricObservation::rate(HTTP_REQ_DURATION, true));

        match aggregator.get(HTTP_REQ_DURATION) {
            Some(MetricAggregate::Trend(trend)) => assert_eq!(trend.count, 1),
            other => panic!("unexpected aggregate: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recording() {
        let aggregator = MetricsAggregator::new();
        let mut handles = Vec::new();
        for vu in 0..8 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..1_000 {
                    aggregator.record(MetricObservation::rate("ok", (vu + i) % 4 != 0));
                    aggregator.record(MetricObservation::trend("latency", i as f64));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let metrics = aggregator.finalize();
        let rate = metrics.rate_aggregate("ok").unwrap();
        assert_eq!(rate.total(), 8_000);
        assert_eq!(rate.fails, 2_000);
        assert_eq!(metrics.trend("latency").unwrap().count, 8_000);
    }

    #[test]
    fn display_tables() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(MetricObservation::rate("session_creation_success_rate", true));
        aggregator.record(MetricObservation::trend(END_TO_END_DURATION, 250.0));
        let output = aggregator.finalize().to_string();
        assert!(output.contains("=== RATE METRICS ==="));
        assert!(output.contains("session_creation_success_rate"));
        assert!(output.contains("=== TREND METRICS ==="));
        assert!(output.contains(END_TO_END_DURATION));
    }
}
