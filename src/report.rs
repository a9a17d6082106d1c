//! Optionally writes a json-formatted summary report after running a load test.

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::metrics::{MetricAggregate, StressMetrics};
use crate::threshold::ThresholdVerdict;
use crate::StressError;

/// Defines the metrics reported about a `Rate` metric.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RateMetric {
    pub name: String,
    pub rate: Option<f64>,
    pub passes: usize,
    pub fails: usize,
}

/// Defines the metrics reported about a `Trend` metric, all times in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TrendMetric {
    pub name: String,
    pub count: usize,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub percentile_50: Option<f64>,
    pub percentile_90: Option<f64>,
    pub percentile_95: Option<f64>,
    pub percentile_99: Option<f64>,
}

/// The complete report document.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SummaryReport<'a> {
    pub package: &'static str,
    pub version: &'static str,
    pub scenario: &'a str,
    pub flow: Option<String>,
    pub vus: usize,
    pub duration: usize,
    pub iterations: usize,
    pub iterations_per_second: f64,
    pub started: Option<String>,
    pub stopped: Option<String>,
    pub rates: Vec<RateMetric>,
    pub trends: Vec<TrendMetric>,
    pub thresholds: &'a [ThresholdVerdict],
    pub thresholds_passed: bool,
}

/// Helper to build the report from final metrics.
pub(crate) fn summary_report(metrics: &StressMetrics) -> SummaryReport<'_> {
    let mut rates = Vec::new();
    let mut trends = Vec::new();
    for (name, aggregate) in &metrics.metrics {
        match aggregate {
            MetricAggregate::Rate(rate) => rates.push(RateMetric {
                name: name.to_string(),
                rate: rate.rate(),
                passes: rate.passes,
                fails: rate.fails,
            }),
            MetricAggregate::Trend(trend) => trends.push(TrendMetric {
                name: name.to_string(),
                count: trend.count,
                average: trend.avg(),
                minimum: trend.min(),
                maximum: trend.max(),
                percentile_50: trend.median(),
                percentile_90: trend.percentile(0.9),
                percentile_95: trend.percentile(0.95),
                percentile_99: trend.percentile(0.99),
            }),
        }
    }

    SummaryReport {
        package: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        scenario: &metrics.scenario,
        flow: metrics.flow.map(|flow| flow.to_string()),
        vus: metrics.vus,
        duration: metrics.duration,
        iterations: metrics.iterations,
        iterations_per_second: metrics.iterations_per_second(),
        started: metrics.started.map(|t| t.to_rfc3339()),
        stopped: metrics.stopped.map(|t| t.to_rfc3339()),
        rates,
        trends,
        thresholds: &metrics.thresholds.verdicts,
        thresholds_passed: metrics.thresholds.passed(),
    }
}

/// Write the summary report to `path`, replacing any existing file.
pub(crate) async fn write_report_file(
    path: &str,
    metrics: &StressMetrics,
) -> Result<(), StressError> {
    let report = serde_json::to_string_pretty(&summary_report(metrics))?;

    let mut report_file = tokio::fs::File::create(path).await?;
    report_file.write_all(report.as_bytes()).await?;
    report_file.write_all(b"\n").await?;
    report_file.flush().await?;

    info!("wrote report file to: {}", path);
    Ok(())
}
