//! Pass/fail thresholds evaluated against aggregated metrics.
//!
//! A threshold pairs a metric name with an expression of the form `<stat> <op> <number>`:
//!
//! | stat     | applies to | meaning                                  |
//! |----------|------------|------------------------------------------|
//! | `rate`   | Rate       | fraction of `true` observations          |
//! | `avg`    | Trend      | arithmetic mean                          |
//! | `min`    | Trend      | smallest sample                          |
//! | `max`    | Trend      | largest sample                           |
//! | `med`    | Trend      | median                                   |
//! | `p(N)`   | Trend      | Nth percentile, `N` between 0 and 100    |
//! | `count`  | both       | number of observations                   |
//!
//! The operator is one of `<`, `<=`, `>`, `>=`, `==`, `!=`. For example `rate>0.99`,
//! `avg<300`, or `p(95)<10000`.
//!
//! A threshold on a metric that never received an observation fails, as does a statistic
//! that doesn't apply to the metric's kind.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::metrics::{MetricAggregate, MetricKind};
use crate::util;
use crate::StressError;

lazy_static! {
    static ref EXPRESSION: Regex = Regex::new(
        r"^\s*(?P<stat>rate|avg|min|max|med|count|p\(\s*(?P<percent>\d+(\.\d+)?)\s*\))\s*(?P<op><=|>=|==|!=|<|>)\s*(?P<target>-?\d+(\.\d+)?)\s*$"
    )
    .unwrap();
}

/// The statistic a threshold reads from an aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdStat {
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Count,
    /// Percentile, 0 to 100.
    Percentile(f64),
}
impl ThresholdStat {
    /// Read this statistic from an aggregate, `None` if it doesn't apply.
    pub fn observe(&self, aggregate: &MetricAggregate) -> Option<f64> {
        match (self, aggregate) {
            (ThresholdStat::Count, aggregate) => Some(aggregate.count() as f64),
            (ThresholdStat::Rate, MetricAggregate::Rate(rate)) => rate.rate(),
            (ThresholdStat::Avg, MetricAggregate::Trend(trend)) => trend.avg(),
            (ThresholdStat::Min, MetricAggregate::Trend(trend)) => trend.min(),
            (ThresholdStat::Max, MetricAggregate::Trend(trend)) => trend.max(),
            (ThresholdStat::Med, MetricAggregate::Trend(trend)) => trend.median(),
            (ThresholdStat::Percentile(percent), MetricAggregate::Trend(trend)) => {
                trend.percentile(percent / 100.0)
            }
            _ => None,
        }
    }

    /// The metric kind this statistic reads, `None` if it reads either.
    pub fn kind(&self) -> Option<MetricKind> {
        match self {
            ThresholdStat::Count => None,
            ThresholdStat::Rate => Some(MetricKind::Rate),
            _ => Some(MetricKind::Trend),
        }
    }
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThresholdOperator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}
impl ThresholdOperator {
    pub fn compare(&self, observed: f64, target: f64) -> bool {
        match self {
            ThresholdOperator::Lt => observed < target,
            ThresholdOperator::Le => observed <= target,
            ThresholdOperator::Gt => observed > target,
            ThresholdOperator::Ge => observed >= target,
            ThresholdOperator::Eq => (observed - target).abs() < f64::EPSILON,
            ThresholdOperator::Ne => (observed - target).abs() >= f64::EPSILON,
        }
    }
}
impl FromStr for ThresholdOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(ThresholdOperator::Lt),
            "<=" => Ok(ThresholdOperator::Le),
            ">" => Ok(ThresholdOperator::Gt),
            ">=" => Ok(ThresholdOperator::Ge),
            "==" => Ok(ThresholdOperator::Eq),
            "!=" => Ok(ThresholdOperator::Ne),
            _ => Err(format!("unknown operator `{}`", s)),
        }
    }
}

/// A parsed `<stat> <op> <number>` expression.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdExpression {
    /// The expression as declared.
    pub source: String,
    pub stat: ThresholdStat,
    pub operator: ThresholdOperator,
    pub target: f64,
}
impl ThresholdExpression {
    /// Does the observed value satisfy this expression?
    pub fn holds(&self, observed: f64) -> bool {
        self.operator.compare(observed, self.target)
    }
}
impl FromStr for ThresholdExpression {
    type Err = StressError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| StressError::InvalidThreshold {
            metric: "".to_string(),
            expression: expression.to_string(),
            detail: detail.to_string(),
        };

        let captures = EXPRESSION.captures(expression).ok_or_else(|| {
            invalid("expected `<stat> <op> <number>`, with stat one of rate, avg, min, max, med, count, p(N)")
        })?;

        let stat = match &captures["stat"] {
            "rate" => ThresholdStat::Rate,
            "avg" => ThresholdStat::Avg,
            "min" => ThresholdStat::Min,
            "max" => ThresholdStat::Max,
            "med" => ThresholdStat::Med,
            "count" => ThresholdStat::Count,
            _ => {
                let percent = captures
                    .name("percent")
                    .and_then(|p| f64::from_str(p.as_str()).ok())
                    .ok_or_else(|| invalid("invalid percentile"))?;
                if percent > 100.0 {
                    return Err(invalid("percentile must be between 0 and 100"));
                }
                ThresholdStat::Percentile(percent)
            }
        };
        let operator =
            ThresholdOperator::from_str(&captures["op"]).map_err(|e| invalid(e.as_str()))?;
        let target =
            f64::from_str(&captures["target"]).map_err(|_| invalid("invalid target number"))?;

        Ok(ThresholdExpression {
            source: expression.trim().to_string(),
            stat,
            operator,
            target,
        })
    }
}
impl fmt::Display for ThresholdExpression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// A threshold declared on a metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Threshold {
    pub metric: String,
    pub expression: ThresholdExpression,
}
impl Threshold {
    /// Parse `expression` for the named metric.
    pub fn new(metric: &str, expression: &str) -> Result<Threshold, StressError> {
        let metric = metric.trim();
        if metric.is_empty() {
            return Err(StressError::InvalidThreshold {
                metric: "".to_string(),
                expression: expression.to_string(),
                detail: "threshold must name a metric".to_string(),
            });
        }
        let expression = ThresholdExpression::from_str(expression).map_err(|e| match e {
            StressError::InvalidThreshold {
                expression, detail, ..
            } => StressError::InvalidThreshold {
                metric: metric.to_string(),
                expression,
                detail,
            },
            other => other,
        })?;
        Ok(Threshold {
            metric: metric.to_string(),
            expression,
        })
    }

    /// Evaluate against all aggregates.
    pub fn evaluate(&self, metrics: &BTreeMap<String, MetricAggregate>) -> ThresholdVerdict {
        let observed_value = match metrics.get(&self.metric) {
            Some(aggregate) => {
                let observed = self.expression.stat.observe(aggregate);
                if observed.is_none() {
                    warn!(
                        "threshold {} {} can't be read from {} metric",
                        self.metric,
                        self.expression,
                        aggregate.kind()
                    );
                }
                observed
            }
            None => {
                warn!("threshold metric {} has no observations", self.metric);
                None
            }
        };
        let passed = match observed_value {
            Some(observed) => self.expression.holds(observed),
            None => false,
        };

        ThresholdVerdict {
            metric_name: self.metric.clone(),
            expression: self.expression.to_string(),
            passed,
            observed_value,
        }
    }
}
/// Parse the command line form, `metric:expression`.
impl FromStr for Threshold {
    type Err = StressError;

    fn from_str(declared: &str) -> Result<Self, Self::Err> {
        match declared.split_once(':') {
            Some((metric, expression)) => Threshold::new(metric, expression),
            None => Err(StressError::InvalidThreshold {
                metric: "".to_string(),
                expression: declared.to_string(),
                detail: "expected `metric:expression`, for example `end_to_end_duration:avg<300`"
                    .to_string(),
            }),
        }
    }
}

/// The outcome of one threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    pub metric_name: String,
    pub expression: String,
    pub passed: bool,
    /// `None` when the metric has no observations or the statistic doesn't apply.
    pub observed_value: Option<f64>,
}

/// Every verdict of a load test.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub verdicts: Vec<ThresholdVerdict>,
}
impl ThresholdReport {
    /// True iff every threshold passed. No thresholds is a pass.
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    pub fn failed(&self) -> Vec<&ThresholdVerdict> {
        self.verdicts.iter().filter(|v| !v.passed).collect()
    }

    /// The verdict for a metric and expression, if declared.
    pub fn verdict(&self, metric_name: &str, expression: &str) -> Option<&ThresholdVerdict> {
        self.verdicts
            .iter()
            .find(|v| v.metric_name == metric_name && v.expression == expression)
    }
}
impl fmt::Display for ThresholdReport {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.verdicts.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === THRESHOLDS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<30} | {:<16} | {:>12} | {:>6}",
            "Metric", "Expression", "Observed", "Result"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for verdict in &self.verdicts {
            writeln!(
                fmt,
                " {:<30} | {:<16} | {:>12} | {:>6}",
                util::truncate_string(&verdict.metric_name, 30),
                util::truncate_string(&verdict.expression, 16),
                match verdict.observed_value {
                    Some(observed) => format!("{:.4}", observed),
                    None => "no data".to_string(),
                },
                if verdict.passed { "PASS" } else { "FAIL" },
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        if self.passed() {
            writeln!(fmt, " All thresholds passed.")
        } else {
            writeln!(
                fmt,
                " Threshold failures: {}",
                self.failed()
                    .iter()
                    .map(|v| format!("{} {}", v.metric_name, v.expression))
                    .join(", ")
            )
        }
    }
}

/// Evaluate every threshold once, after the load test stopped.
pub fn evaluate(
    thresholds: &[Threshold],
    metrics: &BTreeMap<String, MetricAggregate>,
) -> ThresholdReport {
    let verdicts: Vec<ThresholdVerdict> = thresholds.iter().map(|t| t.evaluate(metrics)).collect();
    for verdict in &verdicts {
        if verdict.passed {
            info!("threshold passed: {} {}", verdict.metric_name, verdict.expression);
        } else {
            warn!(
                "threshold failed: {} {} (observed {:?})",
                verdict.metric_name, verdict.expression, verdict.observed_value
            );
        }
    }
    ThresholdReport { verdicts }
}
