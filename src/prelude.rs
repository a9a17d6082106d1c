//! Everything needed to run or embed a load test.

pub use crate::client::{HttpClient, ReqwestClient, StepRequest, StepResponse};
pub use crate::config::{
    ScenarioPreset, ScenarioSpec, StressConfiguration, TestConfig, TestDataSet,
};
pub use crate::metrics::{
    MetricAggregate, MetricKind, MetricObservation, MetricsAggregator, MetricsSink,
    StressMetrics,
};
pub use crate::observer::{AttackObserver, LoggingObserver};
pub use crate::step::{StepOutcome, WorkflowStep};
pub use crate::threshold::{Threshold, ThresholdReport, ThresholdVerdict};
pub use crate::workflow::{ChatWorkflow, FlowKind, WorkflowResult, WorkflowState};
pub use crate::{AttackPhase, StressAttack, StressError};
