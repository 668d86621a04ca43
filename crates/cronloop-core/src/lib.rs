//! Cronloop Core - metrics and experiment control for scheduled jobs
//!
//! This crate provides the feedback loop behind the `cronloop` CLI:
//! - Run ingestion and windowed metrics
//! - Recommendations and the experiment backlog
//! - The single-active-experiment controller
//! - Job-control backends (scheduler CLI and in-memory)

pub mod backlog;
pub mod config;
pub mod controller;
pub mod error;
pub mod experiment;
pub mod job_control;
pub mod metrics;
pub mod openclaw;
pub mod persistence;
pub mod recommendation;
pub mod report;
pub mod run;
pub mod run_store;
pub mod sync;

pub use backlog::ExperimentBacklog;
pub use config::{LeanPromptRule, LoopConfig, WorkspacePaths};
pub use error::{Error, Result};
pub use job_control::{InMemoryJobControl, Job, JobControl, JobEdit, JobFixture, JobPayload};
pub use openclaw::OpenClawJobControl;
pub use run::{RunRecord, RunStatus};
pub use run_store::RunStore;

// Re-export experiment types
pub use experiment::{
    AppliedAction, Decision, Experiment, ExperimentAction, ExperimentResult, ExperimentStatus,
    ExperimentType, Priority, RollbackPayload,
};

// Re-export metrics types
pub use metrics::{FleetSnapshot, JobMetricSnapshot, MetricSummary, MetricsAggregator};

// Re-export recommendation types
pub use recommendation::{Recommendation, RecommendationEngine};

// Re-export control loop types
pub use controller::{ControlOptions, ControlOutcome, CycleStatus, ExperimentController};
pub use sync::{run_sync, SyncOptions, SyncOutcome};
