//! Experiment records
//!
//! An [`Experiment`] carries one recommendation through its lifecycle:
//!
//! ```text
//! proposed -> active -> promoted | rolled_back
//! proposed -> manual_required | blocked
//! ```
//!
//! At most one experiment may be `active` at any time; see
//! [`ensure_single_active`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::metrics::JobMetricSnapshot;
use crate::recommendation::Recommendation;
use crate::{Error, Result};

/// Status of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Waiting in the backlog
    Proposed,
    /// Change applied, collecting post-change runs
    Active,
    /// Change kept
    Promoted,
    /// Change reverted
    RolledBack,
    /// No safe automated action exists
    ManualRequired,
    /// Precondition failed (e.g. the job is gone)
    Blocked,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 6] = [
        Self::Proposed,
        Self::Active,
        Self::Promoted,
        Self::RolledBack,
        Self::ManualRequired,
        Self::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Active => "active",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
            Self::ManualRequired => "manual_required",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Proposed | Self::Active)
    }

    pub fn can_transition_to(&self, target: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, target),
            (Proposed, Active)
                | (Proposed, ManualRequired)
                | (Proposed, Blocked)
                | (Active, Promoted)
                | (Active, RolledBack)
        )
    }
}

impl FromStr for ExperimentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "proposed" => Ok(Self::Proposed),
            "active" => Ok(Self::Active),
            "promoted" => Ok(Self::Promoted),
            "rolled_back" => Ok(Self::RolledBack),
            "manual_required" => Ok(Self::ManualRequired),
            "blocked" => Ok(Self::Blocked),
            _ => Err(Error::Parse(format!("Invalid experiment status: {}", s))),
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dimension an experiment tries to improve
///
/// Serialized as its bare name. Names this build does not know are kept
/// verbatim in `Unsupported` so a backlog rewrite does not lose them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExperimentType {
    Routing,
    Reliability,
    Latency,
    Cost,
    Unsupported(String),
}

impl ExperimentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Routing => "routing",
            Self::Reliability => "reliability",
            Self::Latency => "latency",
            Self::Cost => "cost",
            Self::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl From<String> for ExperimentType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "routing" => Self::Routing,
            "reliability" => Self::Reliability,
            "latency" => Self::Latency,
            "cost" => Self::Cost,
            _ => Self::Unsupported(name),
        }
    }
}

impl From<ExperimentType> for String {
    fn from(kind: ExperimentType) -> Self {
        match kind {
            ExperimentType::Unsupported(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for ExperimentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "routing" => Ok(Self::Routing),
            "reliability" => Ok(Self::Reliability),
            "latency" => Ok(Self::Latency),
            "cost" => Ok(Self::Cost),
            _ => Err(Error::Parse(format!("Invalid experiment type: {}", s))),
        }
    }
}

impl std::fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority of a recommendation / experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Sort rank, lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(Error::Parse(format!("Invalid priority: {}", s))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Concrete configuration change applied for an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExperimentAction {
    /// Pin the job's model to an explicit provider/model ref
    PinModel { model: String },
    /// Replace the job's message with the contents of a prompt file
    ReplaceMessage { path: String },
}

impl ExperimentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PinModel { .. } => "pin_model",
            Self::ReplaceMessage { .. } => "replace_message",
        }
    }
}

/// Job configuration captured just before an action was applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPayload {
    #[serde(default)]
    pub prior_model: String,
    #[serde(default)]
    pub prior_message: String,
}

/// Record of the change made at activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedAction {
    pub action: ExperimentAction,
    pub job_id: String,
    pub rollback: RollbackPayload,
    pub dry_run: bool,
}

/// Outcome of evaluating an active experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Hold,
    Promote,
    Rollback,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Promote => "promote",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final result of a resolved experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    pub decision: ExperimentStatus,
    pub reason: String,
    pub metric_snapshot: JobMetricSnapshot,
}

/// One tracked attempt at a single configuration change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub job: String,
    pub priority: Priority,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub change: String,
    #[serde(default)]
    pub target_metric: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<JobMetricSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExperimentResult>,
}

impl Experiment {
    pub fn new(job: impl Into<String>, experiment_type: ExperimentType, priority: Priority) -> Self {
        Self {
            id: format!("exp-{}", Uuid::new_v4()),
            experiment_type,
            job: job.into(),
            priority,
            status: ExperimentStatus::Proposed,
            issue: String::new(),
            change: String::new(),
            target_metric: String::new(),
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
            ended_at: None,
            blocked_reason: None,
            baseline: None,
            applied: None,
            last_evaluation_at: None,
            last_evaluation_decision: None,
            last_evaluation_reason: None,
            result: None,
        }
    }

    /// Proposed experiment for a recommendation
    pub fn from_recommendation(rec: &Recommendation, created_at: DateTime<Utc>) -> Self {
        let mut exp = Self::new(rec.job.clone(), rec.experiment_type.clone(), rec.priority);
        exp.issue = rec.issue.clone();
        exp.change = rec.change.clone();
        exp.target_metric = rec.target_metric.clone();
        exp.created_at = created_at;
        exp
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_change(mut self, change: impl Into<String>) -> Self {
        self.change = change.into();
        self
    }

    /// Backlog deduplication key
    pub fn key(&self) -> (String, ExperimentType, String) {
        (self.job.clone(), self.experiment_type.clone(), self.change.clone())
    }

    pub fn is_active(&self) -> bool {
        self.status == ExperimentStatus::Active
    }

    /// Move to `new_status`, rejecting transitions outside the lifecycle
    pub fn transition_to(&mut self, new_status: ExperimentStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(Error::InvalidStateTransition(
                self.status.to_string(),
                new_status.to_string(),
            ));
        }

        self.status = new_status;
        self.updated_at = Some(now);
        match new_status {
            ExperimentStatus::Active => self.started_at = Some(now),
            ExperimentStatus::Promoted | ExperimentStatus::RolledBack => self.ended_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Terminate without ever activating
    pub fn close(&mut self, status: ExperimentStatus, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(status, now)?;
        self.blocked_reason = Some(reason.to_string());
        Ok(())
    }
}

/// Fail unless at most one experiment is active
pub fn ensure_single_active(experiments: &[Experiment]) -> Result<()> {
    let active: Vec<&str> = experiments
        .iter()
        .filter(|e| e.is_active())
        .map(|e| e.id.as_str())
        .collect();
    if active.len() > 1 {
        return Err(Error::InvariantViolation(format!(
            "{} experiments active at once: {}",
            active.len(),
            active.join(", ")
        )));
    }
    Ok(())
}
