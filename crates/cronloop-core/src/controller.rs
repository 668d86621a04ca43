//! Experiment controller
//!
//! One invocation of [`ExperimentController::run_cycle`] either activates the
//! next proposed experiment or evaluates the active one, never both. All
//! mutation happens on an in-memory copy of the backlog which is written back
//! only after the pass completes, so a failing job-control call leaves the
//! backlog untouched.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::backlog::ExperimentBacklog;
use crate::config::{LoopConfig, WorkspacePaths};
use crate::experiment::{
    ensure_single_active, AppliedAction, Decision, Experiment, ExperimentAction, ExperimentResult,
    ExperimentStatus, ExperimentType, RollbackPayload,
};
use crate::job_control::{Job, JobControl, JobEdit};
use crate::metrics::{JobMetricSnapshot, MetricSummary};
use crate::{Error, Result};

pub const REASON_JOB_NOT_FOUND: &str = "job_not_found";
pub const REASON_NO_SAFE_ACTION: &str = "no_safe_auto_action";
pub const REASON_UNSUPPORTED_TYPE: &str = "unsupported_type";

const RELIABILITY_PROMOTE: f64 = 0.95;
const RELIABILITY_ROLLBACK: f64 = 0.70;
// ratios in tenths of the baseline, compared in integer arithmetic
const COST_PROMOTE_TENTHS: u64 = 8;
const LATENCY_PROMOTE_TENTHS: u64 = 7;
const REGRESSION_TENTHS: u64 = 11;

/// What a control-loop invocation ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Backlog is empty
    NoExperiments,
    /// Nothing active and nothing eligible to activate
    Idle,
    Activated,
    Blocked,
    ManualRequired,
    /// Active experiment has no metric snapshot yet
    NoMetrics,
    Held,
    Promoted,
    RolledBack,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoExperiments => "no_experiments",
            Self::Idle => "idle",
            Self::Activated => "activated",
            Self::Blocked => "blocked",
            Self::ManualRequired => "manual_required",
            Self::NoMetrics => "no_metrics",
            Self::Held => "held",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one control-loop invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    pub status: CycleStatus,
    /// Human-readable action log, one line per action
    pub actions: Vec<String>,
}

impl ControlOutcome {
    fn new(status: CycleStatus) -> Self {
        Self {
            status,
            actions: Vec::new(),
        }
    }

    fn log(mut self, line: String) -> Self {
        info!(status = self.status.as_str(), "{}", line);
        self.actions.push(line);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// Runs required after activation before evaluating
    pub min_new_runs: u64,
    /// Record transitions without calling the job-control mutation interface
    pub dry_run: bool,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            min_new_runs: 2,
            dry_run: false,
        }
    }
}

/// Single-active-experiment state machine
#[derive(Debug, Clone, Default)]
pub struct ExperimentController {
    options: ControlOptions,
    /// (job, absolute path of its lean prompt variant)
    lean_prompts: Vec<(String, PathBuf)>,
}

impl ExperimentController {
    pub fn new(options: ControlOptions) -> Self {
        Self {
            options,
            lean_prompts: Vec::new(),
        }
    }

    pub fn from_config(config: &LoopConfig, paths: &WorkspacePaths, dry_run: bool) -> Self {
        let mut controller = Self::new(ControlOptions {
            min_new_runs: config.min_new_runs,
            dry_run,
        });
        for rule in &config.lean_prompts {
            controller = controller.with_lean_prompt(rule.job.clone(), paths.resolve(&rule.path));
        }
        controller
    }

    /// Register a known high-cost job and its pre-authored lean prompt
    pub fn with_lean_prompt(mut self, job: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.lean_prompts.push((job.into(), path.into()));
        self
    }

    pub fn options(&self) -> &ControlOptions {
        &self.options
    }

    /// Run one invocation against the backlog and persist the result
    pub async fn run_cycle(
        &self,
        jobs: &dyn JobControl,
        backlog: &ExperimentBacklog,
        summary: Option<&MetricSummary>,
        now: DateTime<Utc>,
    ) -> Result<ControlOutcome> {
        let mut experiments = backlog.load_all()?;
        if experiments.is_empty() {
            info!("No experiments in backlog");
            return Ok(ControlOutcome::new(CycleStatus::NoExperiments));
        }

        let outcome = self.step(jobs, &mut experiments, summary, now).await?;

        ensure_single_active(&experiments)?;
        backlog.save_all(&experiments)?;
        Ok(outcome)
    }

    /// Apply one cycle to an in-memory backlog
    pub async fn step(
        &self,
        jobs: &dyn JobControl,
        experiments: &mut [Experiment],
        summary: Option<&MetricSummary>,
        now: DateTime<Utc>,
    ) -> Result<ControlOutcome> {
        ensure_single_active(experiments)?;
        let unsupported = close_unsupported(experiments, now)?;

        let mut outcome = match experiments.iter().position(Experiment::is_active) {
            Some(idx) => {
                self.evaluate_active(jobs, &mut experiments[idx], summary, now)
                    .await?
            }
            None => self.activate_next(jobs, experiments, summary, now).await?,
        };

        if !unsupported.is_empty() {
            let mut lines = unsupported;
            lines.append(&mut outcome.actions);
            outcome.actions = lines;
        }
        Ok(outcome)
    }

    async fn activate_next(
        &self,
        jobs: &dyn JobControl,
        experiments: &mut [Experiment],
        summary: Option<&MetricSummary>,
        now: DateTime<Utc>,
    ) -> Result<ControlOutcome> {
        let Some(idx) = select_candidate(experiments) else {
            debug!("No proposed experiment eligible for activation");
            return Ok(ControlOutcome::new(CycleStatus::Idle));
        };

        let job_list = jobs.list_jobs().await?;
        let exp = &mut experiments[idx];
        let job = match find_job(&job_list, &exp.job) {
            Some(job) => job,
            None => {
                exp.close(ExperimentStatus::Blocked, REASON_JOB_NOT_FOUND, now)?;
                warn!(experiment = %exp.id, job = %exp.job, "Job not found, blocking experiment");
                return Ok(ControlOutcome::new(CycleStatus::Blocked)
                    .log(format!("Blocked {} (job not found).", exp.id)));
            }
        };

        let metric = summary.and_then(|s| s.job(&exp.job));
        let Some(action) = self.resolve_action(exp, metric) else {
            exp.close(ExperimentStatus::ManualRequired, REASON_NO_SAFE_ACTION, now)?;
            return Ok(ControlOutcome::new(CycleStatus::ManualRequired)
                .log(format!("Manual required for {} (no safe action mapping).", exp.id)));
        };

        let rollback = RollbackPayload {
            prior_model: job.payload.model_or_empty().to_string(),
            prior_message: job.payload.message_or_empty().to_string(),
        };
        if !self.options.dry_run {
            self.apply(jobs, &job.id, &action).await?;
        }

        exp.transition_to(ExperimentStatus::Active, now)?;
        exp.baseline = Some(
            metric
                .cloned()
                .unwrap_or_else(|| JobMetricSnapshot::empty(exp.job.clone())),
        );
        exp.applied = Some(AppliedAction {
            action: action.clone(),
            job_id: job.id.clone(),
            rollback,
            dry_run: self.options.dry_run,
        });

        info!(
            experiment = %exp.id,
            job = %exp.job,
            action = action.kind(),
            dry_run = self.options.dry_run,
            "Experiment activated"
        );
        Ok(ControlOutcome::new(CycleStatus::Activated)
            .log(format!("Activated {} with action {}.", exp.id, action.kind())))
    }

    /// Concrete action for an experiment, or `None` when no safe automated
    /// change exists
    pub fn resolve_action(
        &self,
        exp: &Experiment,
        metric: Option<&JobMetricSnapshot>,
    ) -> Option<ExperimentAction> {
        match exp.experiment_type {
            ExperimentType::Routing => metric
                .map(|m| m.configured_model.trim())
                .filter(|model| !model.is_empty())
                .map(|model| ExperimentAction::PinModel {
                    model: model.to_string(),
                }),
            ExperimentType::Reliability | ExperimentType::Cost => self
                .lean_prompts
                .iter()
                .find(|(job, _)| *job == exp.job)
                .filter(|(_, path)| path.is_file())
                .map(|(_, path)| ExperimentAction::ReplaceMessage {
                    path: path.display().to_string(),
                }),
            ExperimentType::Latency | ExperimentType::Unsupported(_) => None,
        }
    }

    async fn apply(&self, jobs: &dyn JobControl, job_id: &str, action: &ExperimentAction) -> Result<()> {
        let edit = match action {
            ExperimentAction::PinModel { model } => {
                if model.is_empty() {
                    return Err(Error::UnsupportedAction(
                        "pin_model requires a model".to_string(),
                    ));
                }
                JobEdit::model(model.clone())
            }
            ExperimentAction::ReplaceMessage { path } => {
                let message = std::fs::read_to_string(path)?;
                JobEdit::message(message.trim())
            }
        };
        jobs.edit_job(job_id, &edit).await
    }

    async fn evaluate_active(
        &self,
        jobs: &dyn JobControl,
        exp: &mut Experiment,
        summary: Option<&MetricSummary>,
        now: DateTime<Utc>,
    ) -> Result<ControlOutcome> {
        let Some(metric) = summary.and_then(|s| s.job(&exp.job)) else {
            return Ok(ControlOutcome::new(CycleStatus::NoMetrics)
                .log(format!("No metrics yet for active experiment {}.", exp.id)));
        };

        let (decision, reason) = self.evaluate(exp, metric);
        exp.last_evaluation_at = Some(now);
        exp.last_evaluation_decision = Some(decision);
        exp.last_evaluation_reason = Some(reason.clone());
        info!(experiment = %exp.id, decision = %decision, reason = %reason, "Evaluated active experiment");

        match decision {
            Decision::Hold => Ok(ControlOutcome::new(CycleStatus::Held)
                .log(format!("Holding {}: {}", exp.id, reason))),
            Decision::Promote => {
                exp.transition_to(ExperimentStatus::Promoted, now)?;
                exp.result = Some(ExperimentResult {
                    decision: ExperimentStatus::Promoted,
                    reason: reason.clone(),
                    metric_snapshot: metric.clone(),
                });
                Ok(ControlOutcome::new(CycleStatus::Promoted)
                    .log(format!("Promoted {}: {}", exp.id, reason)))
            }
            Decision::Rollback if self.options.dry_run && applied_live(exp) => {
                // a live change stays active until a real run can revert it
                warn!(
                    experiment = %exp.id,
                    job = %exp.job,
                    "Dry run would roll back a live change, leaving it active"
                );
                Ok(ControlOutcome::new(CycleStatus::Held).log(format!(
                    "Dry run: would roll back {} ({}); live change left active.",
                    exp.id, reason
                )))
            }
            Decision::Rollback => {
                self.roll_back(jobs, exp).await?;
                exp.transition_to(ExperimentStatus::RolledBack, now)?;
                exp.result = Some(ExperimentResult {
                    decision: ExperimentStatus::RolledBack,
                    reason: reason.clone(),
                    metric_snapshot: metric.clone(),
                });
                Ok(ControlOutcome::new(CycleStatus::RolledBack)
                    .log(format!("Rolled back {}: {}", exp.id, reason)))
            }
        }
    }

    /// Restore the configuration captured at activation
    async fn roll_back(&self, jobs: &dyn JobControl, exp: &Experiment) -> Result<()> {
        let Some(applied) = &exp.applied else {
            warn!(experiment = %exp.id, "Active experiment has no applied action to revert");
            return Ok(());
        };
        if self.options.dry_run || applied.dry_run || applied.job_id.is_empty() {
            return Ok(());
        }

        let edit = JobEdit {
            model: Some(applied.rollback.prior_model.clone()).filter(|m| !m.is_empty()),
            message: Some(applied.rollback.prior_message.clone()).filter(|m| !m.is_empty()),
        };
        if edit.is_empty() {
            return Ok(());
        }
        jobs.edit_job(&applied.job_id, &edit).await
    }

    /// Decision table for an active experiment against its frozen baseline
    pub fn evaluate(&self, exp: &Experiment, metric: &JobMetricSnapshot) -> (Decision, String) {
        let empty = JobMetricSnapshot::empty(exp.job.clone());
        let baseline = exp.baseline.as_ref().unwrap_or(&empty);

        let runs_after = metric.runs as i64 - baseline.runs as i64;
        if runs_after < self.options.min_new_runs as i64 {
            return (
                Decision::Hold,
                format!(
                    "Need {} new runs after activation (have {}).",
                    self.options.min_new_runs, runs_after
                ),
            );
        }

        match exp.experiment_type {
            ExperimentType::Routing => {
                if metric.model_mismatch_runs == 0 {
                    (Decision::Promote, "No model mismatch detected.".to_string())
                } else {
                    (
                        Decision::Rollback,
                        format!("Model mismatch persists ({} runs).", metric.model_mismatch_runs),
                    )
                }
            }
            ExperimentType::Reliability => {
                let pct = metric.success_rate * 100.0;
                if metric.success_rate >= RELIABILITY_PROMOTE {
                    (Decision::Promote, format!("Success rate reached {:.0}%.", pct))
                } else if metric.success_rate < RELIABILITY_ROLLBACK {
                    (Decision::Rollback, format!("Success rate dropped to {:.0}%.", pct))
                } else {
                    (Decision::Hold, format!("Success rate {:.0}% not yet at threshold.", pct))
                }
            }
            ExperimentType::Cost => ratio_decision(
                baseline.avg_tokens,
                metric.avg_tokens,
                COST_PROMOTE_TENTHS,
                "No baseline tokens available.",
                |verdict, before, after| format!("Token usage {} ({} -> {}).", verdict, before, after),
            ),
            ExperimentType::Latency => ratio_decision(
                baseline.avg_duration_ms,
                metric.avg_duration_ms,
                LATENCY_PROMOTE_TENTHS,
                "No baseline duration available.",
                |verdict, before, after| format!("Latency {} ({} -> {} ms).", verdict, before, after),
            ),
            ExperimentType::Unsupported(_) => (
                Decision::Hold,
                "Unsupported experiment type for auto-evaluation.".to_string(),
            ),
        }
    }
}

/// Promote at or below `promote_tenths`/10 of baseline, roll back at or
/// above 1.1x, hold in between
fn ratio_decision(
    baseline: u64,
    current: u64,
    promote_tenths: u64,
    no_baseline: &str,
    describe: impl Fn(&str, u64, u64) -> String,
) -> (Decision, String) {
    if baseline == 0 {
        return (Decision::Hold, no_baseline.to_string());
    }
    let (base, cur) = (baseline as u128, current as u128 * 10);
    if cur <= base * promote_tenths as u128 {
        (Decision::Promote, describe("improved", baseline, current))
    } else if cur >= base * REGRESSION_TENTHS as u128 {
        (Decision::Rollback, describe("regressed", baseline, current))
    } else {
        (Decision::Hold, describe("delta inconclusive", baseline, current))
    }
}

/// Highest-priority, oldest proposed experiment of a supported type
fn select_candidate(experiments: &[Experiment]) -> Option<usize> {
    experiments
        .iter()
        .enumerate()
        .filter(|(_, e)| e.status == ExperimentStatus::Proposed && e.experiment_type.is_supported())
        .min_by_key(|(_, e)| (e.priority.rank(), e.created_at))
        .map(|(idx, _)| idx)
}

/// Jobs are matched by name, falling back to id for unnamed jobs
fn find_job<'a>(jobs: &'a [Job], key: &str) -> Option<&'a Job> {
    jobs.iter()
        .find(|j| !j.name.is_empty() && j.name == key)
        .or_else(|| jobs.iter().find(|j| j.id == key))
}

/// Whether the active experiment's action was really applied to the job
fn applied_live(exp: &Experiment) -> bool {
    exp.applied.as_ref().is_some_and(|a| !a.dry_run)
}

fn close_unsupported(experiments: &mut [Experiment], now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for exp in experiments
        .iter_mut()
        .filter(|e| e.status == ExperimentStatus::Proposed && !e.experiment_type.is_supported())
    {
        exp.close(ExperimentStatus::ManualRequired, REASON_UNSUPPORTED_TYPE, now)?;
        warn!(experiment = %exp.id, "Unsupported experiment type, manual action required");
        lines.push(format!(
            "Manual required for {} (unsupported experiment type {}).",
            exp.id, exp.experiment_type
        ));
    }
    Ok(lines)
}
