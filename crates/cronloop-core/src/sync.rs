//! Sync step
//!
//! gather runs -> ingest -> window -> aggregate -> recommend -> persist
//! summary and reports -> propose new experiments to the backlog.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::backlog::ExperimentBacklog;
use crate::config::{LoopConfig, WorkspacePaths};
use crate::experiment::Experiment;
use crate::job_control::JobControl;
use crate::metrics::{MetricSummary, MetricsAggregator};
use crate::recommendation::RecommendationEngine;
use crate::report::{render_sync_report, write_report};
use crate::run::RunRecord;
use crate::run_store::RunStore;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub profile: String,
    pub window_days: u32,
    pub runs_per_job_limit: usize,
    pub min_sample: u64,
}

impl From<&LoopConfig> for SyncOptions {
    fn from(config: &LoopConfig) -> Self {
        Self {
            profile: config.profile.clone(),
            window_days: config.window_days,
            runs_per_job_limit: config.runs_per_job_limit,
            min_sample: config.min_sample,
        }
    }
}

/// Result of one sync invocation
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub summary: MetricSummary,
    pub report: PathBuf,
    pub latest_report: PathBuf,
    /// Experiments appended to the backlog by this run
    pub new_experiments: Vec<Experiment>,
}

/// Fetch recent runs of every job and normalize them
pub async fn gather_runs(
    jobs: &dyn JobControl,
    runs_per_job_limit: usize,
) -> Result<(Vec<RunRecord>, BTreeMap<String, String>)> {
    let job_list = jobs.list_jobs().await?;
    let aliases = jobs.model_aliases().await?;

    let mut records = Vec::new();
    for job in job_list.iter().filter(|j| !j.id.is_empty()) {
        let entries = jobs.list_runs(&job.id, runs_per_job_limit).await?;
        debug!(job_id = %job.id, entries = entries.len(), "Fetched run history");
        records.extend(
            entries
                .iter()
                .map(|entry| RunRecord::from_raw(job, entry, &aliases)),
        );
    }
    Ok((records, aliases))
}

/// Run one sync cycle
pub async fn run_sync(
    jobs: &dyn JobControl,
    paths: &WorkspacePaths,
    options: &SyncOptions,
    now: DateTime<Utc>,
) -> Result<SyncOutcome> {
    paths.ensure_dirs()?;

    let (records, aliases) = gather_runs(jobs, options.runs_per_job_limit).await?;
    let store = RunStore::new(paths.runs_file());
    let new_rows = store.ingest(&records)?;

    let cutoff = now - Duration::days(i64::from(options.window_days));
    let window = store.window(cutoff.timestamp_millis())?;
    let aggregate = MetricsAggregator::aggregate(&window);
    let recommendations = RecommendationEngine::new(options.min_sample).generate(&aggregate.jobs);

    let summary = MetricSummary {
        generated_at: now,
        profile: options.profile.clone(),
        window_days: options.window_days,
        aliases,
        new_rows_ingested: new_rows,
        window: aggregate.fleet,
        jobs: aggregate.jobs,
        recommendations,
    };
    summary.save(&paths.summary_file())?;

    let markdown = render_sync_report(&summary);
    let report = paths.dated_report(now);
    let latest_report = paths.latest_report();
    write_report(&report, &markdown)?;
    write_report(&latest_report, &markdown)?;

    let backlog = ExperimentBacklog::new(paths.backlog_file());
    let new_experiments = backlog.propose(&summary.recommendations, now)?;

    info!(
        profile = %options.profile,
        new_rows,
        window_runs = summary.window.runs,
        recommendations = summary.recommendations.len(),
        new_experiments = new_experiments.len(),
        "Sync complete"
    );

    Ok(SyncOutcome {
        summary,
        report,
        latest_report,
        new_experiments,
    })
}
