//! Integration tests for cronloop
//!
//! These tests drive sync and control cycles end to end against the
//! in-memory job-control backend.

use chrono::{DateTime, Duration, Utc};
use cronloop_core::{
    run_sync, CycleStatus, Experiment, ExperimentBacklog, ExperimentController, ExperimentStatus,
    ExperimentType, InMemoryJobControl, Job, JobFixture, JobPayload, LoopConfig, MetricSummary,
    RunStore, SyncOptions, WorkspacePaths,
};
use cronloop_core::job_control::{RawRunEntry, RawUsage};
use std::collections::BTreeMap;
use tempfile::TempDir;

// ==================== Test Helpers ====================

struct Harness {
    _temp: TempDir,
    paths: WorkspacePaths,
    jobs: InMemoryJobControl,
    options: SyncOptions,
    controller: ExperimentController,
}

impl Harness {
    fn new(jobs: Vec<Job>) -> Self {
        Self::with_fixture(JobFixture {
            jobs,
            ..Default::default()
        })
    }

    fn with_fixture(fixture: JobFixture) -> Self {
        let temp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(temp.path());
        let config = LoopConfig::default();
        Self {
            controller: ExperimentController::from_config(&config, &paths, false),
            options: SyncOptions::from(&config),
            paths,
            jobs: InMemoryJobControl::new(fixture),
            _temp: temp,
        }
    }

    fn backlog(&self) -> ExperimentBacklog {
        ExperimentBacklog::new(self.paths.backlog_file())
    }

    fn summary(&self) -> Option<MetricSummary> {
        MetricSummary::load(&self.paths.summary_file()).unwrap()
    }

    async fn sync(&self, now: DateTime<Utc>) -> MetricSummary {
        run_sync(&self.jobs, &self.paths, &self.options, now)
            .await
            .unwrap()
            .summary
    }

    async fn control(&self, now: DateTime<Utc>) -> CycleStatus {
        let summary = self.summary();
        self.controller
            .run_cycle(&self.jobs, &self.backlog(), summary.as_ref(), now)
            .await
            .unwrap()
            .status
    }

    fn experiments(&self) -> Vec<Experiment> {
        self.backlog().load_all().unwrap()
    }
}

fn run_at(at: DateTime<Utc>, session: &str) -> RawRunEntry {
    RawRunEntry {
        run_at_ms: Some(at.timestamp_millis()),
        session_id: Some(session.to_string()),
        status: Some("ok".to_string()),
        duration_ms: Some(1000.0),
        ..Default::default()
    }
}

fn with_model(mut entry: RawRunEntry, provider: &str, model: &str) -> RawRunEntry {
    entry.provider = Some(provider.to_string());
    entry.model = Some(model.to_string());
    entry
}

fn with_tokens(mut entry: RawRunEntry, tokens: u64) -> RawRunEntry {
    entry.usage = Some(RawUsage {
        total_tokens: Some(tokens),
        ..Default::default()
    });
    entry
}

fn failed(mut entry: RawRunEntry) -> RawRunEntry {
    entry.status = Some("error".to_string());
    entry
}

/// `count` runs spaced one minute apart, starting at `start`
fn runs(start: DateTime<Utc>, prefix: &str, count: usize) -> Vec<RawRunEntry> {
    (0..count)
        .map(|i| run_at(start + Duration::minutes(i as i64), &format!("{}-{}", prefix, i)))
        .collect()
}

// ==================== Metrics & Recommendations ====================

#[tokio::test]
async fn test_nine_of_ten_ok_yields_no_recommendation() {
    let h = Harness::new(vec![Job::new("j1", "digest").with_model("x/a")]);
    let t0 = Utc::now();
    let entries = runs(t0 - Duration::hours(2), "r", 10)
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let e = with_model(e, "x", "a");
            if i == 4 {
                failed(e)
            } else {
                e
            }
        })
        .collect();
    h.jobs.push_runs("j1", entries);

    let summary = h.sync(t0).await;
    let job = summary.job("digest").unwrap();
    assert_eq!(job.runs, 10);
    assert_eq!(job.success_rate, 0.9);
    assert_eq!(job.model_mismatch_runs, 0);
    assert!(summary.recommendations.is_empty());
    assert!(h.experiments().is_empty());
}

#[tokio::test]
async fn test_costly_job_yields_one_cost_recommendation() {
    let h = Harness::new(vec![Job::new("j1", "foundry")]);
    let t0 = Utc::now();
    let entries = runs(t0 - Duration::hours(1), "r", 5)
        .into_iter()
        .zip([20000, 21000, 19000, 22000, 18000])
        .map(|(e, t)| with_tokens(e, t))
        .collect();
    h.jobs.push_runs("j1", entries);

    let summary = h.sync(t0).await;
    assert_eq!(summary.job("foundry").unwrap().avg_tokens, 20000);
    assert_eq!(summary.recommendations.len(), 1);
    assert_eq!(summary.recommendations[0].experiment_type, ExperimentType::Cost);

    let experiments = h.experiments();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0].status, ExperimentStatus::Proposed);
}

#[tokio::test]
async fn test_empty_window() {
    let h = Harness::new(vec![Job::new("j1", "digest")]);
    let t0 = Utc::now();
    h.jobs.push_runs("j1", runs(t0 - Duration::days(30), "old", 5));

    let summary = h.sync(t0).await;
    assert_eq!(summary.window.runs, 0);
    assert_eq!(summary.window.success_rate, 1.0);
    assert!(summary.jobs.is_empty());
    assert!(summary.recommendations.is_empty());

    assert_eq!(h.control(t0).await, CycleStatus::NoExperiments);
}

#[tokio::test]
async fn test_ingestion_is_idempotent() {
    let h = Harness::new(vec![Job::new("j1", "digest")]);
    let t0 = Utc::now();
    h.jobs.push_runs("j1", runs(t0 - Duration::hours(1), "r", 4));

    let first = h.sync(t0).await;
    let stored = RunStore::new(h.paths.runs_file()).all().unwrap();
    let second = h.sync(t0).await;

    assert_eq!(first.new_rows_ingested, 4);
    assert_eq!(second.new_rows_ingested, 0);
    assert_eq!(RunStore::new(h.paths.runs_file()).all().unwrap(), stored);
    assert_eq!(first.jobs, second.jobs);
    assert_eq!(first.window, second.window);
}

// ==================== Control Loop ====================

fn mismatching_fixture(t0: DateTime<Utc>) -> JobFixture {
    let mut aliases = BTreeMap::new();
    aliases.insert("fast".to_string(), "acme/fast-v2".to_string());
    let mut runs_by_job = BTreeMap::new();
    runs_by_job.insert(
        "j1".to_string(),
        runs(t0 - Duration::hours(1), "old", 3)
            .into_iter()
            .map(|e| with_model(e, "acme", "fast-v1"))
            .collect(),
    );
    JobFixture {
        jobs: vec![Job::new("j1", "digest").with_model("fast")],
        runs: runs_by_job,
        aliases,
    }
}

#[tokio::test]
async fn test_routing_experiment_promotes() {
    let t0 = Utc::now();
    let h = Harness::with_fixture(mismatching_fixture(t0));

    let summary = h.sync(t0).await;
    assert_eq!(summary.job("digest").unwrap().model_mismatch_runs, 3);

    assert_eq!(h.control(t0).await, CycleStatus::Activated);
    let active = &h.experiments()[0];
    assert_eq!(active.experiment_type, ExperimentType::Routing);
    assert_eq!(active.baseline.as_ref().unwrap().model_mismatch_runs, 3);
    assert_eq!(h.jobs.payload("j1").unwrap().model.as_deref(), Some("acme/fast-v2"));

    // a week later only post-change runs remain in the window
    let t1 = t0 + Duration::days(8);
    h.jobs.push_runs(
        "j1",
        runs(t1, "new", 5)
            .into_iter()
            .map(|e| with_model(e, "acme", "fast-v2"))
            .collect(),
    );
    let t2 = t1 + Duration::hours(1);
    let summary = h.sync(t2).await;
    assert_eq!(summary.job("digest").unwrap().model_mismatch_runs, 0);

    assert_eq!(h.control(t2).await, CycleStatus::Promoted);
    let promoted = &h.experiments()[0];
    assert_eq!(promoted.status, ExperimentStatus::Promoted);
    assert_eq!(promoted.result.as_ref().unwrap().decision, ExperimentStatus::Promoted);
    assert_eq!(h.jobs.payload("j1").unwrap().model.as_deref(), Some("acme/fast-v2"));
}

#[tokio::test]
async fn test_rollback_restores_exact_prior_config() {
    let t0 = Utc::now();
    let h = Harness::with_fixture(mismatching_fixture(t0));
    let before = h.jobs.payload("j1").unwrap();
    assert_eq!(
        before,
        JobPayload {
            model: Some("fast".to_string()),
            message: None,
        }
    );

    h.sync(t0).await;
    assert_eq!(h.control(t0).await, CycleStatus::Activated);
    assert_ne!(h.jobs.payload("j1").unwrap(), before);

    // the mismatch persists after the change
    h.jobs.push_runs(
        "j1",
        runs(t0 + Duration::minutes(10), "new", 2)
            .into_iter()
            .map(|e| with_model(e, "acme", "fast-v1"))
            .collect(),
    );
    let t1 = t0 + Duration::hours(1);
    h.sync(t1).await;

    assert_eq!(h.control(t1).await, CycleStatus::RolledBack);
    assert_eq!(h.jobs.payload("j1").unwrap(), before);
    assert_eq!(h.experiments()[0].status, ExperimentStatus::RolledBack);
}

#[tokio::test]
async fn test_cost_experiment_rolls_back_on_regression() {
    let t0 = Utc::now();
    let h = Harness::new(vec![Job::new("j1", "foundry-daily-build-candidate")
        .with_model("acme/big")
        .with_message("long prompt")]);
    let lean = h.paths.resolve(std::path::Path::new("config/prompts/foundry_lean.txt"));
    std::fs::create_dir_all(lean.parent().unwrap()).unwrap();
    std::fs::write(&lean, "lean prompt\n").unwrap();

    h.jobs.push_runs(
        "j1",
        runs(t0 - Duration::hours(1), "old", 5)
            .into_iter()
            .map(|e| with_tokens(e, 20000))
            .collect(),
    );
    h.sync(t0).await;
    let before = h.jobs.payload("j1").unwrap();

    assert_eq!(h.control(t0).await, CycleStatus::Activated);
    let active = &h.experiments()[0];
    assert_eq!(active.experiment_type, ExperimentType::Cost);
    assert_eq!(active.baseline.as_ref().unwrap().avg_tokens, 20000);
    assert_eq!(h.jobs.payload("j1").unwrap().message.as_deref(), Some("lean prompt"));

    let t1 = t0 + Duration::days(8);
    h.jobs.push_runs(
        "j1",
        runs(t1, "new", 7)
            .into_iter()
            .map(|e| with_tokens(e, 23000))
            .collect(),
    );
    let t2 = t1 + Duration::hours(1);
    let summary = h.sync(t2).await;
    assert_eq!(summary.job("foundry-daily-build-candidate").unwrap().avg_tokens, 23000);

    assert_eq!(h.control(t2).await, CycleStatus::RolledBack);
    assert_eq!(h.jobs.payload("j1").unwrap(), before);
    let result = h.experiments()[0].result.clone().unwrap();
    assert_eq!(result.reason, "Token usage regressed (20000 -> 23000).");
}

#[tokio::test]
async fn test_at_most_one_active_across_cycles() {
    let t0 = Utc::now();
    let h = Harness::new(vec![
        Job::new("j1", "a").with_model("fast"),
        Job::new("j2", "b").with_model("fast"),
    ]);
    for (job, prefix) in [("j1", "a"), ("j2", "b")] {
        h.jobs.push_runs(
            job,
            runs(t0 - Duration::hours(1), prefix, 4)
                .into_iter()
                .map(|e| with_model(e, "acme", "slow"))
                .collect(),
        );
    }
    h.sync(t0).await;
    assert_eq!(h.experiments().len(), 2);

    let mut statuses = Vec::new();
    for i in 0..6 {
        let now = t0 + Duration::minutes(i);
        statuses.push(h.control(now).await);
        let active = h.experiments().iter().filter(|e| e.is_active()).count();
        assert!(active <= 1);
    }
    assert_eq!(statuses[0], CycleStatus::Activated);
    // no new runs, so the active experiment keeps holding
    assert!(statuses[1..].iter().all(|s| *s == CycleStatus::Held));
}

#[tokio::test]
async fn test_failed_edit_commits_nothing() {
    let t0 = Utc::now();
    let fixture = mismatching_fixture(t0);
    let temp = TempDir::new().unwrap();
    let paths = WorkspacePaths::new(temp.path());
    let options = SyncOptions::from(&LoopConfig::default());

    let healthy = InMemoryJobControl::new(fixture.clone());
    run_sync(&healthy, &paths, &options, t0).await.unwrap();
    let backlog = ExperimentBacklog::new(paths.backlog_file());
    let before = std::fs::read(backlog.path()).unwrap();

    let broken = InMemoryJobControl::new(fixture).with_failing_edits();
    let summary = MetricSummary::load(&paths.summary_file()).unwrap();
    let controller = ExperimentController::from_config(&LoopConfig::default(), &paths, false);
    let result = controller
        .run_cycle(&broken, &backlog, summary.as_ref(), t0)
        .await;

    assert!(result.is_err());
    assert_eq!(std::fs::read(backlog.path()).unwrap(), before);
}

#[tokio::test]
async fn test_blocked_when_job_disappears() {
    let t0 = Utc::now();
    let h = Harness::with_fixture(mismatching_fixture(t0));
    h.sync(t0).await;
    h.jobs.remove_job("j1");

    assert_eq!(h.control(t0).await, CycleStatus::Blocked);
    let exp = &h.experiments()[0];
    assert_eq!(exp.status, ExperimentStatus::Blocked);
    assert_eq!(exp.blocked_reason.as_deref(), Some("job_not_found"));

    // resolved experiments still suppress re-proposal
    h.sync(t0).await;
    assert_eq!(h.experiments().len(), 1);
}
