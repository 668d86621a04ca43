//! Metrics aggregation
//!
//! Turns a window of [`RunRecord`]s into a fleet-wide [`FleetSnapshot`] and
//! one [`JobMetricSnapshot`] per job.
//!
//! Precision contract: rates are rounded to 3 decimals and averages are
//! integer means truncated toward zero. Consumers (the experiment
//! controller included) only ever see these rounded values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::persistence::{read_json, write_json_pretty};
use crate::recommendation::Recommendation;
use crate::run::RunRecord;
use crate::Result;

/// Model key used when a run did not report its model
pub const UNKNOWN_MODEL: &str = "unknown";

/// Aggregate metrics of one job over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetricSnapshot {
    pub job: String,
    pub runs: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub avg_tokens: u64,
    pub model_mismatch_runs: u64,
    pub delivery_failures: u64,
    /// Alias-resolved configured model of the most recent run
    #[serde(default)]
    pub configured_model: String,
    /// Most frequently used actual model
    #[serde(default)]
    pub top_actual_model: String,
    #[serde(default)]
    pub actual_model_counts: BTreeMap<String, u64>,
}

impl JobMetricSnapshot {
    /// Snapshot of a job with no runs in the window
    pub fn empty(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            runs: 0,
            success_rate: 1.0,
            avg_duration_ms: 0,
            avg_tokens: 0,
            model_mismatch_runs: 0,
            delivery_failures: 0,
            configured_model: String::new(),
            top_actual_model: String::new(),
            actual_model_counts: BTreeMap::new(),
        }
    }
}

/// Fleet-wide metrics over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub runs: u64,
    pub success: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub avg_tokens: u64,
    pub total_tokens: u64,
    pub model_mismatch_runs: u64,
    pub delivery_failures: u64,
}

impl Default for FleetSnapshot {
    fn default() -> Self {
        Self {
            runs: 0,
            success: 0,
            errors: 0,
            success_rate: 1.0,
            avg_duration_ms: 0,
            p95_duration_ms: 0,
            avg_tokens: 0,
            total_tokens: 0,
            model_mismatch_runs: 0,
            delivery_failures: 0,
        }
    }
}

/// Output of one aggregation pass
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub fleet: FleetSnapshot,
    /// Sorted by run count, descending; ties keep first-seen order
    pub jobs: Vec<JobMetricSnapshot>,
}

/// Running totals for one job partition
#[derive(Debug, Default)]
struct JobAccumulator {
    runs: u64,
    ok: u64,
    durations: Vec<u64>,
    tokens: Vec<u64>,
    mismatches: u64,
    delivery_failures: u64,
    configured_model: String,
    latest_at_ms: Option<i64>,
    // insertion-ordered so the argmax is stable
    model_counts: Vec<(String, u64)>,
}

impl JobAccumulator {
    fn add(&mut self, record: &RunRecord) {
        self.runs += 1;
        if record.is_ok() {
            self.ok += 1;
        }
        if record.duration_ms > 0 {
            self.durations.push(record.duration_ms);
        }
        if record.token_total > 0 {
            self.tokens.push(record.token_total);
        }
        if record.model_mismatch() {
            self.mismatches += 1;
        }
        if record.is_delivery_failure() {
            self.delivery_failures += 1;
        }
        if self.latest_at_ms.map_or(true, |at| record.scheduled_at_ms > at) {
            self.latest_at_ms = Some(record.scheduled_at_ms);
            self.configured_model = record.configured_model_ref.clone();
        }

        let model = if record.actual_model_ref.is_empty() {
            UNKNOWN_MODEL
        } else {
            record.actual_model_ref.as_str()
        };
        match self.model_counts.iter_mut().find(|(m, _)| m == model) {
            Some((_, count)) => *count += 1,
            None => self.model_counts.push((model.to_string(), 1)),
        }
    }

    fn into_snapshot(self, job: String) -> JobMetricSnapshot {
        let top_actual_model = stable_argmax(&self.model_counts)
            .map(str::to_string)
            .unwrap_or_default();

        JobMetricSnapshot {
            job,
            runs: self.runs,
            success_rate: rate(self.ok, self.runs),
            avg_duration_ms: truncated_mean(&self.durations),
            avg_tokens: truncated_mean(&self.tokens),
            model_mismatch_runs: self.mismatches,
            delivery_failures: self.delivery_failures,
            configured_model: self.configured_model,
            top_actual_model,
            actual_model_counts: self.model_counts.into_iter().collect(),
        }
    }
}

/// Windowed metrics calculator
pub struct MetricsAggregator;

impl MetricsAggregator {
    /// Aggregate a window of runs into fleet and per-job snapshots
    pub fn aggregate(records: &[RunRecord]) -> Aggregate {
        Aggregate {
            fleet: Self::fleet_snapshot(records),
            jobs: Self::job_snapshots(records),
        }
    }

    pub fn fleet_snapshot(records: &[RunRecord]) -> FleetSnapshot {
        let runs = records.len() as u64;
        let success = records.iter().filter(|r| r.is_ok()).count() as u64;

        let mut durations: Vec<u64> = records
            .iter()
            .map(|r| r.duration_ms)
            .filter(|d| *d > 0)
            .collect();
        durations.sort_unstable();

        let tokens: Vec<u64> = records
            .iter()
            .map(|r| r.token_total)
            .filter(|t| *t > 0)
            .collect();

        FleetSnapshot {
            runs,
            success,
            errors: runs - success,
            success_rate: rate(success, runs),
            avg_duration_ms: truncated_mean(&durations),
            p95_duration_ms: nearest_rank_percentile(&durations, 0.95),
            avg_tokens: truncated_mean(&tokens),
            total_tokens: tokens.iter().sum(),
            model_mismatch_runs: records.iter().filter(|r| r.model_mismatch()).count() as u64,
            delivery_failures: records.iter().filter(|r| r.is_delivery_failure()).count() as u64,
        }
    }

    pub fn job_snapshots(records: &[RunRecord]) -> Vec<JobMetricSnapshot> {
        let mut order: Vec<String> = Vec::new();
        let mut partitions: HashMap<String, JobAccumulator> = HashMap::new();

        for record in records {
            let key = record.job_key();
            if !partitions.contains_key(key) {
                order.push(key.to_string());
            }
            partitions.entry(key.to_string()).or_default().add(record);
        }

        let mut snapshots: Vec<JobMetricSnapshot> = order
            .into_iter()
            .filter_map(|job| {
                partitions
                    .remove(&job)
                    .map(|acc| acc.into_snapshot(job))
            })
            .collect();

        // stable: equal run counts keep first-seen order
        snapshots.sort_by(|a, b| b.runs.cmp(&a.runs));
        snapshots
    }
}

/// Round to the 3-decimal precision used in persisted summaries
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// `numerator / denominator` rounded to 3 decimals; an empty window is 1.0
fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 1.0;
    }
    round3(numerator as f64 / denominator as f64)
}

fn truncated_mean(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

/// Nearest-rank percentile over an ascending slice:
/// index = ceil(p * n) - 1, clamped to [0, n - 1]
pub fn nearest_rank_percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    sorted[idx]
}

/// Key with the highest count; the first one encountered wins ties
fn stable_argmax(counts: &[(String, u64)]) -> Option<&str> {
    let mut best: Option<&(String, u64)> = None;
    for entry in counts {
        if best.map_or(true, |b| entry.1 > b.1) {
            best = Some(entry);
        }
    }
    best.map(|(model, _)| model.as_str())
}

/// Persisted result of a sync cycle, fully overwritten each time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub window_days: u32,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub new_rows_ingested: usize,
    pub window: FleetSnapshot,
    #[serde(default)]
    pub jobs: Vec<JobMetricSnapshot>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl MetricSummary {
    /// Latest snapshot for a job, by job key
    pub fn job(&self, name: &str) -> Option<&JobMetricSnapshot> {
        self.jobs.iter().find(|j| j.job == name)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_pretty(path, self)
    }
}
