//! Recommendation engine
//!
//! Derives single-dimension improvement proposals from per-job metrics.
//! Rules, in evaluation order (only for jobs with `runs >= min_sample`):
//!
//! 1. any model mismatch        -> routing, high
//! 2. success rate below 0.90   -> reliability, high
//! 3. mean duration over 240s   -> latency, medium
//! 4. mean tokens over 15000    -> cost, medium

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::experiment::{Experiment, ExperimentType, Priority};
use crate::metrics::JobMetricSnapshot;

pub const RELIABILITY_THRESHOLD: f64 = 0.90;
pub const LATENCY_THRESHOLD_MS: u64 = 240_000;
pub const COST_THRESHOLD_TOKENS: u64 = 15_000;
pub const MAX_RECOMMENDATIONS: usize = 6;

/// Backlog deduplication key: (job, type, change text)
pub type RecommendationKey = (String, ExperimentType, String);

/// A proposed improvement for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub priority: Priority,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub job: String,
    pub issue: String,
    pub change: String,
    pub target_metric: String,
}

impl Recommendation {
    pub fn key(&self) -> RecommendationKey {
        (self.job.clone(), self.experiment_type.clone(), self.change.clone())
    }

    fn routing(job: &str) -> Self {
        Self {
            priority: Priority::High,
            experiment_type: ExperimentType::Routing,
            job: job.to_string(),
            issue: "Configured model does not match runtime model consistently.".to_string(),
            change: "Pin payload.model to explicit provider/model and verify provider health."
                .to_string(),
            target_metric: "modelMismatchRuns=0 over next 5 runs".to_string(),
        }
    }

    fn reliability(job: &str, success_rate: f64) -> Self {
        Self {
            priority: Priority::High,
            experiment_type: ExperimentType::Reliability,
            job: job.to_string(),
            issue: format!("Success rate is {:.0}%.", success_rate * 100.0),
            change: "Shorten prompt scope and add deterministic pre-check steps.".to_string(),
            target_metric: "successRate>=95% over next 10 runs".to_string(),
        }
    }

    fn latency(job: &str, avg_duration_ms: u64) -> Self {
        Self {
            priority: Priority::Medium,
            experiment_type: ExperimentType::Latency,
            job: job.to_string(),
            issue: format!("Average duration is {:.0}s.", avg_duration_ms as f64 / 1000.0),
            change: "Reduce injected context and split long jobs into 2 stages.".to_string(),
            target_metric: "avgDurationMs reduced by 30%".to_string(),
        }
    }

    fn cost(job: &str, avg_tokens: u64) -> Self {
        Self {
            priority: Priority::Medium,
            experiment_type: ExperimentType::Cost,
            job: job.to_string(),
            issue: format!("Average tokens per run is {}.", avg_tokens),
            change: "Trim system context for this lane and add explicit output length caps."
                .to_string(),
            target_metric: "avgTokens reduced by 20%".to_string(),
        }
    }
}

/// Rule-table recommendation generator
#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    min_sample: u64,
}

impl RecommendationEngine {
    pub fn new(min_sample: u64) -> Self {
        Self { min_sample }
    }

    /// Every triggered recommendation, sorted by (priority, job, type) and
    /// capped. This is the list published in the metric summary.
    pub fn generate(&self, metrics: &[JobMetricSnapshot]) -> Vec<Recommendation> {
        let mut recs: Vec<Recommendation> = metrics
            .iter()
            .filter(|m| m.runs >= self.min_sample)
            .flat_map(Self::rules_for)
            .collect();

        recs.sort_by(|a, b| {
            (a.priority.rank(), &a.job, a.experiment_type.as_str()).cmp(&(
                b.priority.rank(),
                &b.job,
                b.experiment_type.as_str(),
            ))
        });
        recs.truncate(MAX_RECOMMENDATIONS);
        recs
    }

    /// The capped list minus anything whose key is already known
    pub fn recommend(
        &self,
        metrics: &[JobMetricSnapshot],
        existing: &HashSet<RecommendationKey>,
    ) -> Vec<Recommendation> {
        Self::suppress_known(self.generate(metrics), existing)
    }

    /// Drop recommendations already present in the backlog, and duplicates
    /// within `recs` itself
    pub fn suppress_known(
        recs: Vec<Recommendation>,
        existing: &HashSet<RecommendationKey>,
    ) -> Vec<Recommendation> {
        let mut seen = existing.clone();
        recs.into_iter().filter(|r| seen.insert(r.key())).collect()
    }

    fn rules_for(metric: &JobMetricSnapshot) -> Vec<Recommendation> {
        let mut recs = Vec::new();
        if metric.model_mismatch_runs > 0 {
            recs.push(Recommendation::routing(&metric.job));
        }
        if metric.success_rate < RELIABILITY_THRESHOLD {
            recs.push(Recommendation::reliability(&metric.job, metric.success_rate));
        }
        if metric.avg_duration_ms > LATENCY_THRESHOLD_MS {
            recs.push(Recommendation::latency(&metric.job, metric.avg_duration_ms));
        }
        if metric.avg_tokens > COST_THRESHOLD_TOKENS {
            recs.push(Recommendation::cost(&metric.job, metric.avg_tokens));
        }
        recs
    }
}

/// Keys of every experiment in the backlog, regardless of status
pub fn backlog_keys(experiments: &[Experiment]) -> HashSet<RecommendationKey> {
    experiments.iter().map(|e| e.key()).collect()
}
