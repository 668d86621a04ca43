//! Markdown reports
//!
//! Write-only human summaries of a sync cycle and of a control-loop
//! invocation. Nothing reads these back.

use chrono::{DateTime, Utc};
use std::path::Path;

use crate::controller::ControlOutcome;
use crate::metrics::MetricSummary;
use crate::persistence::atomic_write;
use crate::Result;

/// Jobs listed in the sync report
const REPORT_JOB_LIMIT: usize = 10;

fn percent(rate: f64) -> String {
    format!("{:.0}%", rate * 100.0)
}

fn seconds(ms: u64) -> String {
    format!("{:.1}s", ms as f64 / 1000.0)
}

/// Render the sync report for a metric summary
pub fn render_sync_report(summary: &MetricSummary) -> String {
    let mut md = String::new();
    let window = &summary.window;

    md.push_str("# Self-Improvement Report\n\n");
    md.push_str(&format!("- Generated: {}\n", summary.generated_at.to_rfc3339()));
    md.push_str(&format!("- Profile: {}\n", summary.profile));
    md.push_str(&format!("- Window: last {} days\n\n", summary.window_days));

    md.push_str("## Snapshot\n\n");
    md.push_str(&format!("- Runs: {}\n", window.runs));
    md.push_str(&format!("- Success rate: {}\n", percent(window.success_rate)));
    md.push_str(&format!("- Avg duration: {}\n", seconds(window.avg_duration_ms)));
    md.push_str(&format!("- P95 duration: {}\n", seconds(window.p95_duration_ms)));
    md.push_str(&format!("- Avg tokens: {}\n", window.avg_tokens));
    md.push_str(&format!("- Total tokens: {}\n", window.total_tokens));
    md.push_str(&format!("- Model mismatches: {}\n", window.model_mismatch_runs));
    md.push_str(&format!("- Delivery failures: {}\n\n", window.delivery_failures));

    md.push_str("## Job Metrics\n\n");
    if summary.jobs.is_empty() {
        md.push_str("- No runs in this window.\n");
    }
    for job in summary.jobs.iter().take(REPORT_JOB_LIMIT) {
        let configured = if job.configured_model.is_empty() {
            "-"
        } else {
            job.configured_model.as_str()
        };
        md.push_str(&format!(
            "- `{}` runs={} success={} avgDuration={} avgTokens={} configured={} actual={}\n",
            job.job,
            job.runs,
            percent(job.success_rate),
            seconds(job.avg_duration_ms),
            job.avg_tokens,
            configured,
            job.top_actual_model
        ));
    }
    md.push('\n');

    md.push_str("## Top Experiments\n\n");
    if summary.recommendations.is_empty() {
        md.push_str("- No urgent optimization experiments detected in this window.\n");
    }
    for (idx, rec) in summary.recommendations.iter().enumerate() {
        md.push_str(&format!(
            "{}. [{}] `{}` {}\n",
            idx + 1,
            rec.priority.as_str().to_uppercase(),
            rec.job,
            rec.experiment_type
        ));
        md.push_str(&format!("   - Issue: {}\n", rec.issue));
        md.push_str(&format!("   - Change: {}\n", rec.change));
        md.push_str(&format!("   - Target: {}\n", rec.target_metric));
    }
    md.push('\n');

    md.push_str("## One-Line Focus\n\n");
    match summary.recommendations.first() {
        Some(top) => md.push_str(&format!("Run experiment: {} -> {}\n", top.job, top.change)),
        None => md.push_str("Keep current configuration and collect more runs for signal.\n"),
    }

    md
}

/// Render the control-loop report
pub fn render_control_report(
    outcome: &ControlOutcome,
    generated_at: DateTime<Utc>,
    dry_run: bool,
) -> String {
    let mut md = String::new();
    md.push_str("# Auto-Promotion Report\n\n");
    md.push_str(&format!("- Generated: {}\n", generated_at.to_rfc3339()));
    md.push_str(&format!("- Dry run: {}\n", if dry_run { "yes" } else { "no" }));
    md.push_str(&format!("- Status: {}\n\n", outcome.status));

    md.push_str("## Actions\n\n");
    if outcome.actions.is_empty() {
        md.push_str("- No changes.\n");
    }
    for line in &outcome.actions {
        md.push_str(&format!("- {}\n", line));
    }
    md
}

pub fn write_report(path: &Path, markdown: &str) -> Result<()> {
    atomic_write(path, markdown.as_bytes())
}
