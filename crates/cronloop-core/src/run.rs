//! Run records
//!
//! A [`RunRecord`] is one execution of one job, normalized from the
//! platform's raw run history so every downstream consumer sees the same
//! shape. Model mismatch is derived on read and never stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::job_control::{Job, RawRunEntry};

/// Delivery statuses that do not count as a delivery failure
const BENIGN_DELIVERY_STATUSES: [&str; 3] = ["delivered", "not-delivered", "unknown"];

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient mapping from the platform's status string
    pub fn from_raw(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or(Self::Unknown)
    }
}

impl FromStr for RunStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            _ => Err(crate::Error::Parse(format!("Invalid run status: {}", s))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One execution of one managed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Stable identity: `{jobId}:{scheduledAtMs}:{sessionId}`
    pub uid: String,
    pub job_id: String,
    #[serde(default)]
    pub job_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub scheduled_at_ms: i64,
    /// 0 when unknown
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    /// Model actually used, as `provider/model`
    #[serde(default)]
    pub actual_model_ref: String,
    /// Model the job was configured with, verbatim
    #[serde(default)]
    pub configured_model: String,
    /// `configured_model` after alias resolution
    #[serde(default)]
    pub configured_model_ref: String,
    #[serde(default)]
    pub token_total: u64,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default = "default_delivery_status")]
    pub delivery_status: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub error: String,
}

fn default_delivery_status() -> String {
    "unknown".to_string()
}

impl RunRecord {
    /// Normalize a raw platform entry for `job`
    pub fn from_raw(job: &Job, entry: &RawRunEntry, aliases: &BTreeMap<String, String>) -> Self {
        let scheduled_at_ms = entry.run_at_ms.unwrap_or(0);
        let session_id = entry.session_id.clone().unwrap_or_default();
        let provider = entry.provider.clone().unwrap_or_default();
        let model = entry.model.clone().unwrap_or_default();
        let configured_model = job.payload.model_or_empty().to_string();

        Self {
            uid: format!("{}:{}:{}", job.id, scheduled_at_ms, session_id),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status: RunStatus::from_raw(entry.status.as_deref()),
            scheduled_at_ms,
            duration_ms: entry
                .duration_ms
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d as u64)
                .unwrap_or(0),
            actual_model_ref: normalize_model_ref(&provider, &model),
            provider,
            model,
            configured_model_ref: resolve_alias(&configured_model, aliases),
            configured_model,
            token_total: entry.usage.as_ref().map(|u| u.total()).unwrap_or(0),
            delivered: entry.delivered.unwrap_or(false),
            delivery_status: entry
                .delivery_status
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(default_delivery_status),
            session_id,
            summary: entry.summary.clone().unwrap_or_default(),
            error: entry.error.clone().unwrap_or_default(),
        }
    }

    /// True iff both refs are known and differ
    pub fn model_mismatch(&self) -> bool {
        !self.configured_model_ref.is_empty()
            && !self.actual_model_ref.is_empty()
            && self.configured_model_ref != self.actual_model_ref
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    pub fn is_delivery_failure(&self) -> bool {
        !BENIGN_DELIVERY_STATUSES.contains(&self.delivery_status.as_str())
    }

    /// Grouping key for per-job metrics: name, falling back to id
    pub fn job_key(&self) -> &str {
        if self.job_name.is_empty() {
            &self.job_id
        } else {
            &self.job_name
        }
    }
}

/// Join provider and model into `provider/model` unless the model is
/// already qualified or the provider is unknown.
pub fn normalize_model_ref(provider: &str, model: &str) -> String {
    let provider = provider.trim();
    let model = model.trim();
    if provider.is_empty() || model.contains('/') {
        return model.to_string();
    }
    format!("{}/{}", provider, model)
}

pub fn resolve_alias(configured: &str, aliases: &BTreeMap<String, String>) -> String {
    aliases
        .get(configured)
        .cloned()
        .unwrap_or_else(|| configured.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::RawUsage;

    fn aliases() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("fast".to_string(), "acme/fast-1".to_string());
        map
    }

    #[test]
    fn test_normalize_model_ref() {
        assert_eq!(normalize_model_ref("acme", "fast-1"), "acme/fast-1");
        assert_eq!(normalize_model_ref(" acme ", "other/x"), "other/x");
        assert_eq!(normalize_model_ref("", "fast-1"), "fast-1");
        assert_eq!(normalize_model_ref("acme", ""), "acme/");
        assert_eq!(normalize_model_ref("", ""), "");
    }

    #[test]
    fn test_run_status_parsing() {
        assert_eq!(RunStatus::from_raw(Some("ok")), RunStatus::Ok);
        assert_eq!(RunStatus::from_raw(Some("ERROR")), RunStatus::Error);
        assert_eq!(RunStatus::from_raw(Some("skipped")), RunStatus::Unknown);
        assert_eq!(RunStatus::from_raw(None), RunStatus::Unknown);
        assert!("nope".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_unknown_status_deserializes() {
        let status: RunStatus = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(status, RunStatus::Unknown);
    }

    #[test]
    fn test_from_raw_resolves_alias_and_builds_uid() {
        let job = Job::new("j1", "digest").with_model("fast");
        let entry = RawRunEntry {
            run_at_ms: Some(1000),
            session_id: Some("s9".to_string()),
            status: Some("ok".to_string()),
            duration_ms: Some(2500.7),
            provider: Some("acme".to_string()),
            model: Some("fast-1".to_string()),
            usage: Some(RawUsage {
                total_tokens: Some(321),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = RunRecord::from_raw(&job, &entry, &aliases());

        assert_eq!(record.uid, "j1:1000:s9");
        assert_eq!(record.configured_model, "fast");
        assert_eq!(record.configured_model_ref, "acme/fast-1");
        assert_eq!(record.actual_model_ref, "acme/fast-1");
        assert_eq!(record.duration_ms, 2500);
        assert_eq!(record.token_total, 321);
        assert_eq!(record.delivery_status, "unknown");
        assert!(!record.model_mismatch());
        assert!(record.is_ok());
    }

    #[test]
    fn test_model_mismatch_requires_both_refs() {
        let job = Job::new("j1", "digest").with_model("acme/big");
        let mut entry = RawRunEntry {
            provider: Some("acme".to_string()),
            model: Some("small".to_string()),
            ..Default::default()
        };
        assert!(RunRecord::from_raw(&job, &entry, &BTreeMap::new()).model_mismatch());

        entry.model = None;
        entry.provider = None;
        assert!(!RunRecord::from_raw(&job, &entry, &BTreeMap::new()).model_mismatch());

        let unconfigured = Job::new("j2", "bare");
        entry.model = Some("acme/small".to_string());
        assert!(!RunRecord::from_raw(&unconfigured, &entry, &BTreeMap::new()).model_mismatch());
    }

    #[test]
    fn test_delivery_failure_classification() {
        let job = Job::new("j1", "");
        let mut entry = RawRunEntry::default();
        for (status, failed) in [
            ("delivered", false),
            ("not-delivered", false),
            ("unknown", false),
            ("failed", true),
            ("bounced", true),
        ] {
            entry.delivery_status = Some(status.to_string());
            let record = RunRecord::from_raw(&job, &entry, &BTreeMap::new());
            assert_eq!(record.is_delivery_failure(), failed, "status {}", status);
        }
    }

    #[test]
    fn test_job_key_falls_back_to_id() {
        let record = RunRecord::from_raw(&Job::new("j1", ""), &RawRunEntry::default(), &BTreeMap::new());
        assert_eq!(record.job_key(), "j1");
        let named = RunRecord::from_raw(&Job::new("j1", "digest"), &RawRunEntry::default(), &BTreeMap::new());
        assert_eq!(named.job_key(), "digest");
    }
}
