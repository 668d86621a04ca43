//! Job-control abstraction
//!
//! The scheduling platform that owns the jobs is an external collaborator.
//! Everything the loop needs from it goes through [`JobControl`]: list jobs,
//! edit a job's payload, list a job's recent runs, and read the model alias
//! table used to resolve configured models.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::persistence::write_json_pretty;
use crate::{Error, Result};

/// Trait that every job-control backend implements
#[async_trait]
pub trait JobControl: Send + Sync {
    /// List every managed job, enabled or not
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Change a job's payload. Only fields set on `edit` are touched.
    async fn edit_job(&self, job_id: &str, edit: &JobEdit) -> Result<()>;

    /// Most recent runs of a job, at most `limit`
    async fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RawRunEntry>>;

    /// Model alias table (alias -> provider/model)
    async fn model_aliases(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// A scheduled job as reported by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub payload: JobPayload,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload: JobPayload::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.payload.model = Some(model.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.payload.message = Some(message.into());
        self
    }
}

/// The mutable part of a job's configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobPayload {
    pub fn model_or_empty(&self) -> &str {
        self.model.as_deref().unwrap_or("")
    }

    pub fn message_or_empty(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}

/// A payload edit. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobEdit {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            model: None,
            message: Some(message.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.message.is_none()
    }
}

/// Token usage block attached to a raw run entry
///
/// Fields are read leniently: a value of the wrong shape reads as absent
/// instead of failing the whole run list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawUsage {
    #[serde(deserialize_with = "lenient::integer", skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(deserialize_with = "lenient::integer", skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(deserialize_with = "lenient::count", skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(deserialize_with = "lenient::count", skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(deserialize_with = "lenient::count", skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(deserialize_with = "lenient::count", skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(
        rename = "cacheRead",
        deserialize_with = "lenient::count",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_read: Option<u64>,
}

impl RawUsage {
    /// Total tokens, preferring an explicit total over summed parts
    pub fn total(&self) -> u64 {
        if let Some(total) = self.total_tokens.or(self.total) {
            return total;
        }
        let input = self.input_tokens.or(self.input).unwrap_or(0);
        let output = self.output_tokens.or(self.output).unwrap_or(0);
        input + output + self.cache_read.unwrap_or(0)
    }
}

/// One run history entry in the platform's raw, pre-normalization form.
///
/// A single malformed field must not reject the entry, so every field goes
/// through a [`lenient`] reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRunEntry {
    #[serde(deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub run_at_ms: Option<i64>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient::usage", skip_serializing_if = "Option::is_none")]
    pub usage: Option<RawUsage>,
    #[serde(deserialize_with = "lenient::truthy", skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<String>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Forgiving field readers for platform output
mod lenient {
    use super::RawUsage;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn value<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
        Option::<Value>::deserialize(d)
    }

    fn non_negative(n: &serde_json::Number) -> Option<u64> {
        n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
    }

    /// Whole non-negative integers only; anything else is absent
    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(value(d)?.and_then(|v| v.as_u64()))
    }

    /// Non-negative numbers (truncated) or numeric strings
    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(value(d)?.and_then(|v| match v {
            Value::Number(n) => non_negative(&n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }))
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(value(d)?.and_then(|v| match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }))
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(value(d)?.and_then(|v| v.as_f64()))
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(value(d)?.and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }))
    }

    /// Truthiness: non-zero numbers and non-empty strings count as true
    pub fn truthy<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(value(d)?.map(|v| match v {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
        }))
    }

    pub fn usage<'de, D: Deserializer<'de>>(d: D) -> Result<Option<RawUsage>, D::Error> {
        Ok(value(d)?.and_then(|v| serde_json::from_value(v).ok()))
    }
}

/// Serializable state of an [`InMemoryJobControl`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFixture {
    pub jobs: Vec<Job>,
    /// Runs per job id, oldest first
    pub runs: BTreeMap<String, Vec<RawRunEntry>>,
    pub aliases: BTreeMap<String, String>,
}

/// Job-control backend held in memory, optionally mirrored to a JSON file.
///
/// Used by tests and by the CLI's `--jobs-file` mode. Every successful edit is
/// recorded and, when file-backed, written back atomically.
#[derive(Debug, Default)]
pub struct InMemoryJobControl {
    state: Mutex<JobFixture>,
    edits: Mutex<Vec<(String, JobEdit)>>,
    fail_edits: bool,
    backing_file: Option<PathBuf>,
}

impl InMemoryJobControl {
    pub fn new(fixture: JobFixture) -> Self {
        Self {
            state: Mutex::new(fixture),
            ..Default::default()
        }
    }

    /// Load from a JSON fixture file; edits are persisted back to it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            Error::Config(format!("Failed to read jobs file {}: {}", path.display(), e))
        })?;
        let fixture: JobFixture = serde_json::from_slice(&content)?;
        Ok(Self {
            state: Mutex::new(fixture),
            backing_file: Some(path.to_path_buf()),
            ..Default::default()
        })
    }

    /// Make every `edit_job` call fail, to exercise abort paths
    pub fn with_failing_edits(mut self) -> Self {
        self.fail_edits = true;
        self
    }

    pub fn add_job(&self, job: Job) {
        self.state().jobs.push(job);
    }

    pub fn remove_job(&self, job_id: &str) {
        self.state().jobs.retain(|j| j.id != job_id);
    }

    pub fn push_runs(&self, job_id: &str, entries: Vec<RawRunEntry>) {
        self.state()
            .runs
            .entry(job_id.to_string())
            .or_default()
            .extend(entries);
    }

    pub fn set_alias(&self, alias: impl Into<String>, target: impl Into<String>) {
        self.state().aliases.insert(alias.into(), target.into());
    }

    /// Current payload of a job, if it exists
    pub fn payload(&self, job_id: &str) -> Option<JobPayload> {
        self.state()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.payload.clone())
    }

    /// Every edit applied so far, in call order
    pub fn edits(&self) -> Vec<(String, JobEdit)> {
        self.edits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fixture(&self) -> JobFixture {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, JobFixture> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobControl for InMemoryJobControl {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.state().jobs.clone())
    }

    async fn edit_job(&self, job_id: &str, edit: &JobEdit) -> Result<()> {
        if self.fail_edits {
            return Err(Error::ExternalCommand {
                command: format!("edit {}", job_id),
                message: "edits are disabled for this backend".to_string(),
            });
        }

        let snapshot = {
            let mut state = self.state();
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
            if let Some(model) = &edit.model {
                job.payload.model = Some(model.clone());
            }
            if let Some(message) = &edit.message {
                job.payload.message = Some(message.clone());
            }
            state.clone()
        };

        self.edits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_id.to_string(), edit.clone()));

        if let Some(path) = &self.backing_file {
            debug!(path = %path.display(), job_id, "Persisting job edit");
            write_json_pretty(path, &snapshot)?;
        }
        Ok(())
    }

    async fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RawRunEntry>> {
        let state = self.state();
        let runs = state.runs.get(job_id).cloned().unwrap_or_default();
        let skip = runs.len().saturating_sub(limit);
        Ok(runs.into_iter().skip(skip).collect())
    }

    async fn model_aliases(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.state().aliases.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(run_at_ms: i64) -> RawRunEntry {
        RawRunEntry {
            run_at_ms: Some(run_at_ms),
            status: Some("ok".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_usage_total_prefers_explicit_total() {
        let usage = RawUsage {
            total_tokens: Some(500),
            input_tokens: Some(1),
            ..Default::default()
        };
        assert_eq!(usage.total(), 500);

        let usage = RawUsage {
            total: Some(42),
            ..Default::default()
        };
        assert_eq!(usage.total(), 42);
    }

    #[test]
    fn test_usage_total_sums_parts() {
        let usage = RawUsage {
            input: Some(100),
            output_tokens: Some(50),
            cache_read: Some(7),
            ..Default::default()
        };
        assert_eq!(usage.total(), 157);
        assert_eq!(RawUsage::default().total(), 0);
    }

    #[test]
    fn test_raw_entry_tolerates_odd_values() {
        let entry: RawRunEntry = serde_json::from_str(
            r#"{"runAtMs": 1700000000000.0, "sessionId": 17, "status": "ok",
                "durationMs": "slow", "delivered": "yes", "deliveryStatus": null,
                "usage": {"total_tokens": 1234.0, "input_tokens": "100",
                          "output_tokens": 50.9, "cacheRead": -3}}"#,
        )
        .unwrap();
        assert_eq!(entry.run_at_ms, Some(1_700_000_000_000));
        assert_eq!(entry.session_id.as_deref(), Some("17"));
        assert_eq!(entry.duration_ms, None);
        assert_eq!(entry.delivered, Some(true));
        assert_eq!(entry.delivery_status, None);

        // a fractional total is not trusted; parts are summed instead
        let usage = entry.usage.unwrap();
        assert_eq!(usage.total_tokens, None);
        assert_eq!(usage.cache_read, None);
        assert_eq!(usage.total(), 150);

        let entry: RawRunEntry =
            serde_json::from_str(r#"{"usage": "n/a", "delivered": 0, "model": ["x"]}"#).unwrap();
        assert_eq!(entry.usage, None);
        assert_eq!(entry.delivered, Some(false));
        assert_eq!(entry.model, None);
    }

    #[test]
    fn test_run_list_survives_one_bad_entry() {
        let fixture: JobFixture = serde_json::from_str(
            r#"{"jobs": [{"id": "j1", "name": "digest"}],
                "runs": {"j1": [
                    {"runAtMs": 1, "status": "ok", "usage": {"total_tokens": 10}},
                    {"runAtMs": 2, "status": "ok", "usage": {"total_tokens": 1234.0}}
                ]}}"#,
        )
        .unwrap();
        let runs = &fixture.runs["j1"];
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].usage.as_ref().unwrap().total(), 10);
        assert_eq!(runs[1].usage.as_ref().unwrap().total(), 0);
    }

    #[test]
    fn test_raw_entry_parses_platform_json() {
        let json = r#"{
            "runAtMs": 1700000000000,
            "sessionId": "s1",
            "status": "error",
            "durationMs": 1234.0,
            "provider": "acme",
            "model": "fast",
            "usage": {"input_tokens": 10, "output_tokens": 5, "cacheRead": 1},
            "delivered": false,
            "deliveryStatus": "failed",
            "error": "boom",
            "someNewField": true
        }"#;
        let entry: RawRunEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.run_at_ms, Some(1_700_000_000_000));
        assert_eq!(entry.status.as_deref(), Some("error"));
        assert_eq!(entry.usage.unwrap().total(), 16);
        assert_eq!(entry.delivery_status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_in_memory_edit_updates_only_given_fields() {
        let control = InMemoryJobControl::new(JobFixture::default());
        control.add_job(Job::new("j1", "digest").with_model("a/m0").with_message("hello"));

        control.edit_job("j1", &JobEdit::model("a/m1")).await.unwrap();

        let payload = control.payload("j1").unwrap();
        assert_eq!(payload.model.as_deref(), Some("a/m1"));
        assert_eq!(payload.message.as_deref(), Some("hello"));
        assert_eq!(control.edits().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_edit_unknown_job() {
        let control = InMemoryJobControl::new(JobFixture::default());
        let err = control.edit_job("ghost", &JobEdit::model("x")).await;
        assert!(matches!(err, Err(Error::JobNotFound(_))));
        assert!(control.edits().is_empty());
    }

    #[tokio::test]
    async fn test_failing_edits() {
        let control = InMemoryJobControl::new(JobFixture::default()).with_failing_edits();
        control.add_job(Job::new("j1", "digest"));
        let err = control.edit_job("j1", &JobEdit::model("x")).await;
        assert!(matches!(err, Err(Error::ExternalCommand { .. })));
        assert_eq!(control.payload("j1").unwrap().model, None);
    }

    #[tokio::test]
    async fn test_list_runs_returns_most_recent() {
        let control = InMemoryJobControl::new(JobFixture::default());
        control.push_runs("j1", (1..=5).map(entry).collect());

        let runs = control.list_runs("j1", 2).await.unwrap();
        let stamps: Vec<i64> = runs.iter().filter_map(|r| r.run_at_ms).collect();
        assert_eq!(stamps, vec![4, 5]);
        assert!(control.list_runs("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_edit_is_persisted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jobs.json");
        let fixture = JobFixture {
            jobs: vec![Job::new("j1", "digest").with_model("a/m0")],
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_vec(&fixture).unwrap()).unwrap();

        let control = InMemoryJobControl::from_file(&path).unwrap();
        control.edit_job("j1", &JobEdit::model("a/m1")).await.unwrap();

        let reloaded = InMemoryJobControl::from_file(&path).unwrap();
        assert_eq!(
            reloaded.payload("j1").unwrap().model.as_deref(),
            Some("a/m1")
        );
    }

    #[test]
    fn test_from_missing_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let result = InMemoryJobControl::from_file(temp.path().join("missing.json"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
