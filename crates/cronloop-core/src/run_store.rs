//! Run store
//!
//! Append-only, deduplicated log of [`RunRecord`]s. One record per line;
//! ingestion is idempotent on `uid` and there is no deletion API.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::persistence::{append_json_lines, read_json_lines};
use crate::run::RunRecord;
use crate::Result;

/// Line-log backed store of run records
#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every record whose uid is not stored yet, preserving arrival
    /// order. Returns the number of records inserted.
    pub fn ingest(&self, records: &[RunRecord]) -> Result<usize> {
        let mut seen: HashSet<String> = self.all()?.into_iter().map(|r| r.uid).collect();

        let fresh: Vec<&RunRecord> = records
            .iter()
            .filter(|r| seen.insert(r.uid.clone()))
            .collect();

        append_json_lines(&self.path, &fresh)?;

        let skipped = records.len() - fresh.len();
        if skipped > 0 {
            debug!(skipped, "Dropped already-stored runs");
        }
        info!(inserted = fresh.len(), "Ingested runs");
        Ok(fresh.len())
    }

    /// Every stored record, in insertion order. Corrupt lines are skipped.
    pub fn all(&self) -> Result<Vec<RunRecord>> {
        Ok(read_json_lines(&self.path)?.records)
    }

    /// Records scheduled at or after `cutoff_ms`
    pub fn window(&self, cutoff_ms: i64) -> Result<Vec<RunRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.scheduled_at_ms >= cutoff_ms)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::{Job, RawRunEntry};
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(job: &str, at: i64) -> RunRecord {
        let entry = RawRunEntry {
            run_at_ms: Some(at),
            session_id: Some(format!("s{}", at)),
            status: Some("ok".to_string()),
            ..Default::default()
        };
        RunRecord::from_raw(&Job::new(job, job), &entry, &BTreeMap::new())
    }

    fn store() -> (TempDir, RunStore) {
        let temp = TempDir::new().unwrap();
        let store = RunStore::new(temp.path().join("metrics").join("runs.jsonl"));
        (temp, store)
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (_temp, store) = store();
        let batch = vec![record("a", 1), record("a", 2), record("b", 3)];

        assert_eq!(store.ingest(&batch).unwrap(), 3);
        let first = std::fs::read_to_string(store.path()).unwrap();

        assert_eq!(store.ingest(&batch).unwrap(), 0);
        let second = std::fs::read_to_string(store.path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.all().unwrap().len(), 3);
    }

    #[test]
    fn test_ingest_dedups_within_batch_and_keeps_order() {
        let (_temp, store) = store();
        store.ingest(&[record("a", 1)]).unwrap();

        let inserted = store
            .ingest(&[record("a", 5), record("a", 1), record("a", 4), record("a", 5)])
            .unwrap();

        assert_eq!(inserted, 2);
        let stamps: Vec<i64> = store.all().unwrap().iter().map(|r| r.scheduled_at_ms).collect();
        assert_eq!(stamps, vec![1, 5, 4]);
    }

    #[test]
    fn test_window_filters_by_schedule_time() {
        let (_temp, store) = store();
        store
            .ingest(&[record("a", 100), record("a", 200), record("a", 300)])
            .unwrap();

        let window = store.window(200).unwrap();
        let stamps: Vec<i64> = window.iter().map(|r| r.scheduled_at_ms).collect();
        assert_eq!(stamps, vec![200, 300]);
        assert!(store.window(1_000).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_line_does_not_affect_neighbours() {
        let (_temp, store) = store();
        store.ingest(&[record("a", 1)]).unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(store.path())
                .unwrap();
            writeln!(file, "{{\"uid\": truncated").unwrap();
        }
        store.ingest(&[record("a", 2)]).unwrap();

        let stamps: Vec<i64> = store.all().unwrap().iter().map(|r| r.scheduled_at_ms).collect();
        assert_eq!(stamps, vec![1, 2]);
    }

    #[test]
    fn test_empty_store() {
        let (_temp, store) = store();
        assert!(store.all().unwrap().is_empty());
        assert_eq!(store.ingest(&[]).unwrap(), 0);
    }
}
