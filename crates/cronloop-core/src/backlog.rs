//! Experiment backlog
//!
//! Durable, line-per-record store of [`Experiment`]s. New proposals are
//! appended; the control loop rewrites the whole file atomically after each
//! in-memory pass. Callers serialize mutation; there is no locking here.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::experiment::Experiment;
use crate::persistence::{append_json_lines, read_json_lines, rewrite_json_lines};
use crate::recommendation::{backlog_keys, Recommendation, RecommendationEngine, RecommendationKey};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ExperimentBacklog {
    path: PathBuf,
}

impl ExperimentBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable experiment, in file order
    pub fn load_all(&self) -> Result<Vec<Experiment>> {
        Ok(read_json_lines(&self.path)?.records)
    }

    /// Append experiments to the end of the backlog
    pub fn append(&self, experiments: &[Experiment]) -> Result<()> {
        append_json_lines(&self.path, experiments)
    }

    /// Replace the backlog with `experiments`.
    ///
    /// Lines of the current file that do not parse are carried forward
    /// verbatim after the rewritten records.
    pub fn save_all(&self, experiments: &[Experiment]) -> Result<()> {
        let unparsed = read_json_lines::<Experiment>(&self.path)?.unparsed;
        if !unparsed.is_empty() {
            warn!(
                lines = unparsed.len(),
                "Preserving unreadable backlog lines across rewrite"
            );
        }
        rewrite_json_lines(&self.path, experiments, &unparsed)
    }

    /// Dedup keys of every experiment, any status
    pub fn keys(&self) -> Result<HashSet<RecommendationKey>> {
        Ok(backlog_keys(&self.load_all()?))
    }

    /// Append a proposed experiment for each recommendation whose key is not
    /// in the backlog yet. Returns the experiments created.
    pub fn propose(
        &self,
        recommendations: &[Recommendation],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Experiment>> {
        let fresh = RecommendationEngine::suppress_known(recommendations.to_vec(), &self.keys()?);
        let experiments: Vec<Experiment> = fresh
            .iter()
            .map(|rec| Experiment::from_recommendation(rec, created_at))
            .collect();

        self.append(&experiments)?;
        info!(proposed = experiments.len(), "Backlog updated");
        Ok(experiments)
    }
}
