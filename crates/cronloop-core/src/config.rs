//! Loop configuration and workspace layout
//!
//! Configuration is read from an optional YAML file; every field has a
//! default so a missing file means "run with defaults". CLI flags are
//! applied on top by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "cronloop.yaml";

/// Maps a known high-cost job to its pre-authored lean prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeanPromptRule {
    pub job: String,
    /// Relative paths resolve against the self-improvement root
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Scheduler profile passed through to the job-control CLI
    pub profile: String,
    /// Job-control executable
    pub openclaw_bin: String,
    /// Lookback window for metrics
    pub window_days: u32,
    /// Run history entries fetched per job
    pub runs_per_job_limit: usize,
    /// Minimum runs before a job gets recommendations
    pub min_sample: u64,
    /// Runs required after activation before evaluating
    pub min_new_runs: u64,
    pub lean_prompts: Vec<LeanPromptRule>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            profile: "dev".to_string(),
            openclaw_bin: "openclaw".to_string(),
            window_days: 7,
            runs_per_job_limit: 30,
            min_sample: 3,
            min_new_runs: 2,
            lean_prompts: vec![LeanPromptRule {
                job: "foundry-daily-build-candidate".to_string(),
                path: PathBuf::from("config/prompts/foundry_lean.txt"),
            }],
        }
    }
}

impl LoopConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Explicit path must exist; the default location may be absent
    pub fn load(explicit: Option<&Path>, paths: &WorkspacePaths) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_yaml_file(path),
            None => {
                let default_path = paths.config_file();
                if default_path.exists() {
                    Self::from_yaml_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// On-disk layout under `<workspace>/self-improvement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            root: workspace.as_ref().join("self-improvement"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.root.join("experiments")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn runs_file(&self) -> PathBuf {
        self.metrics_dir().join("cron-runs.jsonl")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.metrics_dir().join("latest-summary.json")
    }

    pub fn backlog_file(&self) -> PathBuf {
        self.experiments_dir().join("backlog.jsonl")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn dated_report(&self, at: DateTime<Utc>) -> PathBuf {
        self.reports_dir()
            .join(format!("{}.md", at.format("%Y-%m-%d")))
    }

    pub fn latest_report(&self) -> PathBuf {
        self.reports_dir().join("latest.md")
    }

    pub fn control_report(&self) -> PathBuf {
        self.reports_dir().join("auto-promotion-latest.md")
    }

    /// Resolve a config-relative path against the self-improvement root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.metrics_dir(),
            self.reports_dir(),
            self.experiments_dir(),
            self.config_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
