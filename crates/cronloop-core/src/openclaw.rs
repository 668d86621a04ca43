//! Scheduler CLI adapter
//!
//! [`JobControl`] backed by the `openclaw` command line. Every call runs the
//! binary once and parses its JSON stdout.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::job_control::{Job, JobControl, JobEdit, RawRunEntry};
use crate::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Default, Deserialize)]
struct RunList {
    #[serde(default)]
    entries: Vec<RawRunEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelStatus {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Job control through `openclaw --profile <profile> ...`
#[derive(Debug, Clone)]
pub struct OpenClawJobControl {
    bin: String,
    profile: String,
}

impl OpenClawJobControl {
    pub fn new(bin: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            profile: profile.into(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["--profile".to_string(), self.profile.clone()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    fn list_jobs_args(&self) -> Vec<String> {
        self.args(&["cron", "list", "--all", "--json"])
    }

    fn list_runs_args(&self, job_id: &str, limit: usize) -> Vec<String> {
        self.args(&["cron", "runs", "--id", job_id, "--limit", &limit.to_string()])
    }

    fn model_status_args(&self) -> Vec<String> {
        self.args(&["models", "status", "--json"])
    }

    /// One `cron edit` invocation per changed field, model first
    fn edit_args(&self, job_id: &str, edit: &JobEdit) -> Vec<Vec<String>> {
        let mut calls = Vec::new();
        if let Some(model) = &edit.model {
            calls.push(self.args(&["cron", "edit", job_id, "--model", model]));
        }
        if let Some(message) = &edit.message {
            calls.push(self.args(&["cron", "edit", job_id, "--message", message]));
        }
        calls
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        // message bodies can be long; keep them out of error text
        let command = format!("{} {}", self.bin, args.iter().take(4).cloned().collect::<Vec<_>>().join(" "));
        debug!(command = %command, "Running scheduler command");

        let output = tokio::process::Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ExternalCommand {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::ExternalCommand {
                command,
                message: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T> {
        let stdout = self.run(args).await?;
        parse_json(&stdout)
    }
}

fn parse_json<T: DeserializeOwned>(stdout: &[u8]) -> Result<T> {
    serde_json::from_slice(stdout)
        .map_err(|e| Error::Parse(format!("Invalid JSON from scheduler: {}", e)))
}

#[async_trait]
impl JobControl for OpenClawJobControl {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let list: JobList = self.run_json(&self.list_jobs_args()).await?;
        Ok(list.jobs)
    }

    async fn edit_job(&self, job_id: &str, edit: &JobEdit) -> Result<()> {
        for args in self.edit_args(job_id, edit) {
            self.run(&args).await?;
        }
        Ok(())
    }

    async fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RawRunEntry>> {
        let runs: RunList = self.run_json(&self.list_runs_args(job_id, limit)).await?;
        Ok(runs.entries)
    }

    async fn model_aliases(&self) -> Result<BTreeMap<String, String>> {
        let status: ModelStatus = self.run_json(&self.model_status_args()).await?;
        Ok(status.aliases)
    }
}
