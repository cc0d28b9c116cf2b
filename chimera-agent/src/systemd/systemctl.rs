//! `systemctl`-backed service manager.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{JobId, JobNotification, JobResult, JobVerb, ServiceManager, UnitStatus};
use super::{container_name, unit_name};
use crate::error::BackendError;
use crate::host::HostRunner;
use crate::model::ActiveState;

/// Runs each job as its own `systemctl <verb> <unit>` process and posts
/// the outcome when that process exits.
pub struct SystemctlManager {
    runner: Arc<dyn HostRunner>,
    machines_dir: PathBuf,
    next_job: AtomicU64,
    notify: mpsc::UnboundedSender<JobNotification>,
}

impl SystemctlManager {
    pub fn new(
        runner: Arc<dyn HostRunner>,
        machines_dir: impl Into<PathBuf>,
        notify: mpsc::UnboundedSender<JobNotification>,
    ) -> Self {
        Self {
            runner,
            machines_dir: machines_dir.into(),
            next_job: AtomicU64::new(0),
            notify,
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String, BackendError> {
        let output = self.runner.run("systemctl", args).await?;
        if !output.success() {
            return Err(BackendError::Command {
                command: format!("systemctl {}", args.join(" ")),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// The container root exists as a directory or a `.raw` image.
    async fn root_exists(&self, name: &str) -> bool {
        let dir = self.machines_dir.join(name);
        let raw = self.machines_dir.join(format!("{name}.raw"));
        matches!(tokio::fs::try_exists(&dir).await, Ok(true))
            || matches!(tokio::fs::try_exists(&raw).await, Ok(true))
    }

    async fn machine_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), "Cannot list machines: {}", e);
                return names;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let name = file_name
                .strip_suffix(".raw")
                .map(str::to_string)
                .unwrap_or(file_name);
            names.push(name);
        }
        names
    }
}

/// Classify the exit of a `systemctl <verb>` process.
fn job_result(code: Option<i32>, stderr: &str) -> JobResult {
    if code == Some(0) {
        return JobResult::Done;
    }
    let stderr = stderr.to_ascii_lowercase();
    if stderr.contains("canceled") || stderr.contains("cancelled") {
        JobResult::Canceled
    } else if stderr.contains("dependency") {
        JobResult::Dependency
    } else if stderr.contains("timed out") {
        JobResult::Timeout
    } else {
        JobResult::Failed
    }
}

fn parse_properties(output: &str) -> (String, String, String) {
    let mut load = String::new();
    let mut active = String::new();
    let mut sub = String::new();
    for line in output.lines() {
        match line.split_once('=') {
            Some(("LoadState", v)) => load = v.trim().to_string(),
            Some(("ActiveState", v)) => active = v.trim().to_string(),
            Some(("SubState", v)) => sub = v.trim().to_string(),
            _ => {}
        }
    }
    (load, active, sub)
}

#[async_trait]
impl ServiceManager for SystemctlManager {
    async fn enqueue(&self, unit: &str, verb: JobVerb) -> Result<JobId, BackendError> {
        let job = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        let runner = Arc::clone(&self.runner);
        let notify = self.notify.clone();
        let unit = unit.to_string();

        tokio::spawn(async move {
            let result = match runner.run("systemctl", &[verb.as_str(), unit.as_str()]).await {
                Ok(output) => {
                    if !output.success() {
                        warn!(unit = %unit, verb = %verb, "systemctl failed: {}", output.stderr.trim());
                    }
                    job_result(output.code, &output.stderr)
                }
                Err(e) => {
                    warn!(unit = %unit, verb = %verb, "Failed to run systemctl: {}", e);
                    JobResult::Failed
                }
            };
            let _ = notify.send(JobNotification { job, unit, result });
        });

        Ok(job)
    }

    async fn unit_status(&self, unit: &str) -> Result<UnitStatus, BackendError> {
        let output = self
            .systemctl(&[
                "show",
                unit,
                "-p",
                "LoadState",
                "-p",
                "ActiveState",
                "-p",
                "SubState",
            ])
            .await?;
        let (load, active, sub) = parse_properties(&output);

        let exists = match container_name(unit) {
            Some(name) if load != "not-found" => self.root_exists(name).await,
            _ => false,
        };
        Ok(UnitStatus {
            unit: unit.to_string(),
            exists,
            active: ActiveState::from_systemd(&active),
            sub_state: sub,
        })
    }

    async fn list_units(&self) -> Result<Vec<String>, BackendError> {
        let output = self
            .systemctl(&[
                "list-units",
                "--all",
                "--plain",
                "--no-legend",
                "systemd-nspawn@*",
            ])
            .await?;
        let mut units: BTreeSet<String> = output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|unit| container_name(unit).is_some())
            .map(str::to_string)
            .collect();
        for name in Self::machine_names(&self.machines_dir).await {
            units.insert(unit_name(&name));
        }
        Ok(units.into_iter().collect())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        match self.runner.run("systemctl", &["is-system-running"]).await {
            // Degraded systems exit non-zero but still answer.
            Ok(output) if !output.stdout.trim().is_empty() => Ok(()),
            Ok(output) => Err(BackendError::Unavailable(output.stderr.trim().to_string())),
            Err(e) => Err(BackendError::Unavailable(e.to_string())),
        }
    }
}
