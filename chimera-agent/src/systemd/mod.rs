//! Init-System Integration Layer.
//!
//! The service manager accepts a job and reports its completion later on a
//! notification channel. [`InitSystem`] turns that into an awaitable call:
//! submit, park on a slot in the [`JobTable`], and give up after the job
//! ceiling. A notification dispatcher task fills the slots.

mod jobs;
mod systemctl;

pub use jobs::{Completion, JobTable};
pub use systemctl::SystemctlManager;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AgentError, BackendError};
use crate::model::{ActiveState, ObservedContainer};
use crate::store::lock;

const UNIT_PREFIX: &str = "systemd-nspawn@";
const UNIT_SUFFIX: &str = ".service";

/// Unit managing the container `name`.
pub fn unit_name(name: &str) -> String {
    format!("{UNIT_PREFIX}{name}{UNIT_SUFFIX}")
}

/// Container name of a managed unit, `None` for other units.
pub fn container_name(unit: &str) -> Option<&str> {
    unit.strip_prefix(UNIT_PREFIX)?
        .strip_suffix(UNIT_SUFFIX)
        .filter(|name| !name.is_empty())
}

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobVerb {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl JobVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobVerb::Start => "start",
            JobVerb::Stop => "stop",
            JobVerb::Restart => "restart",
            JobVerb::Enable => "enable",
            JobVerb::Disable => "disable",
        }
    }
}

impl fmt::Display for JobVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a job, named as systemd names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Done | JobResult::Skipped)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobResult::Done => "done",
            JobResult::Canceled => "canceled",
            JobResult::Timeout => "timeout",
            JobResult::Failed => "failed",
            JobResult::Dependency => "dependency",
            JobResult::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Posted by a backend when a job reaches its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub job: JobId,
    pub unit: String,
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit: String,
    /// The container behind the unit exists on the host.
    pub exists: bool,
    pub active: ActiveState,
    pub sub_state: String,
}

/// Backend for the host's service manager.
///
/// `enqueue` returns as soon as the job is accepted; its completion is
/// posted later as a [`JobNotification`] on the channel the backend was
/// created with, possibly before `enqueue` has returned.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn enqueue(&self, unit: &str, verb: JobVerb) -> Result<JobId, BackendError>;
    async fn unit_status(&self, unit: &str) -> Result<UnitStatus, BackendError>;
    /// Managed units known to the host, existing containers included.
    async fn list_units(&self) -> Result<Vec<String>, BackendError>;
    async fn ping(&self) -> Result<(), BackendError>;
}

/// Awaitable job submission on top of a [`ServiceManager`].
pub struct InitSystem {
    manager: Arc<dyn ServiceManager>,
    jobs: Arc<Mutex<JobTable>>,
    job_timeout: Duration,
}

/// Abandons the slot unless the wait finished.
struct WaitGuard<'a> {
    jobs: &'a Mutex<JobTable>,
    job: JobId,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.jobs).abandon(self.job);
        }
    }
}

impl InitSystem {
    /// Wrap `manager` and spawn the notification dispatcher. The returned
    /// task only ends when the notification channel closes, which means the
    /// init-system connection is gone.
    pub fn start(
        manager: Arc<dyn ServiceManager>,
        notifications: mpsc::UnboundedReceiver<JobNotification>,
        job_timeout: Duration,
    ) -> (Arc<Self>, JoinHandle<Result<(), BackendError>>) {
        let jobs = Arc::new(Mutex::new(JobTable::new()));
        let dispatcher = tokio::spawn(dispatch_notifications(Arc::clone(&jobs), notifications));
        let init = Arc::new(Self {
            manager,
            jobs,
            job_timeout,
        });
        (init, dispatcher)
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Submit `verb` on the unit of container `name` and wait for the job.
    pub async fn submit_job(&self, name: &str, verb: JobVerb) -> Result<JobResult, AgentError> {
        let unit = unit_name(name);
        let job = self.manager.enqueue(&unit, verb).await?;
        let rx = {
            let mut jobs = lock(&self.jobs);
            jobs.prune(self.job_timeout * 4);
            jobs.register(job)
        };
        let mut guard = WaitGuard {
            jobs: &self.jobs,
            job,
            armed: true,
        };
        debug!(job, unit = %unit, verb = %verb, "Job submitted");

        match tokio::time::timeout(self.job_timeout, rx).await {
            Ok(Ok(result)) => {
                guard.armed = false;
                debug!(job, unit = %unit, result = %result, "Job finished");
                if result.is_success() {
                    Ok(result)
                } else {
                    Err(AgentError::JobFailure { unit, verb, result })
                }
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(AgentError::Internal(format!("completion slot of job {job} dropped")))
            }
            Err(_) => {
                warn!(job, unit = %unit, verb = %verb, "Job timed out after {:?}", self.job_timeout);
                Err(AgentError::JobTimeout {
                    unit,
                    verb,
                    timeout: self.job_timeout,
                })
            }
        }
    }

    pub async fn unit_status(&self, name: &str) -> Result<UnitStatus, AgentError> {
        Ok(self.manager.unit_status(&unit_name(name)).await?)
    }

    /// Current observation of one container, `None` if it does not exist.
    pub async fn observe(&self, name: &str) -> Result<Option<ObservedContainer>, AgentError> {
        let status = self.unit_status(name).await?;
        if !status.exists {
            return Ok(None);
        }
        Ok(Some(ObservedContainer::new(name, status.active)))
    }

    /// Names of all containers with a managed unit.
    pub async fn list_containers(&self) -> Result<Vec<String>, AgentError> {
        let units = self.manager.list_units().await?;
        let mut names: Vec<String> = units
            .iter()
            .filter_map(|u| container_name(u))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn ping(&self) -> Result<(), BackendError> {
        self.manager.ping().await
    }
}

async fn dispatch_notifications(
    jobs: Arc<Mutex<JobTable>>,
    mut notifications: mpsc::UnboundedReceiver<JobNotification>,
) -> Result<(), BackendError> {
    info!("Job notification dispatcher running");
    while let Some(n) = notifications.recv().await {
        match lock(&jobs).complete(n.job, n.result) {
            Completion::Delivered => {}
            Completion::Buffered => debug!(job = n.job, unit = %n.unit, "Completion arrived before its waiter"),
            Completion::Discarded => debug!(job = n.job, unit = %n.unit, result = %n.result, "Discarded late completion"),
        }
    }
    Err(BackendError::Unavailable(
        "job notification channel closed".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeServiceManager;

    #[test]
    fn test_unit_name_convention() {
        assert_eq!(unit_name("web1"), "systemd-nspawn@web1.service");
        assert_eq!(container_name("systemd-nspawn@web1.service"), Some("web1"));
        assert_eq!(container_name("sshd.service"), None);
        assert_eq!(container_name("systemd-nspawn@.service"), None);
    }

    #[tokio::test]
    async fn test_submit_job_success() {
        let (fake, rx) = FakeServiceManager::new();
        fake.add_container("web1", ActiveState::Inactive);
        let (init, _dispatcher) = InitSystem::start(fake.clone(), rx, Duration::from_secs(5));

        let result = init.submit_job("web1", JobVerb::Start).await.unwrap();
        assert_eq!(result, JobResult::Done);
        assert_eq!(fake.state("web1"), Some(ActiveState::Active));
    }

    #[tokio::test]
    async fn test_submit_job_failure_is_typed() {
        let (fake, rx) = FakeServiceManager::new();
        fake.add_container("web1", ActiveState::Inactive);
        fake.fail_jobs("web1", JobVerb::Start, JobResult::Failed);
        let (init, _dispatcher) = InitSystem::start(fake.clone(), rx, Duration::from_secs(5));

        let err = init.submit_job("web1", JobVerb::Start).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::JobFailure {
                result: JobResult::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_job_timeout_and_late_completion() {
        let (fake, rx) = FakeServiceManager::new();
        fake.add_container("web1", ActiveState::Inactive);
        fake.delay_jobs("web1", Duration::from_millis(300));
        let (init, dispatcher) = InitSystem::start(fake.clone(), rx, Duration::from_millis(50));

        let err = init.submit_job("web1", JobVerb::Start).await.unwrap_err();
        assert!(matches!(err, AgentError::JobTimeout { .. }));

        // The job still completes later; its notification must be dropped
        // without disturbing the dispatcher.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!dispatcher.is_finished());
        assert_eq!(fake.state("web1"), Some(ActiveState::Active));

        fake.delay_jobs("web1", Duration::ZERO);
        assert!(init.submit_job("web1", JobVerb::Stop).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_jobs_complete_out_of_order() {
        let (fake, rx) = FakeServiceManager::new();
        fake.add_container("slow", ActiveState::Inactive);
        fake.add_container("fast", ActiveState::Inactive);
        fake.delay_jobs("slow", Duration::from_millis(150));
        let (init, _dispatcher) = InitSystem::start(fake.clone(), rx, Duration::from_secs(5));

        let (slow, fast) = tokio::join!(
            init.submit_job("slow", JobVerb::Start),
            init.submit_job("fast", JobVerb::Start)
        );
        assert!(slow.is_ok());
        assert!(fast.is_ok());
        let order = fake.completed_jobs();
        assert_eq!(order.first().map(|(n, _)| n.as_str()), Some("fast"));
    }

    #[tokio::test]
    async fn test_observe_and_list() {
        let (fake, rx) = FakeServiceManager::new();
        fake.add_container("b", ActiveState::Failed);
        fake.add_container("a", ActiveState::Active);
        let (init, _dispatcher) = InitSystem::start(fake, rx, Duration::from_secs(5));

        assert_eq!(init.list_containers().await.unwrap(), vec!["a", "b"]);
        let observed = init.observe("b").await.unwrap().unwrap();
        assert_eq!(observed.active, ActiveState::Failed);
        assert!(init.observe("missing").await.unwrap().is_none());
    }
}
