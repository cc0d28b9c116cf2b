use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::FakeServiceManager;
use crate::error::ProviderError;
use crate::model::ActiveState;
use crate::providers::{ExecOutput, Provider, ProviderKind, ResourceStatus, Target};
use crate::store::lock;

/// Provider that keeps presence in memory and records its calls.
pub struct RecordingProvider {
    kind: ProviderKind,
    calls: Mutex<Vec<String>>,
    present: Mutex<HashSet<String>>,
    drifted: Mutex<HashSet<String>>,
    /// `(retryable, message)` returned by every create.
    failure: Mutex<Option<(bool, String)>>,
}

impl RecordingProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            calls: Mutex::new(Vec::new()),
            present: Mutex::new(HashSet::new()),
            drifted: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
        }
    }

    /// Make every subsequent create fail like `error`.
    pub fn fail_create(&self, error: ProviderError) {
        *lock(&self.failure) = Some((error.is_retryable(), error.to_string()));
    }

    /// Report `name` as `Drifted` until it is created again.
    pub fn mark_drifted(&self, name: &str) {
        lock(&self.drifted).insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn is_present(&self, name: &str) -> bool {
        lock(&self.present).contains(name)
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        Ok(if !self.is_present(&target.name) {
            ResourceStatus::Absent
        } else if lock(&self.drifted).contains(&target.name) {
            ResourceStatus::Drifted
        } else {
            ResourceStatus::Present
        })
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        lock(&self.calls).push(format!("create {}", target.name));
        if let Some((retryable, message)) = lock(&self.failure).clone() {
            return Err(if retryable {
                ProviderError::retryable("create", message)
            } else {
                ProviderError::permanent("create", message)
            });
        }
        lock(&self.present).insert(target.name.clone());
        lock(&self.drifted).remove(&target.name);
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        lock(&self.calls).push(format!("destroy {}", target.name));
        lock(&self.present).remove(&target.name);
        Ok(())
    }
}

/// Image provider keyed by image name, with a configurable pull time.
#[derive(Default)]
pub struct FakeImageProvider {
    present: Mutex<HashSet<String>>,
    pulls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    pull_delay: Mutex<Duration>,
}

impl FakeImageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *lock(&self.pull_delay) = delay;
    }

    /// Make every pull of `image` fail.
    pub fn fail_pull(&self, image: &str) {
        lock(&self.failing).insert(image.to_string());
    }

    /// Drop `image` as if deleted behind the agent's back.
    pub fn forget(&self, image: &str) {
        lock(&self.present).remove(image);
    }

    /// Images pulled so far, in pull order.
    pub fn pulls(&self) -> Vec<String> {
        lock(&self.pulls).clone()
    }

    pub fn pull_count(&self, image: &str) -> usize {
        lock(&self.pulls).iter().filter(|p| *p == image).count()
    }

    pub fn is_present(&self, image: &str) -> bool {
        lock(&self.present).contains(image)
    }

    fn image_name(target: &Target) -> Result<String, ProviderError> {
        target
            .image
            .as_ref()
            .map(|image| image.name.clone())
            .ok_or_else(|| ProviderError::permanent("pull", format!("{} has no image", target.name)))
    }
}

#[async_trait]
impl Provider for FakeImageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Image
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        Ok(if self.is_present(&Self::image_name(target)?) {
            ResourceStatus::Present
        } else {
            ResourceStatus::Absent
        })
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        let image = Self::image_name(target)?;
        lock(&self.pulls).push(image.clone());
        let delay = *lock(&self.pull_delay);
        tokio::time::sleep(delay).await;
        if lock(&self.failing).contains(&image) {
            return Err(ProviderError::retryable("pull", format!("{image}: download failed")));
        }
        lock(&self.present).insert(image);
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        lock(&self.present).remove(&Self::image_name(target)?);
        Ok(())
    }
}

/// Container provider backed by a [`FakeServiceManager`]: creating a
/// container adds a stopped unit, destroying it removes the unit.
pub struct FakeContainerProvider {
    manager: Arc<FakeServiceManager>,
    exec_delay: Mutex<Duration>,
    running_execs: AtomicUsize,
    peak_execs: AtomicUsize,
}

impl FakeContainerProvider {
    pub fn new(manager: Arc<FakeServiceManager>) -> Self {
        Self {
            manager,
            exec_delay: Mutex::new(Duration::ZERO),
            running_execs: AtomicUsize::new(0),
            peak_execs: AtomicUsize::new(0),
        }
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *lock(&self.exec_delay) = delay;
    }

    /// Most execs seen running at the same time.
    pub fn peak_execs(&self) -> usize {
        self.peak_execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeContainerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        Ok(match self.manager.state(&target.name) {
            Some(_) => ResourceStatus::Present,
            None => ResourceStatus::Absent,
        })
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        self.manager
            .add_container(&target.name, ActiveState::Inactive);
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        self.manager.remove_container(&target.name);
        Ok(())
    }

    /// Echoes the command line.
    async fn exec(&self, _name: &str, argv: &[String]) -> Result<ExecOutput, ProviderError> {
        let running = self.running_execs.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_execs.fetch_max(running, Ordering::SeqCst);
        let delay = *lock(&self.exec_delay);
        tokio::time::sleep(delay).await;
        self.running_execs.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("{}\n", argv.join(" ")),
            stderr: String::new(),
        })
    }
}
