//! Test utilities
//!
//! In-memory stand-ins for the host: a service manager with asynchronous
//! job completion, a command recorder, and providers that keep their state
//! in memory. Used by the unit tests and by the integration tests under
//! `tests/`.

mod providers;
mod runner;
mod service_manager;

pub use providers::{FakeContainerProvider, FakeImageProvider, RecordingProvider};
pub use runner::RecordingRunner;
pub use service_manager::FakeServiceManager;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentHandle};
use crate::audit::AuditLogger;
use crate::config::{AgentSettings, ConfigLoader, RetrySettings};
use crate::error::{BackendError, ConfigError};
use crate::model::{ContainerSpec, DesiredDocument, Image, ImageKind, Profile, VerifyMode};
use crate::providers::{ProviderKind, Registry};
use crate::reconciler::Reconciler;
use crate::store::{StateStore, lock};
use crate::systemd::InitSystem;

/// One image, the `isolated` profile and `web1` running on `node`.
pub fn sample_document(node: &str) -> DesiredDocument {
    let mut doc = DesiredDocument::default();
    doc.images.insert(
        "ubuntu-24.04".to_string(),
        Image {
            name: "ubuntu-24.04".to_string(),
            kind: ImageKind::Tar,
            source: "https://images.example.org/ubuntu-24.04.tar.xz".to_string(),
            verify: VerifyMode::Checksum,
            custom_files: Vec::new(),
        },
    );
    doc.profiles.insert(
        "isolated".to_string(),
        Profile {
            name: "isolated".to_string(),
            description: Some("Host network, private users".to_string()),
            nspawn_config: "[Exec]\nPrivateUsers=pick\n\n[Network]\nPrivate=no\nVirtualEthernet=no\n"
                .to_string(),
            systemd_override: String::new(),
        },
    );
    let mut containers = BTreeMap::new();
    containers.insert(
        "web1".to_string(),
        ContainerSpec::new("web1", "ubuntu-24.04"),
    );
    doc.nodes.insert(node.to_string(), containers);
    doc
}

/// Agent settings with short retries and timeouts, and no periodic pass
/// during a test.
pub fn test_settings() -> AgentSettings {
    AgentSettings {
        reconciliation_interval: 3600,
        job_timeout: 5,
        request_timeout: 10,
        retry: RetrySettings {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        ..AgentSettings::default()
    }
}

/// Image and profile providers in memory, containers on a fake manager.
#[derive(Clone)]
pub struct FakeProviders {
    pub images: Arc<FakeImageProvider>,
    pub profiles: Arc<RecordingProvider>,
    pub containers: Arc<FakeContainerProvider>,
}

impl FakeProviders {
    pub fn new(manager: &Arc<FakeServiceManager>) -> Self {
        Self {
            images: Arc::new(FakeImageProvider::new()),
            profiles: Arc::new(RecordingProvider::new(ProviderKind::Profile)),
            containers: Arc::new(FakeContainerProvider::new(Arc::clone(manager))),
        }
    }

    pub fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        registry.register(self.images.clone());
        registry.register(self.profiles.clone());
        registry.register(self.containers.clone());
        registry
    }
}

/// Loader returning a document the test can swap at any time.
pub struct StaticLoader {
    doc: Mutex<Result<DesiredDocument, String>>,
}

impl StaticLoader {
    pub fn new(doc: DesiredDocument) -> Self {
        Self {
            doc: Mutex::new(Ok(doc)),
        }
    }

    pub fn set(&self, doc: DesiredDocument) {
        *lock(&self.doc) = Ok(doc);
    }

    /// Make the next loads fail with `message`.
    pub fn fail(&self, message: &str) {
        *lock(&self.doc) = Err(message.to_string());
    }
}

#[async_trait]
impl ConfigLoader for StaticLoader {
    async fn load(&self) -> Result<DesiredDocument, ConfigError> {
        lock(&self.doc).clone().map_err(ConfigError::Invalid)
    }
}

/// A running agent on fake host backends.
pub struct TestStack {
    pub store: Arc<StateStore>,
    pub manager: Arc<FakeServiceManager>,
    pub loader: Arc<StaticLoader>,
    pub reconciler: Arc<Reconciler>,
    pub providers: FakeProviders,
    pub handle: AgentHandle,
    pub settings: AgentSettings,
    pub agent: JoinHandle<Result<(), BackendError>>,
}

impl TestStack {
    /// Start an agent serving `doc` on node `host1`.
    pub async fn start(doc: DesiredDocument) -> Self {
        Self::with_settings(doc, test_settings()).await
    }

    pub async fn with_settings(doc: DesiredDocument, settings: AgentSettings) -> Self {
        let (manager, rx) = FakeServiceManager::new();
        let (init, _dispatcher) = InitSystem::start(manager.clone(), rx, settings.job_timeout());
        let store = Arc::new(StateStore::new("host1", None));
        let audit = Arc::new(AuditLogger::new_noop());
        let providers = FakeProviders::new(&manager);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            init.clone(),
            Arc::new(providers.registry()),
            audit.clone(),
            &settings,
        ));
        let loader = Arc::new(StaticLoader::new(doc));
        let (agent, handle) = Agent::new(
            store.clone(),
            reconciler.clone(),
            loader.clone(),
            init,
            audit,
            settings.reconciliation_interval(),
        );
        let agent = tokio::spawn(agent.run());

        // Store reads bypass the agent, so wait for the startup pass here.
        for _ in 0..100 {
            if store.last_pass().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        Self {
            store,
            manager,
            loader,
            reconciler,
            providers,
            handle,
            settings,
            agent,
        }
    }
}
