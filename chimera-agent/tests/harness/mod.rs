//! Test harness for control-socket integration tests
//!
//! Runs a full agent and control server on in-memory host backends, with
//! the socket in a temporary directory.

#![allow(dead_code)]

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use chimera_agent::audit::AuditLogger;
use chimera_agent::client::ControlClient;
use chimera_agent::model::{ContainerSpec, DesiredDocument};
use chimera_agent::protocol::{Command, Response};
use chimera_agent::server::ControlServer;
use chimera_agent::test_util::{TestStack, sample_document, test_settings};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub use chimera_agent::test_util::FakeServiceManager;

pub struct TestAgent {
    pub stack: TestStack,
    pub socket: PathBuf,
    server: JoinHandle<std::io::Result<()>>,
    _dir: TempDir,
}

impl TestAgent {
    /// Agent whose only privileged uid is the test process's own.
    pub async fn start(doc: DesiredDocument) -> Self {
        Self::with_privilege(doc, true).await
    }

    /// Agent that treats the test process as an ordinary user.
    pub async fn unprivileged(doc: DesiredDocument) -> Self {
        Self::with_privilege(doc, false).await
    }

    async fn with_privilege(doc: DesiredDocument, privileged: bool) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let dir = TempDir::new().expect("Failed to create temp dir");
        let uid = std::fs::metadata(dir.path())
            .expect("Failed to stat temp dir")
            .uid();

        let mut settings = test_settings();
        settings.socket_path = dir.path().join("run").join("agent.sock");
        settings.socket_mode = 0o600;
        settings.privileged_uids = if privileged { vec![uid] } else { Vec::new() };
        settings.privileged_gid = None;

        let stack = TestStack::with_settings(doc, settings.clone()).await;
        let server = ControlServer::bind(
            &settings,
            stack.store.clone(),
            stack.handle.clone(),
            Arc::new(AuditLogger::new_noop()),
        )
        .await
        .expect("Failed to bind control socket");
        let socket = server.socket_path().to_path_buf();
        let server = tokio::spawn(server.run());

        Self {
            stack,
            socket,
            server,
            _dir: dir,
        }
    }

    pub fn manager(&self) -> &FakeServiceManager {
        &self.stack.manager
    }

    pub async fn client(&self) -> ControlClient {
        ControlClient::connect(&self.socket)
            .await
            .expect("Failed to connect to agent")
    }

    /// Send one command on a fresh connection.
    pub async fn call(&self, command: Command) -> Response {
        self.client()
            .await
            .call(command)
            .await
            .expect("Request failed")
    }
}

/// `web1` and `web2`, both running.
pub fn two_containers() -> DesiredDocument {
    let mut doc = sample_document("host1");
    if let Some(containers) = doc.nodes.get_mut("host1") {
        containers.insert(
            "web2".to_string(),
            ContainerSpec::new("web2", "ubuntu-24.04"),
        );
    }
    doc
}

pub fn empty_node() -> DesiredDocument {
    let mut doc = sample_document("host1");
    doc.nodes.insert("host1".to_string(), Default::default());
    doc
}
