//! Agent Control-Plane Server.
//!
//! Listens on a Unix stream socket protected by filesystem permissions.
//! Every accepted connection is served on its own task by
//! [`handler::handle_connection`]; a semaphore caps how many are open.

pub mod handler;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::agent::AgentHandle;
use crate::audit::AuditLogger;
use crate::config::AgentSettings;
use crate::store::StateStore;

pub use handler::{AgentStatus, Authorizer, Identity, ServerContext};

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    context: Arc<ServerContext>,
    connections: Arc<Semaphore>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one, and apply its
    /// permissions. Failure here is fatal for the agent.
    pub async fn bind(
        settings: &AgentSettings,
        store: Arc<StateStore>,
        agent: AgentHandle,
        audit: Arc<AuditLogger>,
    ) -> std::io::Result<Self> {
        let socket_path = settings.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&socket_path).await;

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(settings.socket_mode),
        )?;
        if let Some(gid) = settings.socket_gid {
            std::os::unix::fs::chown(&socket_path, None, Some(gid))?;
        }
        info!(
            path = %socket_path.display(),
            mode = %format!("{:o}", settings.socket_mode),
            "Control socket bound"
        );

        let context = ServerContext {
            store,
            agent,
            auth: Authorizer::new(settings.privileged_uids.clone(), settings.privileged_gid),
            audit,
            request_timeout: settings.request_timeout(),
        };
        Ok(Self {
            listener,
            socket_path,
            context: Arc::new(context),
            connections: Arc::new(Semaphore::new(settings.max_connections.max(1))),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let Ok(permit) = Arc::clone(&self.connections).acquire_owned().await else {
                return Ok(());
            };
            let (stream, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                handler::handle_connection(stream, context).await;
                drop(permit);
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
