//! Agent: the control loop actor.
//!
//! Owns the periodic collection and reconciliation tick and receives every
//! mutating request from the control-plane server as a [`Command`] with a
//! oneshot responder. Each command runs on its own task so a slow action
//! on one container never delays requests for another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::ConfigLoader;
use crate::error::{AgentError, BackendError, Result};
use crate::model::{ActiveState, Ensure, ImageKind, ImagePresence, RunState, VerifyMode};
use crate::providers::{ExecOutput, ProviderKind, ResourceStatus, Target};
use crate::reconciler::plan::Action;
use crate::reconciler::{ActionReport, Reconciler};
use crate::store::{Claim, Intent, StateStore};
use crate::systemd::InitSystem;

/// Lifecycle operations a client can request for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Spawn,
    Start,
    Stop,
    Restart,
    Remove,
}

impl Operation {
    fn intent(&self) -> Intent {
        let (ensure, state) = match self {
            Operation::Spawn | Operation::Start | Operation::Restart => {
                (Ensure::Present, RunState::Running)
            }
            Operation::Stop => (Ensure::Present, RunState::Stopped),
            Operation::Remove => (Ensure::Absent, RunState::Stopped),
        };
        Intent { ensure, state }
    }
}

/// Presence of one declared image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ImageKind,
    pub source: String,
    pub verify: VerifyMode,
    pub presence: ImagePresence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub containers: usize,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub node: String,
    pub images: usize,
    pub profiles: usize,
    pub cloud_init: usize,
    pub containers: usize,
    /// Container name to the reference that does not resolve.
    pub problems: BTreeMap<String, String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

type Responder<T> = oneshot::Sender<Result<T>>;

/// Messages handled by the agent.
pub enum Command {
    Apply {
        op: Operation,
        name: String,
        resp: Responder<ActionReport>,
    },
    Exec {
        name: String,
        argv: Vec<String>,
        resp: Responder<ExecOutput>,
    },
    Shell {
        name: String,
        resp: Responder<Vec<String>>,
    },
    ImagePull {
        name: String,
        resp: Responder<ImageStatus>,
    },
    ImageList {
        resp: Responder<Vec<ImageStatus>>,
    },
    Reload {
        resp: Responder<ReloadReport>,
    },
    Validate {
        resp: Responder<ValidationReport>,
    },
}

/// Cloneable sender side of the agent.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
}

impl AgentHandle {
    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| AgentError::Internal("agent stopped".to_string()))?;
        rx.await
            .map_err(|_| AgentError::Internal("agent dropped the request".to_string()))?
    }

    pub async fn apply(&self, op: Operation, name: &str) -> Result<ActionReport> {
        let name = name.to_string();
        self.request(|resp| Command::Apply { op, name, resp }).await
    }

    pub async fn exec(&self, name: &str, argv: Vec<String>) -> Result<ExecOutput> {
        let name = name.to_string();
        self.request(|resp| Command::Exec { name, argv, resp }).await
    }

    pub async fn shell(&self, name: &str) -> Result<Vec<String>> {
        let name = name.to_string();
        self.request(|resp| Command::Shell { name, resp }).await
    }

    pub async fn image_pull(&self, name: &str) -> Result<ImageStatus> {
        let name = name.to_string();
        self.request(|resp| Command::ImagePull { name, resp }).await
    }

    pub async fn image_list(&self) -> Result<Vec<ImageStatus>> {
        self.request(|resp| Command::ImageList { resp }).await
    }

    pub async fn reload(&self) -> Result<ReloadReport> {
        self.request(|resp| Command::Reload { resp }).await
    }

    pub async fn validate(&self) -> Result<ValidationReport> {
        self.request(|resp| Command::Validate { resp }).await
    }
}

/// State shared by the agent loop and the tasks it spawns.
struct Core {
    store: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    loader: Arc<dyn ConfigLoader>,
    init: Arc<InitSystem>,
    audit: Arc<AuditLogger>,
}

pub struct Agent {
    core: Arc<Core>,
    interval: Duration,
    rx: mpsc::Receiver<Command>,
}

impl Agent {
    pub fn new(
        store: Arc<StateStore>,
        reconciler: Arc<Reconciler>,
        loader: Arc<dyn ConfigLoader>,
        init: Arc<InitSystem>,
        audit: Arc<AuditLogger>,
        interval: Duration,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(64);
        let agent = Self {
            core: Arc::new(Core {
                store,
                reconciler,
                loader,
                init,
                audit,
            }),
            interval,
            rx,
        };
        (agent, AgentHandle { tx })
    }

    /// Load the desired state, then serve commands and periodic passes
    /// until every handle is dropped. Returns an error only when the init
    /// system is lost.
    pub async fn run(mut self) -> std::result::Result<(), BackendError> {
        self.core.init.ping().await?;
        if let Err(e) = self.core.reload().await {
            warn!("Initial desired-state load failed: {}", e);
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "Agent running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.core.init.ping().await?;
                    let core = Arc::clone(&self.core);
                    tokio::spawn(async move { core.periodic().await });
                }
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("Command channel closed, agent stopping");
                        return Ok(());
                    };
                    let core = Arc::clone(&self.core);
                    tokio::spawn(async move { core.handle(cmd).await });
                }
            }
        }
    }
}

impl Core {
    async fn handle(&self, cmd: Command) {
        match cmd {
            Command::Apply { op, name, resp } => {
                let _ = resp.send(self.apply(op, &name).await);
            }
            Command::Exec { name, argv, resp } => {
                let _ = resp.send(self.exec(&name, &argv).await);
            }
            Command::Shell { name, resp } => {
                let _ = resp.send(self.shell(&name).await);
            }
            Command::ImagePull { name, resp } => {
                let _ = resp.send(self.image_pull(&name).await);
            }
            Command::ImageList { resp } => {
                let _ = resp.send(self.image_list().await);
            }
            Command::Reload { resp } => {
                let _ = resp.send(self.reload().await);
            }
            Command::Validate { resp } => {
                let _ = resp.send(self.validate().await);
            }
        }
    }

    async fn periodic(&self) {
        match self.reconciler.try_full_pass().await {
            Some(Ok(report)) => {
                let failed = report.failed().count();
                if failed > 0 {
                    warn!(failed, "Periodic pass finished with failures");
                } else {
                    debug!(actions = report.actions.len(), "Periodic pass finished");
                }
            }
            Some(Err(e)) => warn!("Periodic pass failed: {}", e),
            None => {}
        }
    }

    fn is_declared(&self, name: &str) -> bool {
        self.store
            .desired()
            .container(self.store.node(), name)
            .is_some()
    }

    /// Record an intent for `name` and run a pass scoped to it.
    async fn apply(&self, op: Operation, name: &str) -> Result<ActionReport> {
        let claim = self.store.claim(name)?;
        let declared = self.is_declared(name);
        if op == Operation::Spawn && !declared {
            return Err(AgentError::NotFound(format!("container {name} is not declared")));
        }
        if op != Operation::Spawn {
            let observed = self.reconciler.collector().observe_one(name).await;
            self.store.record_observation(name, observed.clone());
            let known = observed.is_some() && (declared || op == Operation::Remove);
            if !known {
                return Err(AgentError::NotFound(format!("container {name}")));
            }
        }

        info!(name, operation = ?op, "Applying request");
        self.store.clear_permanent(name);
        self.store.set_override(name, op.intent());
        self.reconciler
            .scoped_pass(&claim, op == Operation::Restart)
            .await
    }

    /// Claim `name` and check afresh that it exists and is running.
    async fn require_running(&self, name: &str) -> Result<Claim> {
        let claim = self.store.claim(name)?;
        let observed = self.reconciler.collector().observe_one(name).await;
        self.store.record_observation(name, observed.clone());
        match observed {
            None => Err(AgentError::NotFound(format!("container {name}"))),
            Some(o) if o.active != ActiveState::Active => Err(AgentError::NotRunning(name.to_string())),
            Some(_) => Ok(claim),
        }
    }

    /// Runs with `name` claimed, so no other command or pass touches it
    /// until the command exits.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(AgentError::BadRequest("exec needs a command".to_string()));
        }
        let _claim = self.require_running(name).await?;
        debug!(name, ?argv, "Executing in container");
        Ok(self.reconciler.registry().exec(name, argv).await?)
    }

    /// The agent does not proxy terminals; the client runs the returned argv.
    async fn shell(&self, name: &str) -> Result<Vec<String>> {
        self.require_running(name).await?;
        Ok(vec![
            "machinectl".to_string(),
            "shell".to_string(),
            name.to_string(),
        ])
    }

    async fn image_pull(&self, name: &str) -> Result<ImageStatus> {
        let doc = self.store.desired();
        let image = doc
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("image {name}")))?;
        let _claim = self.store.claim(&format!("image:{name}"))?;

        self.reconciler.ensure_image(&image).await?;
        Ok(ImageStatus {
            presence: self
                .store
                .image_presence(name)
                .unwrap_or(ImagePresence::Present),
            name: image.name,
            kind: image.kind,
            source: image.source,
            verify: image.verify,
        })
    }

    async fn image_list(&self) -> Result<Vec<ImageStatus>> {
        let doc = self.store.desired();
        let mut images = Vec::with_capacity(doc.images.len());
        for image in doc.images.values() {
            let status = self
                .reconciler
                .registry()
                .status(ProviderKind::Image, &Target::image(image.clone()))
                .await;
            let fallback = match status {
                Ok(ResourceStatus::Present) => ImagePresence::Present,
                Ok(_) => ImagePresence::Absent,
                Err(e) => {
                    warn!(image = %image.name, "Image status failed: {}", e);
                    ImagePresence::Failed
                }
            };
            images.push(ImageStatus {
                name: image.name.clone(),
                kind: image.kind,
                source: image.source.clone(),
                verify: image.verify,
                presence: self.store.image_presence(&image.name).unwrap_or(fallback),
            });
        }
        Ok(images)
    }

    /// Load a new document, make it current and reconcile everything.
    async fn reload(&self) -> Result<ReloadReport> {
        let doc = self.loader.load().await?;
        let containers = doc.containers(self.store.node()).map_or(0, |c| c.len());
        let generation = self.store.apply_document(doc);
        self.audit.config_reloaded(generation, containers);
        info!(generation, containers, "Desired state applied");

        let report = self.reconciler.full_pass().await?;
        Ok(ReloadReport {
            generation,
            containers,
            actions: report.actions,
        })
    }

    /// Load and resolve without applying anything.
    async fn validate(&self) -> Result<ValidationReport> {
        let doc = self.loader.load().await?;
        let node = self.store.node().to_string();
        let mut problems = BTreeMap::new();
        let mut containers = 0;
        if let Some(specs) = doc.containers(&node) {
            containers = specs.len();
            for spec in specs.values().filter(|s| s.ensure == Ensure::Present) {
                if let Err(e) = Target::resolve(&doc, spec) {
                    problems.insert(spec.name.clone(), e.to_string());
                }
            }
        }
        Ok(ValidationReport {
            node,
            images: doc.images.len(),
            profiles: doc.profiles.len(),
            cloud_init: doc.cloud_init.len(),
            containers,
            problems,
        })
    }
}
