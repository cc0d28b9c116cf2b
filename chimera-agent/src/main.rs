use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chimera_agent::agent::Agent;
use chimera_agent::audit::AuditLogger;
use chimera_agent::config::{ChimeraConfig, DirectoryLoader};
use chimera_agent::host::ProcessRunner;
use chimera_agent::providers::Registry;
use chimera_agent::reconciler::Reconciler;
use chimera_agent::server::ControlServer;
use chimera_agent::store::StateStore;
use chimera_agent::systemd::{InitSystem, SystemctlManager};
use chimera_agent::watcher::ConfigWatcher;

#[derive(Parser)]
#[command(name = "chimera-agent")]
#[command(about = "chimera agent - declarative systemd-nspawn containers")]
struct Args {
    /// Directory holding config.yaml and the desired-state documents
    #[arg(short, long, default_value = "/etc/chimera")]
    config_dir: PathBuf,

    /// Control socket path (overrides config.yaml)
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ChimeraConfig::load(&args.config_dir.join("config.yaml"))?;
    if let Some(socket) = args.socket {
        config.agent.socket_path = socket;
    }

    let directive = format!("chimera_agent={}", config.agent.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let settings = config.agent.clone();
    let node = settings.node_name();
    info!(
        node = %node,
        config_dir = %args.config_dir.display(),
        "Starting chimera-agent"
    );

    tokio::fs::create_dir_all(&settings.state_dir)
        .await
        .with_context(|| format!("creating {}", settings.state_dir.display()))?;
    let store = Arc::new(StateStore::new(node.clone(), Some(settings.state_dir.clone())));
    let audit = Arc::new(AuditLogger::new(node));

    // Init system
    let runner = Arc::new(ProcessRunner);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(SystemctlManager::new(
        runner.clone(),
        config.systemd.machines_dir.clone(),
        notify_tx,
    ));
    let (init, dispatcher) = InitSystem::start(manager, notify_rx, settings.job_timeout());
    init.ping().await.context("init system unavailable")?;

    // Reconciler and agent loop
    let registry = Arc::new(Registry::host(runner, store.clone(), &config));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        init.clone(),
        registry,
        audit.clone(),
        &settings,
    ));
    let loader = Arc::new(DirectoryLoader::new(&args.config_dir));
    let (agent, handle) = Agent::new(
        store.clone(),
        reconciler,
        loader,
        init,
        audit.clone(),
        settings.reconciliation_interval(),
    );

    // Config directory watcher, kept alive until shutdown
    let _watcher = if settings.watch_config {
        match ConfigWatcher::start(&args.config_dir, settings.watch_debounce(), handle.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config directory not watched, reload manually: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Control socket
    let server = ControlServer::bind(&settings, store, handle, audit)
        .await
        .with_context(|| format!("binding {}", settings.socket_path.display()))?;

    tokio::select! {
        result = server.run() => {
            result.context("control server failed")?;
        }
        result = agent.run() => {
            result.context("agent stopped")?;
        }
        result = dispatcher => {
            match result {
                Ok(Ok(())) => error!("Job notification channel closed"),
                Ok(Err(e)) => error!("Init system lost: {}", e),
                Err(e) => error!("Notification dispatcher panicked: {}", e),
            }
            anyhow::bail!("init system connection lost");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
