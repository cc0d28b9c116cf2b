//! Agent settings and the desired-state document loader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::model::{CloudInitDocument, ContainerSpec, DesiredDocument, Image, Profile};

/// What to do with containers found on the host but never declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmanagedPolicy {
    /// Never touched, never reported.
    #[default]
    Ignore,
    /// Recorded as `extra` drift, never acted on.
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub socket_gid: Option<u32>,
    pub state_dir: PathBuf,
    pub node_name: Option<String>,
    /// Seconds between periodic passes.
    pub reconciliation_interval: u64,
    /// Seconds one init-system job may take.
    pub job_timeout: u64,
    /// Seconds one mutating request may take.
    pub request_timeout: u64,
    pub max_inflight_actions: usize,
    pub max_connections: usize,
    pub privileged_uids: Vec<u32>,
    pub privileged_gid: Option<u32>,
    pub unmanaged: UnmanagedPolicy,
    pub log_level: String,
    pub retry: RetrySettings,
    /// Reload when files under the config directory change.
    pub watch_config: bool,
    /// Quiet period folding a burst of file events into one reload.
    pub watch_debounce_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/chimera/agent.sock"),
            socket_mode: 0o660,
            socket_gid: None,
            state_dir: PathBuf::from("/var/lib/chimera"),
            node_name: None,
            reconciliation_interval: 30,
            job_timeout: 90,
            request_timeout: 300,
            max_inflight_actions: 4,
            max_connections: 64,
            privileged_uids: vec![0],
            privileged_gid: None,
            unmanaged: UnmanagedPolicy::Ignore,
            log_level: "info".to_string(),
            retry: RetrySettings::default(),
            watch_config: true,
            watch_debounce_ms: 500,
        }
    }
}

impl AgentSettings {
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Configured node name, falling back to the hostname.
    pub fn node_name(&self) -> String {
        self.node_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        })
    }
}

/// Host paths used by systemd-nspawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdPaths {
    pub machines_dir: PathBuf,
    pub nspawn_dir: PathBuf,
    pub system_dir: PathBuf,
}

impl Default for SystemdPaths {
    fn default() -> Self {
        Self {
            machines_dir: PathBuf::from("/var/lib/machines"),
            nspawn_dir: PathBuf::from("/etc/systemd/nspawn"),
            system_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

/// Proxy values exposed to profile and cloud-init templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            no_proxy: Some("localhost,127.0.0.1".to_string()),
        }
    }
}

/// Contents of `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChimeraConfig {
    pub agent: AgentSettings,
    pub systemd: SystemdPaths,
    pub proxy: ProxySettings,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl ChimeraConfig {
    /// Load and validate settings. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Self::default(),
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if agent.reconciliation_interval < 5 {
            return Err(ConfigError::Invalid(format!(
                "reconciliation_interval must be at least 5 seconds, got {}",
                agent.reconciliation_interval
            )));
        }
        if agent.job_timeout == 0 || agent.request_timeout == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if agent.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if agent.max_inflight_actions == 0 || agent.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "concurrency limits must be non-zero".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&agent.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level '{}'",
                agent.log_level
            )));
        }
        Ok(())
    }
}

/// Supplies the desired-state document.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self) -> Result<DesiredDocument, ConfigError>;
}

#[derive(Debug, Default, Deserialize)]
struct NodeFile {
    #[serde(default)]
    containers: BTreeMap<String, ContainerSpec>,
}

/// Reads `images/`, `profiles/`, `cloud-init/` and `nodes/` under a
/// config directory.
pub struct DirectoryLoader {
    config_dir: PathBuf,
}

impl DirectoryLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Sorted `*.yaml`/`*.yml` files of `dir`; empty if it does not exist.
    async fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "Config directory not found");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut files = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_yaml::from_str::<Option<T>>(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Merge every file of `subdir` into one name-keyed map.
    async fn load_named<T: DeserializeOwned>(
        &self,
        subdir: &str,
    ) -> Result<BTreeMap<String, T>, ConfigError> {
        let mut merged = BTreeMap::new();
        for path in Self::yaml_files(&self.config_dir.join(subdir)).await? {
            if let Some(map) = Self::parse_file::<BTreeMap<String, T>>(&path).await? {
                debug!(path = %path.display(), entries = map.len(), "Loaded {}", subdir);
                merged.extend(map);
            }
        }
        Ok(merged)
    }
}

#[async_trait]
impl ConfigLoader for DirectoryLoader {
    async fn load(&self) -> Result<DesiredDocument, ConfigError> {
        let mut images: BTreeMap<String, Image> = self.load_named("images").await?;
        for (name, image) in images.iter_mut() {
            image.name = name.clone();
        }

        let mut profiles: BTreeMap<String, Profile> = self.load_named("profiles").await?;
        for (name, profile) in profiles.iter_mut() {
            profile.name = name.clone();
        }

        let cloud_init: BTreeMap<String, CloudInitDocument> =
            self.load_named("cloud-init").await?;

        let mut nodes = BTreeMap::new();
        for path in Self::yaml_files(&self.config_dir.join("nodes")).await? {
            let Some(node) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let file = Self::parse_file::<NodeFile>(&path).await?.unwrap_or_default();
            let mut containers = file.containers;
            for (name, spec) in containers.iter_mut() {
                spec.name = name.clone();
            }
            nodes.insert(node, containers);
        }

        info!(
            "Loaded desired state (nodes={}, images={}, profiles={}, cloud_init={})",
            nodes.len(),
            images.len(),
            profiles.len(),
            cloud_init.len()
        );

        Ok(DesiredDocument {
            generation: 0,
            nodes,
            profiles,
            images,
            cloud_init,
        })
    }
}
