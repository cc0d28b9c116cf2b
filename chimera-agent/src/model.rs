//! Desired and observed state types shared by every component.
//!
//! Desired-side types deserialize straight from the YAML documents the
//! config loader reads; observed-side types are rebuilt by every collection
//! cycle and never partially mutated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_profile() -> String {
    "isolated".to_string()
}

fn default_true() -> bool {
    true
}

/// Whether a container should exist at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

/// Requested activation state of an existing container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Running,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-container cloud-init settings, optionally layered over a named template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitRef {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub meta_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub network_config: Option<String>,
}

/// Desired state of one container on this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Filled in from the map key by the loader.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ensure: Ensure,
    #[serde(default)]
    pub state: RunState,
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub cloud_init: Option<CloudInitRef>,
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Generation of the document this spec came from.
    #[serde(default)]
    pub generation: u64,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensure: Ensure::Present,
            state: RunState::Running,
            image: image.into(),
            profile: default_profile(),
            cloud_init: None,
            autostart: true,
            generation: 0,
        }
    }

    /// A spec carrying nothing but the intent to remove `name`.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            ensure: Ensure::Absent,
            ..Self::new(name, "")
        }
    }
}

/// Activation state of a unit as reported by the init system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveState {
    Active,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    /// The status query itself failed this cycle.
    Unknown,
}

impl ActiveState {
    pub fn from_systemd(value: &str) -> Self {
        match value.trim() {
            "active" | "reloading" => ActiveState::Active,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            "activating" => ActiveState::Activating,
            "deactivating" => ActiveState::Deactivating,
            _ => ActiveState::Unknown,
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, ActiveState::Activating | ActiveState::Deactivating)
    }

    /// Whether this state satisfies the requested run state.
    pub fn satisfies(&self, state: RunState) -> bool {
        match state {
            RunState::Running => *self == ActiveState::Active,
            RunState::Stopped => matches!(self, ActiveState::Inactive | ActiveState::Failed),
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActiveState::Active => "active",
            ActiveState::Inactive => "inactive",
            ActiveState::Failed => "failed",
            ActiveState::Activating => "activating",
            ActiveState::Deactivating => "deactivating",
            ActiveState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Live state of one container at collection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedContainer {
    pub name: String,
    pub exists: bool,
    pub active: ActiveState,
    pub observed_at: DateTime<Utc>,
}

impl ObservedContainer {
    pub fn new(name: impl Into<String>, active: ActiveState) -> Self {
        Self {
            name: name.into(),
            exists: true,
            active,
            observed_at: Utc::now(),
        }
    }
}

/// Named bundle of nspawn and unit settings applied at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Body of `<name>.nspawn`.
    #[serde(default)]
    pub nspawn_config: String,
    /// Body of the unit drop-in `override.conf`.
    #[serde(default)]
    pub systemd_override: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    #[default]
    Tar,
    Raw,
}

impl ImageKind {
    pub fn pull_verb(&self) -> &'static str {
        match self {
            ImageKind::Tar => "pull-tar",
            ImageKind::Raw => "pull-raw",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    Signature,
    Checksum,
    No,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::Signature => "signature",
            VerifyMode::Checksum => "checksum",
            VerifyMode::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomFileEnsure {
    /// Left as the image ships it.
    Present,
    Absent,
    Link,
}

/// Change applied to a fresh clone of a tar image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomFile {
    /// Relative to the container root.
    pub path: String,
    pub ensure: CustomFileEnsure,
    /// Symlink target, required for `link`.
    #[serde(default)]
    pub target: Option<String>,
}

/// Named reference to a root filesystem source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ImageKind,
    pub source: String,
    #[serde(default)]
    pub verify: VerifyMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_files: Vec<CustomFile>,
}

/// Presence of an image on the host, tracked independently of containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagePresence {
    Absent,
    Pulling,
    Present,
    Failed,
}

/// Cloud-init template as loaded from `cloud-init/*.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitDocument {
    #[serde(default)]
    pub meta_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub network_config: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftReason {
    Missing,
    Extra,
    StateMismatch,
    ConfigMismatch,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftReason::Missing => "missing",
            DriftReason::Extra => "extra",
            DriftReason::StateMismatch => "state-mismatch",
            DriftReason::ConfigMismatch => "config-mismatch",
        };
        write!(f, "{s}")
    }
}

/// A persisted mismatch between desired and observed state for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftRecord {
    pub name: String,
    pub reason: DriftReason,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attempts spent on the last failed action.
    pub attempts: u32,
    /// Retries are exhausted; not re-planned until `generation` changes or a
    /// user command targets the container.
    pub permanent: bool,
    pub generation: u64,
}

impl DriftRecord {
    pub fn new(name: impl Into<String>, reason: DriftReason, detail: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            reason,
            detail: detail.into(),
            detected_at: now,
            updated_at: now,
            attempts: 0,
            permanent: false,
            generation: 0,
        }
    }
}

/// Immutable desired-state document. Replaced wholesale on reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredDocument {
    pub generation: u64,
    /// Node name to the containers declared for it.
    pub nodes: BTreeMap<String, BTreeMap<String, ContainerSpec>>,
    pub profiles: BTreeMap<String, Profile>,
    pub images: BTreeMap<String, Image>,
    pub cloud_init: BTreeMap<String, CloudInitDocument>,
}

impl DesiredDocument {
    pub fn containers(&self, node: &str) -> Option<&BTreeMap<String, ContainerSpec>> {
        self.nodes.get(node)
    }

    pub fn container(&self, node: &str, name: &str) -> Option<&ContainerSpec> {
        self.nodes.get(node).and_then(|c| c.get(name))
    }

    /// Stamp the document and every spec in it with `generation`.
    pub fn stamp(&mut self, generation: u64) {
        self.generation = generation;
        for spec in self.nodes.values_mut().flat_map(|c| c.values_mut()) {
            spec.generation = generation;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_defaults() {
        let spec: ContainerSpec = serde_yaml::from_str("image: ubuntu-24.04").unwrap();
        assert_eq!(spec.ensure, Ensure::Present);
        assert_eq!(spec.state, RunState::Running);
        assert_eq!(spec.profile, "isolated");
        assert!(spec.autostart);
        assert!(spec.cloud_init.is_none());
    }

    #[test]
    fn test_active_state_parsing() {
        assert_eq!(ActiveState::from_systemd("active"), ActiveState::Active);
        assert_eq!(ActiveState::from_systemd("failed\n"), ActiveState::Failed);
        assert_eq!(ActiveState::from_systemd("bogus"), ActiveState::Unknown);
        assert!(ActiveState::Activating.is_transitional());
        assert!(ActiveState::Failed.satisfies(RunState::Stopped));
        assert!(!ActiveState::Inactive.satisfies(RunState::Running));
    }

    #[test]
    fn test_image_yaml() {
        let image: Image =
            serde_yaml::from_str("type: raw\nsource: https://example.org/a.raw\nverify: no")
                .unwrap();
        assert_eq!(image.kind, ImageKind::Raw);
        assert_eq!(image.verify, VerifyMode::No);
        assert_eq!(image.kind.pull_verb(), "pull-raw");
        assert!(image.custom_files.is_empty());
    }

    #[test]
    fn test_image_custom_files_yaml() {
        let yaml = "source: https://example.org/a.tar\ncustom_files:\n  - path: etc/resolv.conf\n    ensure: link\n    target: ../run/systemd/resolve/stub-resolv.conf\n  - path: etc/machine-id\n    ensure: absent\n";
        let image: Image = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(image.custom_files.len(), 2);
        assert_eq!(image.custom_files[0].ensure, CustomFileEnsure::Link);
        assert_eq!(image.custom_files[1].target, None);

        let bad = "source: x\ncustom_files:\n  - path: a\n    ensure: absent\n    mode: 644\n";
        assert!(serde_yaml::from_str::<Image>(bad).is_err());
    }

    #[test]
    fn test_drift_reason_wire_names() {
        let json = serde_json::to_string(&DriftReason::StateMismatch).unwrap();
        assert_eq!(json, "\"state-mismatch\"");
    }
}
