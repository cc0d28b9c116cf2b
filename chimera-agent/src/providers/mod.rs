//! Provider Registry.
//!
//! One provider per resource kind, all behind the same contract. The
//! reconciler resolves a container into a [`Target`] and hands it to the
//! [`Registry`], which walks the providers in creation or teardown order.

mod cloudinit;
mod container;
mod image;
mod profile;
pub mod template;

pub use cloudinit::{CloudInitProvider, CloudInitSeed};
pub use container::ContainerProvider;
pub use image::ImageProvider;
pub use profile::ProfileProvider;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ChimeraConfig;
use crate::error::{AgentError, ProviderError};
use crate::host::HostRunner;
use crate::model::{ContainerSpec, DesiredDocument, Image, Profile};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Image,
    Profile,
    Container,
    CloudInit,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Image => "image",
            ProviderKind::Profile => "profile",
            ProviderKind::Container => "container",
            ProviderKind::CloudInit => "cloud-init",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which a container's own resources are brought up. Images are
/// shared and ensured once per image before any container needs them.
pub const CREATE_ORDER: [ProviderKind; 3] = [
    ProviderKind::Profile,
    ProviderKind::Container,
    ProviderKind::CloudInit,
];

/// Order in which a container's resources are torn down. Images are shared
/// and outlive their containers.
pub const TEARDOWN_ORDER: [ProviderKind; 2] = [ProviderKind::Container, ProviderKind::Profile];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Present,
    Absent,
    /// Exists, but differs from what the target asks for.
    Drifted,
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Everything the providers need to act on one container, with every
/// reference already resolved.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub name: String,
    pub image: Option<Image>,
    pub profile: Option<Profile>,
    pub cloud_init: Option<CloudInitSeed>,
}

impl Target {
    /// A target carrying only a name, enough for teardown.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// An image on its own, as used by `image pull`.
    pub fn image(image: Image) -> Self {
        Self {
            name: image.name.clone(),
            image: Some(image),
            ..Self::default()
        }
    }

    /// Resolve the image, profile and cloud-init references of `spec`.
    pub fn resolve(doc: &DesiredDocument, spec: &ContainerSpec) -> Result<Self, AgentError> {
        let unresolved = |kind: &'static str, reference: &str| AgentError::ConfigResolution {
            container: spec.name.clone(),
            kind,
            reference: reference.to_string(),
        };

        let image = doc
            .images
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| unresolved("image", spec.image.as_str()))?;
        let profile = doc
            .profiles
            .get(&spec.profile)
            .cloned()
            .ok_or_else(|| unresolved("profile", spec.profile.as_str()))?;
        let cloud_init = match &spec.cloud_init {
            Some(ci) => {
                let template = match &ci.template {
                    Some(name) => Some(
                        doc.cloud_init
                            .get(name)
                            .ok_or_else(|| unresolved("cloud-init template", name.as_str()))?,
                    ),
                    None => None,
                };
                Some(CloudInitSeed::merge(template, ci))
            }
            None => None,
        };

        Ok(Self {
            name: spec.name.clone(),
            image: Some(image),
            profile: Some(profile),
            cloud_init,
        })
    }

    fn require_image(&self, operation: &str) -> Result<&Image, ProviderError> {
        self.image
            .as_ref()
            .ok_or_else(|| ProviderError::permanent(operation, format!("{} has no image", self.name)))
    }

    fn require_profile(&self, operation: &str) -> Result<&Profile, ProviderError> {
        self.profile.as_ref().ok_or_else(|| {
            ProviderError::permanent(operation, format!("{} has no profile", self.name))
        })
    }
}

/// Lifecycle contract shared by every resource kind.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError>;

    async fn create(&self, target: &Target) -> Result<(), ProviderError>;

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError>;

    /// Create the resource unless present. A failed create from nothing is
    /// rolled back before the error is returned; a provider whose resource
    /// can be `Drifted` restores the previous content inside `create`.
    /// Returns whether anything changed.
    async fn ensure_present(&self, target: &Target) -> Result<bool, ProviderError> {
        let prior = self.status(target).await?;
        if prior == ResourceStatus::Present {
            return Ok(false);
        }
        debug!(kind = %self.kind(), name = %target.name, ?prior, "Creating resource");
        if let Err(e) = self.create(target).await {
            if prior == ResourceStatus::Absent {
                if let Err(rollback) = self.destroy(target).await {
                    warn!(kind = %self.kind(), name = %target.name, "Rollback failed: {}", rollback);
                }
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn ensure_absent(&self, target: &Target) -> Result<bool, ProviderError> {
        if self.status(target).await? == ResourceStatus::Absent {
            return Ok(false);
        }
        debug!(kind = %self.kind(), name = %target.name, "Destroying resource");
        self.destroy(target).await?;
        Ok(true)
    }

    async fn exec(&self, _name: &str, _argv: &[String]) -> Result<ExecOutput, ProviderError> {
        Err(ProviderError::Unsupported(self.kind().as_str()))
    }
}

/// Providers keyed by kind.
#[derive(Default)]
pub struct Registry {
    providers: BTreeMap<ProviderKind, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four host-backed providers.
    pub fn host(
        runner: Arc<dyn HostRunner>,
        store: Arc<StateStore>,
        config: &ChimeraConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ImageProvider::new(Arc::clone(&runner), store)));
        registry.register(Arc::new(ProfileProvider::new(
            Arc::clone(&runner),
            config.systemd.clone(),
            config.proxy.clone(),
        )));
        registry.register(Arc::new(ContainerProvider::new(
            runner,
            config.systemd.machines_dir.clone(),
        )));
        registry.register(Arc::new(CloudInitProvider::new(
            config.systemd.machines_dir.clone(),
            config.proxy.clone(),
        )));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn Provider>> {
        self.providers.get(&kind)
    }

    fn require(&self, kind: ProviderKind) -> Result<&Arc<dyn Provider>, ProviderError> {
        self.get(kind).ok_or_else(|| {
            ProviderError::permanent("lookup", format!("no {kind} provider registered"))
        })
    }

    /// Bring the container's own resources up in creation order. On
    /// failure, resources created by this call are torn down again.
    pub async fn ensure_present(&self, target: &Target) -> Result<(), ProviderError> {
        let mut created = Vec::new();
        for kind in CREATE_ORDER {
            let Some(provider) = self.get(kind) else {
                continue;
            };
            match provider.ensure_present(target).await {
                Ok(true) => created.push(kind),
                Ok(false) => {}
                Err(e) => {
                    for done in created.iter().rev() {
                        if let Some(p) = self.get(*done) {
                            if let Err(rollback) = p.destroy(target).await {
                                warn!(kind = %done, name = %target.name, "Rollback failed: {}", rollback);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Tear down every resource of the container in teardown order.
    pub async fn ensure_absent(&self, target: &Target) -> Result<(), ProviderError> {
        for kind in TEARDOWN_ORDER {
            if let Some(provider) = self.get(kind) {
                provider.ensure_absent(target).await?;
            }
        }
        Ok(())
    }

    /// Status of one resource kind for `target`.
    pub async fn status(
        &self,
        kind: ProviderKind,
        target: &Target,
    ) -> Result<ResourceStatus, ProviderError> {
        self.require(kind)?.status(target).await
    }

    /// Ensure a single resource kind of `target`.
    pub async fn ensure_one(&self, kind: ProviderKind, target: &Target) -> Result<bool, ProviderError> {
        self.require(kind)?.ensure_present(target).await
    }

    /// Pull `image` unless present. Returns whether it was pulled.
    pub async fn ensure_image(&self, image: &Image) -> Result<bool, ProviderError> {
        self.ensure_one(ProviderKind::Image, &Target::image(image.clone()))
            .await
    }

    pub async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, ProviderError> {
        self.require(ProviderKind::Container)?.exec(name, argv).await
    }
}
