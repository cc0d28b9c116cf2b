//! Cloud-init provider: writes a NoCloud seed into the container root.
//!
//! The seed is rendered once at creation. It is never re-applied on
//! restart, and raw images, which cannot be written into from the host,
//! skip it.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::template::{TemplateContext, merge, render};
use super::{Provider, ProviderKind, ResourceStatus, Target};
use crate::config::ProxySettings;
use crate::error::ProviderError;
use crate::model::{CloudInitDocument, CloudInitRef, ImageKind};

const SEED_DIR: &str = "var/lib/cloud/seed/nocloud";
const DISABLE_NETWORK: &str = "etc/cloud/cloud.cfg.d/99-disable-network-config.cfg";

/// A template merged with a container's own overrides, not yet rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudInitSeed {
    pub meta_data: Map<String, Value>,
    pub user_data: Option<String>,
    pub network_config: Option<String>,
}

impl CloudInitSeed {
    /// Deep merge `overrides` over `template`.
    pub fn merge(template: Option<&CloudInitDocument>, overrides: &CloudInitRef) -> Self {
        let mut seed = match template {
            Some(t) => Self {
                meta_data: t.meta_data.clone(),
                user_data: t.user_data.clone(),
                network_config: t.network_config.clone(),
            },
            None => Self::default(),
        };
        merge(&mut seed.meta_data, &overrides.meta_data);
        if overrides.user_data.is_some() {
            seed.user_data = overrides.user_data.clone();
        }
        if overrides.network_config.is_some() {
            seed.network_config = overrides.network_config.clone();
        }
        seed
    }

    /// `meta-data` with the hostname forced and an instance id defaulted.
    pub fn meta_data_for(&self, name: &str) -> Map<String, Value> {
        let mut meta = self.meta_data.clone();
        meta.insert("local-hostname".to_string(), Value::String(name.to_string()));
        meta.entry("instance-id")
            .or_insert_with(|| Value::String(format!("iid-{name}")));
        meta
    }
}

pub struct CloudInitProvider {
    machines_dir: PathBuf,
    proxy: ProxySettings,
}

impl CloudInitProvider {
    pub fn new(machines_dir: PathBuf, proxy: ProxySettings) -> Self {
        Self {
            machines_dir,
            proxy,
        }
    }

    fn root(&self, name: &str) -> PathBuf {
        self.machines_dir.join(name)
    }

    pub fn seed_dir(&self, name: &str) -> PathBuf {
        self.root(name).join(SEED_DIR)
    }

    fn applies_to(target: &Target) -> bool {
        let raw = target
            .image
            .as_ref()
            .is_some_and(|image| image.kind == ImageKind::Raw);
        target.cloud_init.is_some() && !raw
    }
}

#[async_trait]
impl Provider for CloudInitProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudInit
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        if !Self::applies_to(target) {
            // Nothing to write counts as converged.
            return Ok(ResourceStatus::Present);
        }
        let present = tokio::fs::try_exists(self.seed_dir(&target.name).join("meta-data")).await?;
        Ok(if present {
            ResourceStatus::Present
        } else {
            ResourceStatus::Absent
        })
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        let Some(seed) = &target.cloud_init else {
            return Ok(());
        };
        let seed_dir = self.seed_dir(&target.name);
        tokio::fs::create_dir_all(&seed_dir).await?;

        let meta = serde_yaml::to_string(&seed.meta_data_for(&target.name))
            .map_err(|e| ProviderError::permanent("render meta-data", e.to_string()))?;
        tokio::fs::write(seed_dir.join("meta-data"), meta).await?;

        if let Some(user_data) = &seed.user_data {
            let ctx = TemplateContext::new(&target.name, &self.proxy);
            tokio::fs::write(seed_dir.join("user-data"), render(user_data, &ctx)).await?;
        }

        match &seed.network_config {
            Some(network) => {
                tokio::fs::write(seed_dir.join("network-config"), network).await?;
            }
            None => {
                let disable = self.root(&target.name).join(DISABLE_NETWORK);
                if let Some(parent) = disable.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&disable, "network: {config: disabled}\n").await?;
                debug!(name = %target.name, "Disabled cloud-init network config");
            }
        }
        info!(name = %target.name, "Cloud-init seed written");
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        let cloud_dir = self.root(&target.name).join("var/lib/cloud");
        match tokio::fs::remove_dir_all(&cloud_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
