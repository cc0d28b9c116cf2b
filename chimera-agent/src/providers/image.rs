//! Image provider: root filesystem images pulled with `machinectl`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Provider, ProviderKind, ResourceStatus, Target};
use crate::error::ProviderError;
use crate::host::HostRunner;
use crate::model::ImagePresence;
use crate::store::StateStore;

pub struct ImageProvider {
    runner: Arc<dyn HostRunner>,
    store: Arc<StateStore>,
}

impl ImageProvider {
    pub fn new(runner: Arc<dyn HostRunner>, store: Arc<StateStore>) -> Self {
        Self { runner, store }
    }

    async fn machinectl(&self, operation: &str, args: &[&str]) -> Result<String, ProviderError> {
        let output = self.runner.run("machinectl", args).await?;
        if !output.success() {
            return Err(ProviderError::retryable(operation, output.stderr.trim()));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Provider for ImageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Image
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        let image = target.require_image("show-image")?;
        let output = self
            .runner
            .run("machinectl", &["show-image", image.name.as_str()])
            .await?;
        let status = if output.success() {
            ResourceStatus::Present
        } else {
            ResourceStatus::Absent
        };
        match (self.store.image_presence(&image.name), status) {
            (Some(ImagePresence::Pulling), _) => {}
            (_, ResourceStatus::Present) => {
                self.store
                    .set_image_presence(&image.name, ImagePresence::Present);
            }
            // A failed pull stays failed until the next attempt.
            (Some(ImagePresence::Failed), _) => {}
            _ => {
                self.store
                    .set_image_presence(&image.name, ImagePresence::Absent);
            }
        }
        Ok(status)
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        let image = target.require_image("pull")?;
        let verify = format!("--verify={}", image.verify.as_str());
        info!(image = %image.name, source = %image.source, "Pulling image");
        self.store
            .set_image_presence(&image.name, ImagePresence::Pulling);

        let pulled = self
            .machinectl(
                image.kind.pull_verb(),
                &[
                    image.kind.pull_verb(),
                    verify.as_str(),
                    image.source.as_str(),
                    image.name.as_str(),
                ],
            )
            .await;
        let result = match pulled {
            Ok(_) => self
                .machinectl("read-only", &["read-only", image.name.as_str(), "true"])
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                info!(image = %image.name, "Image pulled");
                self.store
                    .set_image_presence(&image.name, ImagePresence::Present);
            }
            Err(e) => {
                warn!(image = %image.name, "Image pull failed: {}", e);
                self.store
                    .set_image_presence(&image.name, ImagePresence::Failed);
            }
        }
        result
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        let image = target.require_image("remove")?;
        let output = self
            .runner
            .run("machinectl", &["remove", image.name.as_str()])
            .await?;
        if !output.success() && !output.stderr.contains("No image") {
            return Err(ProviderError::retryable("remove", output.stderr.trim()));
        }
        Ok(())
    }
}
