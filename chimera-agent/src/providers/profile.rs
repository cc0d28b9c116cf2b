//! Profile provider: renders the `.nspawn` file and the unit drop-in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::template::{TemplateContext, render};
use super::{Provider, ProviderKind, ResourceStatus, Target};
use crate::config::{ProxySettings, SystemdPaths};
use crate::error::ProviderError;
use crate::host::HostRunner;
use crate::systemd::unit_name;

pub struct ProfileProvider {
    runner: Arc<dyn HostRunner>,
    paths: SystemdPaths,
    proxy: ProxySettings,
}

/// Rendered file bodies for one container.
struct Rendered {
    nspawn: String,
    dropin: String,
}

impl ProfileProvider {
    pub fn new(runner: Arc<dyn HostRunner>, paths: SystemdPaths, proxy: ProxySettings) -> Self {
        Self {
            runner,
            paths,
            proxy,
        }
    }

    pub fn nspawn_path(&self, name: &str) -> PathBuf {
        self.paths.nspawn_dir.join(format!("{name}.nspawn"))
    }

    pub fn dropin_dir(&self, name: &str) -> PathBuf {
        self.paths.system_dir.join(format!("{}.d", unit_name(name)))
    }

    pub fn dropin_path(&self, name: &str) -> PathBuf {
        self.dropin_dir(name).join("override.conf")
    }

    fn render(&self, target: &Target) -> Result<Rendered, ProviderError> {
        let profile = target.require_profile("render profile")?;
        let ctx = TemplateContext::new(&target.name, &self.proxy);
        Ok(Rendered {
            nspawn: render(&profile.nspawn_config, &ctx),
            dropin: render(&profile.systemd_override, &ctx),
        })
    }

    async fn snapshot(&self, name: &str) -> Result<Snapshot, ProviderError> {
        Ok(Snapshot {
            nspawn: read_optional(&self.nspawn_path(name)).await?,
            dropin: read_optional(&self.dropin_path(name)).await?,
        })
    }

    /// Put both files back the way `snapshot` found them.
    async fn restore(&self, name: &str, snapshot: &Snapshot) -> Result<(), ProviderError> {
        let files = [
            (self.nspawn_path(name), snapshot.nspawn.as_deref()),
            (self.dropin_path(name), snapshot.dropin.as_deref()),
        ];
        for (path, content) in files {
            if read_optional(&path).await?.as_deref() == content {
                continue;
            }
            match content {
                Some(content) => write_atomic(&path, content).await?,
                None => remove_if_exists(&path).await?,
            }
        }
        Ok(())
    }

    async fn write_rendered(&self, name: &str, rendered: &Rendered) -> Result<(), ProviderError> {
        write_atomic(&self.nspawn_path(name), &rendered.nspawn).await?;
        write_atomic(&self.dropin_path(name), &rendered.dropin).await?;
        self.daemon_reload().await
    }

    async fn daemon_reload(&self) -> Result<(), ProviderError> {
        let output = self.runner.run("systemctl", &["daemon-reload"]).await?;
        if !output.success() {
            return Err(ProviderError::retryable(
                "daemon-reload",
                output.stderr.trim(),
            ));
        }
        Ok(())
    }
}

/// File bodies as they were before a create, `None` where absent.
struct Snapshot {
    nspawn: Option<String>,
    dropin: Option<String>,
}

/// Write through a temporary file so readers never see a partial body.
async fn write_atomic(path: &Path, content: &str) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), ProviderError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ProviderError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Provider for ProfileProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Profile
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        let nspawn = read_optional(&self.nspawn_path(&target.name)).await?;
        let dropin = read_optional(&self.dropin_path(&target.name)).await?;
        let (nspawn, dropin) = match (nspawn, dropin) {
            (None, None) => return Ok(ResourceStatus::Absent),
            (Some(n), Some(d)) => (n, d),
            _ => return Ok(ResourceStatus::Drifted),
        };
        // Without a profile there is nothing to compare against.
        if target.profile.is_none() {
            return Ok(ResourceStatus::Present);
        }
        let rendered = self.render(target)?;
        if rendered.nspawn == nspawn && rendered.dropin == dropin {
            Ok(ResourceStatus::Present)
        } else {
            debug!(name = %target.name, "Profile files differ from rendered profile");
            Ok(ResourceStatus::Drifted)
        }
    }

    /// Write both files and reload, or leave them as they were.
    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        let rendered = self.render(target)?;
        let previous = self.snapshot(&target.name).await?;
        if let Err(e) = self.write_rendered(&target.name, &rendered).await {
            if let Err(restore) = self.restore(&target.name, &previous).await {
                warn!(name = %target.name, "Restoring profile files failed: {}", restore);
            }
            return Err(e);
        }
        info!(name = %target.name, "Profile applied");
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        remove_if_exists(&self.nspawn_path(&target.name)).await?;
        remove_if_exists(&self.dropin_path(&target.name)).await?;
        match tokio::fs::remove_dir(self.dropin_dir(&target.name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(name = %target.name, "Drop-in directory kept: {}", e),
        }
        self.daemon_reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::model::Profile;
    use crate::test_util::RecordingRunner;
    use tempfile::TempDir;

    fn setup() -> (ProfileProvider, Arc<RecordingRunner>, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = SystemdPaths {
            machines_dir: dir.path().join("machines"),
            nspawn_dir: dir.path().join("nspawn"),
            system_dir: dir.path().join("system"),
        };
        let runner = Arc::new(RecordingRunner::new());
        let provider = ProfileProvider::new(runner.clone(), paths, ProxySettings::default());
        (provider, runner, dir)
    }

    fn target(nspawn: &str) -> Target {
        Target {
            name: "web1".to_string(),
            profile: Some(Profile {
                name: "isolated".to_string(),
                description: None,
                nspawn_config: nspawn.to_string(),
                systemd_override: "[Service]\nEnvironment=NAME={{ container_name }}\n"
                    .to_string(),
            }),
            ..Target::default()
        }
    }

    #[tokio::test]
    async fn test_profile_files_written_and_idempotent() {
        let (provider, runner, _dir) = setup();
        let target = target("[Network]\nPrivate=no\n");

        assert!(provider.ensure_present(&target).await.unwrap());
        let dropin = std::fs::read_to_string(provider.dropin_path("web1")).unwrap();
        assert_eq!(dropin, "[Service]\nEnvironment=NAME=web1\n");
        assert!(provider.nspawn_path("web1").ends_with("nspawn/web1.nspawn"));
        assert!(
            provider
                .dropin_path("web1")
                .ends_with("system/systemd-nspawn@web1.service.d/override.conf")
        );

        assert!(!provider.ensure_present(&target).await.unwrap());
        assert_eq!(runner.calls(), vec!["systemctl daemon-reload"]);
    }

    #[tokio::test]
    async fn test_changed_profile_is_drift() {
        let (provider, _runner, _dir) = setup();
        provider.create(&target("[Network]\nPrivate=no\n")).await.unwrap();

        let changed = target("[Network]\nPrivate=yes\n");
        assert_eq!(
            provider.status(&changed).await.unwrap(),
            ResourceStatus::Drifted
        );
        assert!(provider.ensure_present(&changed).await.unwrap());
        assert_eq!(
            provider.status(&changed).await.unwrap(),
            ResourceStatus::Present
        );
    }

    #[tokio::test]
    async fn test_failed_rewrite_restores_previous_files() {
        let (provider, _runner, _dir) = setup();
        let before = target("[Network]\nPrivate=no\n");
        provider.create(&before).await.unwrap();
        let nspawn = std::fs::read_to_string(provider.nspawn_path("web1")).unwrap();
        let dropin = std::fs::read_to_string(provider.dropin_path("web1")).unwrap();

        // The drop-in write goes through override.tmp; a directory there
        // makes it fail after the .nspawn file was already replaced.
        std::fs::create_dir(provider.dropin_dir("web1").join("override.tmp")).unwrap();
        let mut changed = target("[Network]\nPrivate=yes\n");
        changed.profile.as_mut().unwrap().systemd_override = "[Service]\n".to_string();
        assert_eq!(
            provider.status(&changed).await.unwrap(),
            ResourceStatus::Drifted
        );
        assert!(provider.ensure_present(&changed).await.is_err());

        assert_eq!(
            std::fs::read_to_string(provider.nspawn_path("web1")).unwrap(),
            nspawn
        );
        assert_eq!(
            std::fs::read_to_string(provider.dropin_path("web1")).unwrap(),
            dropin
        );
        assert_eq!(
            provider.status(&before).await.unwrap(),
            ResourceStatus::Present
        );
    }

    #[tokio::test]
    async fn test_failed_reload_restores_previous_files() {
        let (provider, runner, _dir) = setup();
        let before = target("[Exec]\nBoot=yes\n");
        provider.create(&before).await.unwrap();

        runner.respond(
            "systemctl daemon-reload",
            CommandOutput::failed(1, "Access denied"),
        );
        let err = provider
            .ensure_present(&target("[Exec]\nBoot=no\n"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            std::fs::read_to_string(provider.nspawn_path("web1")).unwrap(),
            "[Exec]\nBoot=yes\n"
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_files() {
        let (provider, _runner, _dir) = setup();
        let target = target("[Exec]\n");
        provider.create(&target).await.unwrap();
        assert!(provider.ensure_absent(&Target::bare("web1")).await.unwrap());
        assert!(!provider.nspawn_path("web1").exists());
        assert!(!provider.dropin_dir("web1").exists());
        assert_eq!(
            provider.status(&target).await.unwrap(),
            ResourceStatus::Absent
        );
    }
}
