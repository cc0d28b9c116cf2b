//! Container provider: machine root filesystems cloned from images.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ExecOutput, Provider, ProviderKind, ResourceStatus, Target};
use crate::error::ProviderError;
use crate::host::HostRunner;
use crate::model::{CustomFile, CustomFileEnsure, ImageKind};

pub struct ContainerProvider {
    runner: Arc<dyn HostRunner>,
    machines_dir: PathBuf,
}

impl ContainerProvider {
    pub fn new(runner: Arc<dyn HostRunner>, machines_dir: PathBuf) -> Self {
        Self {
            runner,
            machines_dir,
        }
    }
}

/// Resolve `path` below `root`; anything that would leave it is refused.
fn contained(root: &Path, path: &str) -> Result<PathBuf, ProviderError> {
    let relative = Path::new(path.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(ProviderError::permanent(
            "custom file",
            format!("{path} is not below the container root"),
        ));
    }
    Ok(root.join(relative))
}

/// Remove a file, symlink or empty directory; missing is fine.
async fn remove_path(path: &Path) -> Result<(), ProviderError> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

async fn apply_custom_file(root: &Path, file: &CustomFile) -> Result<(), ProviderError> {
    let path = contained(root, &file.path)?;
    match file.ensure {
        CustomFileEnsure::Present => {}
        CustomFileEnsure::Absent => remove_path(&path).await?,
        CustomFileEnsure::Link => {
            let target = file.target.as_deref().ok_or_else(|| {
                ProviderError::permanent("custom file", format!("link {} has no target", file.path))
            })?;
            remove_path(&path).await?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::symlink(target, &path).await?;
        }
    }
    debug!(path = %path.display(), ensure = ?file.ensure, "Custom file applied");
    Ok(())
}

#[async_trait]
impl Provider for ContainerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    async fn status(&self, target: &Target) -> Result<ResourceStatus, ProviderError> {
        let output = self
            .runner
            .run("machinectl", &["show-image", target.name.as_str()])
            .await?;
        if output.success() {
            return Ok(ResourceStatus::Present);
        }
        // machined may not have indexed a fresh clone yet.
        let root = self.machines_dir.join(&target.name);
        if tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Ok(ResourceStatus::Present);
        }
        Ok(ResourceStatus::Absent)
    }

    async fn create(&self, target: &Target) -> Result<(), ProviderError> {
        let image = target.require_image("clone")?;
        info!(name = %target.name, image = %image.name, "Cloning container");
        let output = self
            .runner
            .run(
                "machinectl",
                &["clone", image.name.as_str(), target.name.as_str()],
            )
            .await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            // A missing source image will not appear by retrying.
            if stderr.contains("No image") {
                return Err(ProviderError::permanent("clone", stderr));
            }
            return Err(ProviderError::retryable("clone", stderr));
        }

        // Raw images are opaque disk files.
        if image.kind == ImageKind::Tar {
            let root = self.machines_dir.join(&target.name);
            for file in &image.custom_files {
                apply_custom_file(&root, file).await?;
            }
        }
        Ok(())
    }

    async fn destroy(&self, target: &Target) -> Result<(), ProviderError> {
        info!(name = %target.name, "Removing container");
        let output = self
            .runner
            .run("machinectl", &["remove", target.name.as_str()])
            .await?;
        if !output.success() && !output.stderr.contains("No image") {
            return Err(ProviderError::retryable("remove", output.stderr.trim()));
        }
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, ProviderError> {
        if argv.is_empty() {
            return Err(ProviderError::permanent("exec", "empty command"));
        }
        let machine = format!("--machine={name}");
        let mut args = vec![
            machine.as_str(),
            "--wait",
            "--pipe",
            "--quiet",
            "--collect",
            "--",
        ];
        args.extend(argv.iter().map(String::as_str));
        let output = self.runner.run("systemd-run", &args).await?;
        Ok(ExecOutput {
            exit_code: output.code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::model::Image;
    use crate::test_util::RecordingRunner;
    use tempfile::TempDir;

    fn target() -> Target {
        Target {
            name: "web1".to_string(),
            image: Some(Image {
                name: "ubuntu-24.04".to_string(),
                source: "https://example.org/u.tar".to_string(),
                ..Image::default()
            }),
            ..Target::default()
        }
    }

    #[tokio::test]
    async fn test_clone_when_absent() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("machinectl show-image", CommandOutput::failed(1, "No image"));
        let provider = ContainerProvider::new(runner.clone(), dir.path().to_path_buf());

        assert!(provider.ensure_present(&target()).await.unwrap());
        assert_eq!(
            runner.calls(),
            vec![
                "machinectl show-image web1",
                "machinectl clone ubuntu-24.04 web1",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_source_image_is_permanent() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("machinectl show-image", CommandOutput::failed(1, "No image"));
        runner.respond(
            "machinectl clone",
            CommandOutput::failed(1, "No image 'ubuntu-24.04' known"),
        );
        runner.respond("machinectl remove", CommandOutput::failed(1, "No image"));
        let provider = ContainerProvider::new(runner, dir.path().to_path_buf());

        let err = provider.ensure_present(&target()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_custom_files_applied_after_clone() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("web1");
        std::fs::create_dir_all(root.join("etc/motd.d")).unwrap();
        std::fs::write(root.join("etc/resolv.conf"), "nameserver 10.0.0.1\n").unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let provider = ContainerProvider::new(runner, dir.path().to_path_buf());

        let mut target = target();
        target.image.as_mut().unwrap().custom_files = vec![
            CustomFile {
                path: "/etc/resolv.conf".to_string(),
                ensure: CustomFileEnsure::Link,
                target: Some("../run/systemd/resolve/stub-resolv.conf".to_string()),
            },
            CustomFile {
                path: "etc/motd.d".to_string(),
                ensure: CustomFileEnsure::Absent,
                target: None,
            },
            CustomFile {
                path: "etc/machine-id".to_string(),
                ensure: CustomFileEnsure::Absent,
                target: None,
            },
            CustomFile {
                path: "usr/local/bin/python".to_string(),
                ensure: CustomFileEnsure::Link,
                target: Some("/usr/bin/python3".to_string()),
            },
        ];
        provider.create(&target).await.unwrap();

        assert_eq!(
            std::fs::read_link(root.join("etc/resolv.conf")).unwrap(),
            PathBuf::from("../run/systemd/resolve/stub-resolv.conf")
        );
        assert!(!root.join("etc/motd.d").exists());
        assert_eq!(
            std::fs::read_link(root.join("usr/local/bin/python")).unwrap(),
            PathBuf::from("/usr/bin/python3")
        );
    }

    #[tokio::test]
    async fn test_custom_file_outside_root_rolls_back_clone() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("machinectl show-image", CommandOutput::failed(1, "No image"));
        let provider = ContainerProvider::new(runner.clone(), dir.path().to_path_buf());

        let mut target = target();
        target.image.as_mut().unwrap().custom_files = vec![CustomFile {
            path: "../web2/etc/passwd".to_string(),
            ensure: CustomFileEnsure::Absent,
            target: None,
        }];
        let err = provider.ensure_present(&target).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(runner.calls().last().unwrap(), "machinectl remove web1");
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            "systemd-run",
            CommandOutput {
                code: Some(2),
                stdout: "out".to_string(),
                stderr: "err".to_string(),
            },
        );
        let provider = ContainerProvider::new(runner.clone(), dir.path().to_path_buf());

        let out = provider
            .exec("web1", &["ls".to_string(), "/nope".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.stdout, "out");
        assert_eq!(
            runner.calls(),
            vec!["systemd-run --machine=web1 --wait --pipe --quiet --collect -- ls /nope"]
        );
    }
}
