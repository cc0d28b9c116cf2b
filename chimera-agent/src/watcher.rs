//! Config directory watcher.
//!
//! Reloads the desired state when files under the config directory
//! change. A burst of events, such as an editor writing a temporary file
//! and renaming it, is folded into one reload once the directory has been
//! quiet for the debounce period.

use std::path::Path;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::AgentHandle;

/// Watches a directory for as long as it is alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `dir`. Must be called inside a tokio runtime.
    pub fn start(dir: &Path, debounce: Duration, agent: AgentHandle) -> notify::Result<Self> {
        // One slot: a full channel already means a reload is pending.
        let (tx, rx) = mpsc::channel(1);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_change(&event) => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Config watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::Recursive)?;
        info!(dir = %dir.display(), "Watching config directory");

        let task = tokio::spawn(reload_loop(rx, debounce, agent));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_change(event: &Event) -> bool {
    event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()
}

async fn reload_loop(mut rx: mpsc::Receiver<()>, debounce: Duration, agent: AgentHandle) {
    while rx.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        info!("Config directory changed, reloading");
        match agent.reload().await {
            Ok(report) => debug!(
                generation = report.generation,
                actions = report.actions.len(),
                "Reload after config change finished"
            ),
            Err(e) => warn!("Reload after config change failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestStack, sample_document};
    use tempfile::TempDir;

    async fn wait_for_generation(stack: &TestStack, generation: u64) -> bool {
        for _ in 0..150 {
            if stack.store.generation() >= generation {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_burst_of_changes_reloads_once() {
        let dir = TempDir::new().unwrap();
        let stack = TestStack::start(sample_document("host1")).await;
        assert_eq!(stack.store.generation(), 1);
        let _watcher =
            ConfigWatcher::start(dir.path(), Duration::from_millis(150), stack.handle.clone())
                .unwrap();

        for i in 0..3 {
            std::fs::write(dir.path().join(format!("nodes-{i}.yaml")), "nodes: {}\n").unwrap();
        }

        assert!(wait_for_generation(&stack, 2).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stack.store.generation(), 2);
    }

    #[tokio::test]
    async fn test_dropped_watcher_stops_reloading() {
        let dir = TempDir::new().unwrap();
        let stack = TestStack::start(sample_document("host1")).await;
        let watcher =
            ConfigWatcher::start(dir.path(), Duration::from_millis(50), stack.handle.clone())
                .unwrap();
        drop(watcher);

        std::fs::write(dir.path().join("images.yaml"), "images: {}\n").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(stack.store.generation(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let stack = TestStack::start(sample_document("host1")).await;
        let result = ConfigWatcher::start(
            &dir.path().join("missing"),
            Duration::from_millis(50),
            stack.handle.clone(),
        );
        assert!(result.is_err());
    }
}
