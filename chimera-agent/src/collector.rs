//! Observed-State Collector.
//!
//! Lists the managed units once, then queries each container on its own.
//! A failed detail query degrades that one container to
//! [`ActiveState::Unknown`] for this cycle; a unit that vanished between
//! listing and query is simply absent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ActiveState, ObservedContainer};
use crate::store::{Snapshot, StateStore};
use crate::systemd::InitSystem;

pub struct Collector {
    init: Arc<InitSystem>,
    store: Arc<StateStore>,
}

impl Collector {
    pub fn new(init: Arc<InitSystem>, store: Arc<StateStore>) -> Self {
        Self { init, store }
    }

    /// Build a point-in-time snapshot of every container on the host.
    pub async fn collect(&self) -> Result<Snapshot> {
        let names = self.init.list_containers().await?;
        let doc = self.store.desired();
        let declared = doc.containers(self.store.node());

        let mut containers = BTreeMap::new();
        for name in names {
            // Image trees live in the same machines directory.
            let is_container = declared.is_some_and(|c| c.contains_key(&name));
            if doc.images.contains_key(&name) && !is_container {
                continue;
            }
            if let Some(observed) = self.observe_one(&name).await {
                containers.insert(name, observed);
            }
        }

        debug!(containers = containers.len(), "Collection finished");
        Ok(Snapshot {
            taken_at: Some(Utc::now()),
            containers,
        })
    }

    /// Fresh observation of one container, `None` if it does not exist.
    pub async fn observe_one(&self, name: &str) -> Option<ObservedContainer> {
        match self.init.observe(name).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(name, "Status query failed: {}", e);
                Some(ObservedContainer::new(name, ActiveState::Unknown))
            }
        }
    }

    /// Collect and publish the snapshot to the store.
    pub async fn refresh(&self) -> Result<Snapshot> {
        let snapshot = self.collect().await?;
        self.store.apply_snapshot(&snapshot);
        Ok(snapshot)
    }
}
