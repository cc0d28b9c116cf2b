//! State Store: the single authoritative holder of desired and observed state.
//!
//! The desired document sits behind an `ArcSwap` and is replaced wholesale.
//! Observed state and drift live in per-container entries, each behind its
//! own mutex, so a slow action on one name never blocks another. All locks
//! here are `std::sync` locks held for a few instructions and never across
//! an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::model::{
    ContainerSpec, DesiredDocument, DriftRecord, Ensure, ImagePresence, ObservedContainer,
    RunState,
};

const GENERATION_FILE: &str = "generation";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observed state and drift slot of one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerEntry {
    pub observed: Option<ObservedContainer>,
    pub drift: Option<DriftRecord>,
}

/// A user-requested intent layered over the document's spec until reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intent {
    pub ensure: Ensure,
    pub state: RunState,
}

/// Point-in-time result of one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub containers: BTreeMap<String, ObservedContainer>,
}

/// Read-only view of one container, merged from desired, observed and drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerView {
    pub name: String,
    pub desired: Option<ContainerSpec>,
    pub observed: Option<ObservedContainer>,
    pub drift: Option<DriftRecord>,
    pub managed: bool,
}

impl ContainerView {
    /// Short human state: the observed activation state or `missing`.
    pub fn state(&self) -> String {
        match &self.observed {
            Some(o) if o.exists => o.active.to_string(),
            _ => "missing".to_string(),
        }
    }
}

/// Reserves a name for one in-flight operation. Released on drop.
#[derive(Debug)]
pub struct Claim {
    store: Arc<StateStore>,
    key: String,
}

impl Claim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.store.claims).remove(&self.key);
    }
}

#[derive(Debug)]
pub struct StateStore {
    node: String,
    state_dir: Option<PathBuf>,
    desired: ArcSwap<DesiredDocument>,
    generation: AtomicU64,
    entries: RwLock<HashMap<String, Arc<Mutex<ContainerEntry>>>>,
    last_collection: Mutex<Option<DateTime<Utc>>>,
    last_pass: Mutex<Option<DateTime<Utc>>>,
    overrides: Mutex<HashMap<String, Intent>>,
    managed: Mutex<HashSet<String>>,
    claims: Mutex<HashSet<String>>,
    images: Mutex<HashMap<String, ImagePresence>>,
}

impl StateStore {
    /// Create a store. With a `state_dir`, the last applied generation is
    /// read from and persisted to `<state_dir>/generation`.
    pub fn new(node: impl Into<String>, state_dir: Option<PathBuf>) -> Self {
        let persisted = state_dir
            .as_ref()
            .and_then(|dir| std::fs::read_to_string(dir.join(GENERATION_FILE)).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Self {
            node: node.into(),
            state_dir,
            desired: ArcSwap::from_pointee(DesiredDocument::default()),
            generation: AtomicU64::new(persisted),
            entries: RwLock::new(HashMap::new()),
            last_collection: Mutex::new(None),
            last_pass: Mutex::new(None),
            overrides: Mutex::new(HashMap::new()),
            managed: Mutex::new(HashSet::new()),
            claims: Mutex::new(HashSet::new()),
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn desired(&self) -> Arc<DesiredDocument> {
        self.desired.load_full()
    }

    // === Desired state ===

    /// Stamp `doc` with the next generation and make it current. Clears
    /// intent overrides and drift of names the new document no longer
    /// declares.
    pub fn apply_document(&self, mut doc: DesiredDocument) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        doc.stamp(generation);

        let declared: HashSet<String> = doc
            .containers(&self.node)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        {
            let mut managed = lock(&self.managed);
            if let Some(containers) = doc.containers(&self.node) {
                managed.extend(
                    containers
                        .values()
                        .filter(|s| s.ensure == Ensure::Present)
                        .map(|s| s.name.clone()),
                );
            }
        }
        lock(&self.overrides).clear();
        self.desired.store(Arc::new(doc));

        for (name, entry) in self.entry_list() {
            if !declared.contains(&name) {
                let mut entry = lock(&entry);
                if entry.observed.is_none() {
                    entry.drift = None;
                }
            }
        }
        self.prune_entries();
        self.persist_generation(generation);
        generation
    }

    fn persist_generation(&self, generation: u64) {
        let Some(dir) = &self.state_dir else { return };
        let result = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(dir.join(GENERATION_FILE), generation.to_string()));
        if let Err(e) = result {
            warn!(dir = %dir.display(), "Failed to persist generation {}: {}", generation, e);
        }
    }

    /// Containers declared for this node with intent overrides applied.
    /// Override-only names appear when they ask for removal.
    pub fn desired_containers(&self) -> BTreeMap<String, ContainerSpec> {
        let doc = self.desired();
        let mut containers = doc.containers(&self.node).cloned().unwrap_or_default();
        let overrides = lock(&self.overrides).clone();
        for (name, intent) in overrides {
            match containers.get_mut(&name) {
                Some(spec) => {
                    spec.ensure = intent.ensure;
                    spec.state = intent.state;
                }
                None if intent.ensure == Ensure::Absent => {
                    let mut spec = ContainerSpec::absent(name.clone());
                    spec.generation = doc.generation;
                    containers.insert(name, spec);
                }
                None => {}
            }
        }
        containers
    }

    /// One entry of [`desired_containers`](Self::desired_containers).
    pub fn desired_container(&self, name: &str) -> Option<ContainerSpec> {
        let doc = self.desired.load();
        let intent = lock(&self.overrides).get(name).copied();
        match (doc.container(&self.node, name), intent) {
            (Some(spec), None) => Some(spec.clone()),
            (Some(spec), Some(intent)) => Some(ContainerSpec {
                ensure: intent.ensure,
                state: intent.state,
                ..spec.clone()
            }),
            (None, Some(intent)) if intent.ensure == Ensure::Absent => {
                let mut spec = ContainerSpec::absent(name);
                spec.generation = doc.generation;
                Some(spec)
            }
            (None, _) => None,
        }
    }

    pub fn set_override(&self, name: &str, intent: Intent) {
        lock(&self.overrides).insert(name.to_string(), intent);
    }

    // === Managed set ===

    pub fn is_managed(&self, name: &str) -> bool {
        lock(&self.managed).contains(name)
    }

    pub fn managed_names(&self) -> HashSet<String> {
        lock(&self.managed).clone()
    }

    pub fn mark_managed(&self, name: &str) {
        lock(&self.managed).insert(name.to_string());
    }

    pub fn forget_managed(&self, name: &str) {
        lock(&self.managed).remove(name);
    }

    // === Claims ===

    /// Reserve `key` for one operation; `Conflict` if already reserved.
    pub fn claim(self: &Arc<Self>, key: &str) -> Result<Claim> {
        let mut claims = lock(&self.claims);
        if !claims.insert(key.to_string()) {
            return Err(AgentError::Conflict(format!(
                "an operation on {key} is already in flight"
            )));
        }
        Ok(Claim {
            store: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        lock(&self.claims).contains(key)
    }

    // === Observed state ===

    fn entry(&self, name: &str) -> Arc<Mutex<ContainerEntry>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(name.to_string()).or_default())
    }

    fn existing_entry(&self, name: &str) -> Option<Arc<Mutex<ContainerEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn entry_list(&self) -> Vec<(String, Arc<Mutex<ContainerEntry>>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Drop entries with neither observation nor drift.
    fn prune_entries(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| {
            let entry = lock(entry);
            entry.observed.is_some() || entry.drift.is_some()
        });
    }

    /// Replace observed state with a completed collection.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) {
        for (name, entry) in self.entry_list() {
            if !snapshot.containers.contains_key(&name) {
                lock(&entry).observed = None;
            }
        }
        for (name, observed) in &snapshot.containers {
            lock(&self.entry(name)).observed = Some(observed.clone());
        }
        *lock(&self.last_collection) = snapshot.taken_at;
        self.prune_entries();
        debug!(containers = snapshot.containers.len(), "Applied snapshot");
    }

    /// Record a fresh observation of one container (`None` = absent).
    pub fn record_observation(&self, name: &str, observed: Option<ObservedContainer>) {
        match observed {
            Some(observed) => lock(&self.entry(name)).observed = Some(observed),
            None => {
                if let Some(entry) = self.existing_entry(name) {
                    lock(&entry).observed = None;
                }
            }
        }
    }

    pub fn observed(&self, name: &str) -> Option<ObservedContainer> {
        self.existing_entry(name)
            .and_then(|entry| lock(&entry).observed.clone())
    }

    pub fn last_collection(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_collection)
    }

    pub fn mark_pass(&self) {
        *lock(&self.last_pass) = Some(Utc::now());
    }

    pub fn last_pass(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_pass)
    }

    // === Drift ===

    pub fn drift(&self, name: &str) -> Option<DriftRecord> {
        self.existing_entry(name)
            .and_then(|entry| lock(&entry).drift.clone())
    }

    pub fn drift_records(&self) -> HashMap<String, DriftRecord> {
        self.entry_list()
            .into_iter()
            .filter_map(|(name, entry)| lock(&entry).drift.clone().map(|d| (name, d)))
            .collect()
    }

    /// Store `record`, keeping the original detection time when the reason
    /// is unchanged. Returns the previous record.
    pub fn upsert_drift(&self, mut record: DriftRecord) -> Option<DriftRecord> {
        let entry = self.entry(&record.name);
        let mut entry = lock(&entry);
        let previous = entry.drift.take();
        if let Some(prev) = &previous {
            if prev.reason == record.reason {
                record.detected_at = prev.detected_at;
            }
        }
        entry.drift = Some(record);
        previous
    }

    /// Remove and return the drift record of `name`.
    pub fn clear_drift(&self, name: &str) -> Option<DriftRecord> {
        let entry = self.existing_entry(name)?;
        let cleared = lock(&entry).drift.take();
        if cleared.is_some() {
            self.prune_entries();
        }
        cleared
    }

    /// Lift a permanent failure so the next pass re-plans `name`.
    pub fn clear_permanent(&self, name: &str) {
        if let Some(entry) = self.existing_entry(name) {
            if let Some(drift) = lock(&entry).drift.as_mut() {
                drift.permanent = false;
            }
        }
    }

    // === Images ===

    pub fn set_image_presence(&self, name: &str, presence: ImagePresence) {
        lock(&self.images).insert(name.to_string(), presence);
    }

    pub fn image_presence(&self, name: &str) -> Option<ImagePresence> {
        lock(&self.images).get(name).copied()
    }

    // === Views ===

    pub fn view(&self, name: &str) -> Option<ContainerView> {
        let desired = self.desired_container(name);
        let entry = self.existing_entry(name).map(|e| lock(&e).clone());
        let (observed, drift) = match entry {
            Some(entry) => (entry.observed, entry.drift),
            None => (None, None),
        };
        if desired.is_none() && observed.is_none() && drift.is_none() {
            return None;
        }
        Some(ContainerView {
            name: name.to_string(),
            desired,
            observed,
            drift,
            managed: self.is_managed(name),
        })
    }

    /// Views of every container present in the last collection, as updated
    /// by verified actions since.
    pub fn observed_views(&self) -> Vec<ContainerView> {
        let mut names: Vec<String> = self
            .entry_list()
            .into_iter()
            .filter(|(_, entry)| lock(entry).observed.is_some())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names.iter().filter_map(|n| self.view(n)).collect()
    }

    /// Views of every declared or observed container.
    pub fn all_views(&self) -> Vec<ContainerView> {
        let mut names: Vec<String> = self.desired_containers().into_keys().collect();
        names.extend(self.entry_list().into_iter().map(|(name, _)| name));
        names.sort();
        names.dedup();
        names.iter().filter_map(|n| self.view(n)).collect()
    }
}
