//! Reconciler: diff, plan, execute, verify, record drift.
//!
//! A full pass first makes sure every declared image is present, then
//! collects (a scoped pass re-observes one container), compares profile
//! files of existing containers, plans with [`plan::diff`] and executes the
//! plan phase by phase. Within a phase, actions on different containers run
//! concurrently under a global cap. Every name in the plan is claimed in
//! the store first, so two actions on one container are never in flight
//! together. Images are shared, so each one is pulled behind its own gate.

pub mod plan;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::collector::Collector;
use crate::config::{AgentSettings, RetrySettings, UnmanagedPolicy};
use crate::error::{AgentError, Result};
use crate::model::{ActiveState, DriftRecord, Ensure, Image, ObservedContainer, RunState};
use crate::protocol::StatusCode;
use crate::providers::{ProviderKind, Registry, ResourceStatus, Target};
use crate::store::{Claim, StateStore, lock};
use crate::systemd::{InitSystem, JobVerb};

use plan::{Action, ActionFailure, ActionKind, ActionStatus, Plan, PlanInput, Scope};

/// Re-observation rounds while a unit is still settling after its job.
const VERIFY_ROUNDS: u32 = 8;
const VERIFY_INTERVAL: Duration = Duration::from_millis(250);

impl From<&AgentError> for ActionFailure {
    fn from(e: &AgentError) -> Self {
        ActionFailure {
            code: e.status_code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Outcome of executing one plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub generation: u64,
    pub actions: Vec<Action>,
    /// Names skipped because their retries are exhausted.
    pub held: Vec<String>,
    /// Images pulled by the image phase.
    #[serde(default)]
    pub pulled: Vec<String>,
    /// Images the image phase failed to pull, with the error.
    #[serde(default)]
    pub image_failures: BTreeMap<String, String>,
}

impl ExecutionReport {
    pub fn failed(&self) -> impl Iterator<Item = &Action> {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
    }
}

/// Terminal result of a pass scoped to one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub name: String,
    pub generation: u64,
    pub actions: Vec<Action>,
    pub observed: Option<ObservedContainer>,
    pub drift: Option<DriftRecord>,
}

impl ActionReport {
    /// The first action that did not succeed and says why.
    pub fn failure(&self) -> Option<&ActionFailure> {
        self.actions
            .iter()
            .filter(|a| a.status != ActionStatus::Succeeded)
            .find_map(|a| a.error.as_ref())
    }

    pub fn status_code(&self) -> StatusCode {
        self.failure().map_or(StatusCode::Success, |f| f.code)
    }
}

pub struct Reconciler {
    store: Arc<StateStore>,
    init: Arc<InitSystem>,
    registry: Arc<Registry>,
    collector: Collector,
    audit: Arc<AuditLogger>,
    limits: Semaphore,
    retry: RetrySettings,
    unmanaged: UnmanagedPolicy,
    /// Serializes full passes; scoped passes never take it.
    pass_gate: Mutex<()>,
    /// One gate per image name, held while that image is checked or pulled.
    image_gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        init: Arc<InitSystem>,
        registry: Arc<Registry>,
        audit: Arc<AuditLogger>,
        settings: &AgentSettings,
    ) -> Self {
        Self {
            collector: Collector::new(Arc::clone(&init), Arc::clone(&store)),
            store,
            init,
            registry,
            audit,
            limits: Semaphore::new(settings.max_inflight_actions.max(1)),
            retry: settings.retry.clone(),
            unmanaged: settings.unmanaged,
            pass_gate: Mutex::new(()),
            image_gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Collect, plan and execute for every container. Waits for a running
    /// full pass to finish first.
    pub async fn full_pass(self: &Arc<Self>) -> Result<ExecutionReport> {
        let _gate = self.pass_gate.lock().await;
        self.run_full_pass().await
    }

    /// Like [`full_pass`](Self::full_pass), but returns `None` when one is
    /// already running.
    pub async fn try_full_pass(self: &Arc<Self>) -> Option<Result<ExecutionReport>> {
        let Ok(_gate) = self.pass_gate.try_lock() else {
            debug!("Full pass already running, skipping");
            return None;
        };
        Some(self.run_full_pass().await)
    }

    async fn run_full_pass(self: &Arc<Self>) -> Result<ExecutionReport> {
        let (pulled, image_failures) = self.reconcile_images().await;
        let snapshot = self.collector.refresh().await?;
        let config_drift = self.config_drift(&snapshot.containers, None).await;
        let plan = self.plan(&snapshot.containers, &config_drift, Scope::All);
        self.record_plan(&plan);
        if !plan.is_empty() {
            info!(
                generation = plan.generation,
                actions = plan.actions.len(),
                "Executing plan"
            );
        }
        let mut report = self.execute(plan, None).await;
        report.pulled = pulled;
        report.image_failures = image_failures;
        self.store.mark_pass();
        Ok(report)
    }

    /// Pull `image` unless present. Concurrent callers for one image wait
    /// for each other, so it is pulled at most once.
    pub async fn ensure_image(&self, image: &Image) -> Result<bool> {
        let gate = Arc::clone(lock(&self.image_gates).entry(image.name.clone()).or_default());
        let _held = gate.lock().await;
        let pulled = self.registry.ensure_image(image).await?;
        if pulled {
            self.audit.image_pulled(&image.name);
        }
        Ok(pulled)
    }

    /// Make sure every declared image is present. A failed pull is logged
    /// and reported; it does not stop the pass.
    async fn reconcile_images(self: &Arc<Self>) -> (Vec<String>, BTreeMap<String, String>) {
        let doc = self.store.desired();
        let mut tasks = JoinSet::new();
        for image in doc.images.values().cloned() {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.ensure_image(&image).await;
                (image.name, result)
            });
        }

        let mut pulled = Vec::new();
        let mut failures = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(true))) => pulled.push(name),
                Ok((_, Ok(false))) => {}
                Ok((name, Err(e))) => {
                    warn!(image = %name, "Image not available: {}", e);
                    self.audit.image_pull_failed(&name, &e.to_string());
                    failures.insert(name, e.to_string());
                }
                Err(e) => error!("Image task failed: {}", e),
            }
        }
        pulled.sort();
        (pulled, failures)
    }

    /// Existing declared containers whose profile files no longer match the
    /// rendered profile. Containers that do not resolve are left to the
    /// create path to report.
    async fn config_drift(
        &self,
        observed: &BTreeMap<String, ObservedContainer>,
        only: Option<&str>,
    ) -> HashMap<String, String> {
        let doc = self.store.desired();
        let mut drifted = HashMap::new();
        for (name, spec) in self.store.desired_containers() {
            if spec.ensure != Ensure::Present || only.is_some_and(|n| n != name) {
                continue;
            }
            if !observed.get(&name).is_some_and(|o| o.exists) {
                continue;
            }
            let Ok(target) = Target::resolve(&doc, &spec) else {
                continue;
            };
            match self.registry.status(ProviderKind::Profile, &target).await {
                Ok(ResourceStatus::Present) => {}
                Ok(ResourceStatus::Drifted) => {
                    let detail = format!("profile {} differs from the files on disk", spec.profile);
                    drifted.insert(name, detail);
                }
                Ok(ResourceStatus::Absent) => {
                    let detail = format!("profile {} files are missing", spec.profile);
                    drifted.insert(name, detail);
                }
                Err(e) => debug!(name = %name, "Profile status failed: {}", e),
            }
        }
        drifted
    }

    /// Re-observe `name`, then plan and execute for it alone. The caller
    /// must hold the claim on `name`.
    pub async fn scoped_pass(
        self: &Arc<Self>,
        claim: &Claim,
        force_restart: bool,
    ) -> Result<ActionReport> {
        let name = claim.key();
        let observed = self.collector.observe_one(name).await;
        self.store.record_observation(name, observed.clone());

        let mut observed_map = BTreeMap::new();
        if let Some(observed) = observed {
            observed_map.insert(name.to_string(), observed);
        }
        let config_drift = self.config_drift(&observed_map, Some(name)).await;
        let plan = self.plan(
            &observed_map,
            &config_drift,
            Scope::One {
                name,
                force_restart,
            },
        );
        self.record_plan(&plan);
        debug!(name, actions = plan.actions.len(), "Scoped plan");

        let report = self.execute(plan, Some(name)).await;
        Ok(ActionReport {
            name: name.to_string(),
            generation: report.generation,
            actions: report.actions,
            observed: self.store.observed(name),
            drift: self.store.drift(name),
        })
    }

    fn plan(
        &self,
        observed: &BTreeMap<String, ObservedContainer>,
        config_drift: &HashMap<String, String>,
        scope: Scope<'_>,
    ) -> Plan {
        let generation = self.store.generation();
        let desired = self.store.desired_containers();
        let managed = self.store.managed_names();
        let drift = self.store.drift_records();
        plan::diff(
            &PlanInput {
                generation,
                desired: &desired,
                observed,
                managed: &managed,
                drift: &drift,
                config_drift,
                unmanaged: self.unmanaged,
            },
            scope,
        )
    }

    /// Open drift records for everything planned or flagged, close them for
    /// everything converged.
    fn record_plan(&self, plan: &Plan) {
        let mut seen = HashSet::new();
        for action in &plan.actions {
            if seen.insert(action.name.as_str()) {
                let mut record = DriftRecord::new(&action.name, action.reason, &action.detail);
                record.generation = plan.generation;
                self.open_drift(record);
            }
        }
        for finding in &plan.findings {
            let mut record = DriftRecord::new(&finding.name, finding.reason, &finding.detail);
            record.generation = plan.generation;
            self.open_drift(record);
        }
        for name in &plan.converged {
            self.close_drift(name);
        }
    }

    fn open_drift(&self, record: DriftRecord) {
        let previous = self.store.upsert_drift(record.clone());
        let changed = previous.is_none_or(|p| p.reason != record.reason || p.permanent != record.permanent);
        if changed {
            self.audit.drift_detected(&record);
        }
    }

    fn close_drift(&self, name: &str) {
        if let Some(record) = self.store.clear_drift(name) {
            self.audit.drift_resolved(&record);
        }
    }

    /// Run `plan` phase by phase. `held` names a container whose claim the
    /// caller already owns.
    pub async fn execute(self: &Arc<Self>, plan: Plan, held: Option<&str>) -> ExecutionReport {
        let Plan {
            generation,
            actions,
            held: exhausted,
            ..
        } = plan;

        let names: HashSet<String> = actions.iter().map(|a| a.name.clone()).collect();
        let mut claims: HashMap<String, Claim> = HashMap::new();
        let mut skip: HashSet<String> = HashSet::new();
        for name in names {
            if held == Some(name.as_str()) {
                continue;
            }
            match self.store.claim(&name) {
                Ok(claim) => {
                    claims.insert(name, claim);
                }
                Err(_) => {
                    debug!(name = %name, "Container busy, leaving its actions pending");
                    skip.insert(name);
                }
            }
        }

        let mut phases: BTreeMap<u8, Vec<(usize, Action)>> = BTreeMap::new();
        for (idx, action) in actions.into_iter().enumerate() {
            phases
                .entry(action.kind.phase())
                .or_default()
                .push((idx, action));
        }

        let mut done: Vec<(usize, Action)> = Vec::new();
        for (_, batch) in phases {
            let mut tasks = JoinSet::new();
            for (idx, action) in batch {
                if skip.contains(&action.name) {
                    done.push((idx, action));
                    continue;
                }
                let this = Arc::clone(self);
                tasks.spawn(async move { (idx, this.run_action(action, generation).await) });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((idx, action)) => {
                        // Later phases skip a container whose earlier step failed.
                        if action.status != ActionStatus::Succeeded {
                            skip.insert(action.name.clone());
                        }
                        done.push((idx, action));
                    }
                    Err(e) => error!("Action task failed: {}", e),
                }
            }
        }
        done.sort_by_key(|(idx, _)| *idx);
        let actions: Vec<Action> = done.into_iter().map(|(_, a)| a).collect();

        let settled: HashSet<&str> = actions.iter().map(|a| a.name.as_str()).collect();
        for name in settled {
            let all_ok = actions
                .iter()
                .filter(|a| a.name == name)
                .all(|a| a.status == ActionStatus::Succeeded);
            if all_ok {
                self.close_drift(name);
            }
        }
        drop(claims);

        ExecutionReport {
            generation,
            actions,
            held: exhausted,
            ..ExecutionReport::default()
        }
    }

    /// Execute one action with bounded retries, then record the outcome.
    async fn run_action(self: Arc<Self>, mut action: Action, generation: u64) -> Action {
        let max_attempts = self.retry.max_attempts.max(1);
        loop {
            let current = self.store.generation();
            if current != generation {
                let err = AgentError::Superseded {
                    planned: generation,
                    current,
                };
                debug!(name = %action.name, action = %action.kind, "{}", err);
                action.error = Some(ActionFailure::from(&err));
                if action.attempts > 0 {
                    action.status = ActionStatus::Failed;
                }
                return action;
            }

            action.status = ActionStatus::InFlight;
            action.attempts += 1;
            let result = match self.limits.acquire().await {
                Ok(_permit) => self.perform(&action).await,
                Err(_) => Err(AgentError::Internal("action limiter closed".to_string())),
            };

            match result {
                Ok(()) => {
                    action.status = ActionStatus::Succeeded;
                    action.error = None;
                    self.audit
                        .action_succeeded(action.kind, &action.name, action.attempts);
                    return action;
                }
                Err(e) => {
                    action.error = Some(ActionFailure::from(&e));
                    if e.is_retryable() && action.attempts < max_attempts {
                        let delay = self.retry.backoff(action.attempts);
                        warn!(
                            name = %action.name,
                            action = %action.kind,
                            attempt = action.attempts,
                            "Action failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    action.status = ActionStatus::Failed;
                    self.audit
                        .action_failed(action.kind, &action.name, action.attempts, &e.to_string());

                    let mut record = DriftRecord::new(&action.name, action.reason, e.to_string());
                    record.attempts = action.attempts;
                    record.permanent = true;
                    record.generation = generation;
                    self.open_drift(record);
                    return action;
                }
            }
        }
    }

    async fn perform(&self, action: &Action) -> Result<()> {
        let name = action.name.as_str();
        match action.kind {
            ActionKind::Create => self.create(name).await,
            ActionKind::Configure => self.configure(name).await,
            ActionKind::Start => self.transition(name, JobVerb::Start, RunState::Running).await,
            ActionKind::Restart => {
                self.transition(name, JobVerb::Restart, RunState::Running)
                    .await
            }
            ActionKind::Stop => self.transition(name, JobVerb::Stop, RunState::Stopped).await,
            ActionKind::Remove => self.remove(name).await,
        }
    }

    fn resolve(&self, name: &str) -> Result<(Target, bool)> {
        let doc = self.store.desired();
        let spec = self
            .store
            .desired_container(name)
            .ok_or_else(|| AgentError::NotFound(format!("container {name}")))?;
        Ok((Target::resolve(&doc, &spec)?, spec.autostart))
    }

    async fn create(&self, name: &str) -> Result<()> {
        let (target, autostart) = self.resolve(name)?;
        if let Some(image) = &target.image {
            self.ensure_image(image).await?;
        }

        self.registry.ensure_present(&target).await?;
        self.store.mark_managed(name);
        if autostart {
            self.init.submit_job(name, JobVerb::Enable).await?;
        }

        match self.collector.observe_one(name).await {
            Some(observed) => {
                self.store.record_observation(name, Some(observed));
                Ok(())
            }
            None => Err(AgentError::Unconverged {
                name: name.to_string(),
                expected: "present".to_string(),
                observed: "missing".to_string(),
            }),
        }
    }

    /// Rewrite the profile files of an existing container. They take
    /// effect at its next start.
    async fn configure(&self, name: &str) -> Result<()> {
        let (target, _) = self.resolve(name)?;
        self.registry.ensure_one(ProviderKind::Profile, &target).await?;
        match self.registry.status(ProviderKind::Profile, &target).await? {
            ResourceStatus::Present => Ok(()),
            status => Err(AgentError::Unconverged {
                name: name.to_string(),
                expected: "profile applied".to_string(),
                observed: format!("{status:?}").to_lowercase(),
            }),
        }
    }

    async fn transition(&self, name: &str, verb: JobVerb, state: RunState) -> Result<()> {
        self.init.submit_job(name, verb).await?;
        self.verify(name, state).await
    }

    /// Re-query one container until it reaches `state` or stops settling.
    async fn verify(&self, name: &str, state: RunState) -> Result<()> {
        let mut last = "missing".to_string();
        for round in 0..VERIFY_ROUNDS {
            let observed = self.collector.observe_one(name).await;
            self.store.record_observation(name, observed.clone());
            let Some(observed) = observed else { break };
            if observed.active.satisfies(state) {
                return Ok(());
            }
            last = observed.active.to_string();
            let settling =
                observed.active.is_transitional() || observed.active == ActiveState::Unknown;
            if !settling || round + 1 == VERIFY_ROUNDS {
                break;
            }
            tokio::time::sleep(VERIFY_INTERVAL).await;
        }
        Err(AgentError::Unconverged {
            name: name.to_string(),
            expected: state.to_string(),
            observed: last,
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        if let Some(observed) = self.collector.observe_one(name).await {
            let running = observed.active == ActiveState::Active || observed.active.is_transitional();
            if running {
                self.init.submit_job(name, JobVerb::Stop).await?;
            }
        }
        if let Err(e) = self.init.submit_job(name, JobVerb::Disable).await {
            warn!(name, "Disabling unit failed: {}", e);
        }

        self.registry.ensure_absent(&Target::bare(name)).await?;
        self.store.forget_managed(name);

        match self.collector.observe_one(name).await {
            None => {
                self.store.record_observation(name, None);
                Ok(())
            }
            Some(observed) => {
                let state = observed.active.to_string();
                self.store.record_observation(name, Some(observed));
                Err(AgentError::Unconverged {
                    name: name.to_string(),
                    expected: "absent".to_string(),
                    observed: state,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DriftReason, Ensure};
    use crate::store::Intent;
    use crate::systemd::JobResult;
    use crate::model::ContainerSpec;
    use crate::test_util::{FakeProviders, FakeServiceManager, sample_document, test_settings};

    fn setup_with_providers() -> (
        Arc<Reconciler>,
        Arc<FakeServiceManager>,
        Arc<StateStore>,
        FakeProviders,
    ) {
        let (fake, rx) = FakeServiceManager::new();
        let (init, _dispatcher) = InitSystem::start(fake.clone(), rx, Duration::from_secs(5));
        let store = Arc::new(StateStore::new("host1", None));
        store.apply_document(sample_document("host1"));
        let providers = FakeProviders::new(&fake);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            init,
            Arc::new(providers.registry()),
            Arc::new(AuditLogger::new_noop()),
            &test_settings(),
        ));
        (reconciler, fake, store, providers)
    }

    fn setup() -> (Arc<Reconciler>, Arc<FakeServiceManager>, Arc<StateStore>) {
        let (reconciler, fake, store, _providers) = setup_with_providers();
        (reconciler, fake, store)
    }

    /// The sample document with `web2` on the same image as `web1`.
    fn two_on_one_image() -> crate::model::DesiredDocument {
        let mut doc = sample_document("host1");
        doc.nodes
            .get_mut("host1")
            .unwrap()
            .insert("web2".to_string(), ContainerSpec::new("web2", "ubuntu-24.04"));
        doc
    }

    #[tokio::test]
    async fn test_full_pass_creates_and_starts() {
        let (reconciler, fake, store) = setup();

        let report = reconciler.full_pass().await.unwrap();
        let steps: Vec<(ActionKind, &str)> = report
            .actions
            .iter()
            .map(|a| (a.kind, a.name.as_str()))
            .collect();
        assert_eq!(
            steps,
            vec![(ActionKind::Create, "web1"), (ActionKind::Start, "web1")]
        );
        assert!(report.actions.iter().all(|a| a.status == ActionStatus::Succeeded));
        assert_eq!(fake.state("web1"), Some(ActiveState::Active));
        assert!(store.is_managed("web1"));
        assert!(store.drift("web1").is_none());

        let again = reconciler.full_pass().await.unwrap();
        assert!(again.actions.is_empty());
    }

    #[tokio::test]
    async fn test_failed_restart_becomes_permanent_drift() {
        let (reconciler, fake, store) = setup();
        reconciler.full_pass().await.unwrap();

        fake.set_state("web1", ActiveState::Failed);
        fake.fail_jobs("web1", JobVerb::Restart, JobResult::Failed);
        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        let action = &report.actions[0];
        assert_eq!(action.kind, ActionKind::Restart);
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.attempts, 3);

        let drift = store.drift("web1").unwrap();
        assert_eq!(drift.reason, DriftReason::StateMismatch);
        assert!(drift.permanent);
        assert_eq!(drift.attempts, 3);

        // Held until the generation changes or a user command clears it.
        let held = reconciler.full_pass().await.unwrap();
        assert!(held.actions.is_empty());
        assert_eq!(held.held, vec!["web1"]);
        assert_eq!(
            fake.submitted_jobs()
                .iter()
                .filter(|(_, verb)| *verb == JobVerb::Restart)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_unresolved_profile_fails_only_that_container() {
        let (reconciler, _fake, store) = setup();
        let mut doc = sample_document("host1");
        let nodes = doc.nodes.get_mut("host1").unwrap();
        let mut broken = nodes["web1"].clone();
        broken.name = "web2".to_string();
        broken.profile = "gpu".to_string();
        nodes.insert("web2".to_string(), broken);
        store.apply_document(doc);

        let report = reconciler.full_pass().await.unwrap();
        let failed: Vec<&str> = report.failed().map(|a| a.name.as_str()).collect();
        assert_eq!(failed, vec!["web2"]);
        let create = report.actions.iter().find(|a| a.name == "web2").unwrap();
        assert_eq!(create.attempts, 1);
        assert_eq!(create.error.as_ref().unwrap().code, StatusCode::NotFound);
        assert!(
            report
                .actions
                .iter()
                .filter(|a| a.name == "web1")
                .all(|a| a.status == ActionStatus::Succeeded)
        );
        // The start of web2 never ran.
        let start = report
            .actions
            .iter()
            .find(|a| a.name == "web2" && a.kind == ActionKind::Start)
            .unwrap();
        assert_eq!(start.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn test_removed_from_document_is_removed() {
        let (reconciler, fake, store) = setup();
        reconciler.full_pass().await.unwrap();

        let mut doc = sample_document("host1");
        doc.nodes.get_mut("host1").unwrap().clear();
        store.apply_document(doc);
        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].kind, ActionKind::Remove);
        assert_eq!(report.actions[0].status, ActionStatus::Succeeded);
        assert_eq!(fake.state("web1"), None);
        assert!(store.observed("web1").is_none());
        assert!(!store.is_managed("web1"));
    }

    #[tokio::test]
    async fn test_scoped_pass_with_intent() {
        let (reconciler, fake, store) = setup();
        reconciler.full_pass().await.unwrap();

        store.set_override(
            "web1",
            Intent {
                ensure: Ensure::Present,
                state: RunState::Stopped,
            },
        );
        let claim = store.claim("web1").unwrap();
        let report = reconciler.scoped_pass(&claim, false).await.unwrap();
        assert_eq!(report.status_code(), StatusCode::Success);
        assert_eq!(report.actions[0].kind, ActionKind::Stop);
        assert_eq!(fake.state("web1"), Some(ActiveState::Inactive));
        assert_eq!(
            report.observed.map(|o| o.active),
            Some(ActiveState::Inactive)
        );
    }

    #[tokio::test]
    async fn test_busy_container_is_left_pending() {
        let (reconciler, fake, store) = setup();
        let _claim = store.claim("web1").unwrap();
        let report = reconciler.full_pass().await.unwrap();
        assert!(
            report
                .actions
                .iter()
                .all(|a| a.status == ActionStatus::Pending)
        );
        assert_eq!(fake.state("web1"), None);
    }

    #[tokio::test]
    async fn test_superseded_plan_starts_nothing() {
        let (reconciler, fake, store) = setup();
        let snapshot = reconciler.collector().refresh().await.unwrap();
        let plan = reconciler.plan(&snapshot.containers, &HashMap::new(), Scope::All);
        store.apply_document(sample_document("host1"));

        let report = reconciler.execute(plan, None).await;
        assert!(
            report
                .actions
                .iter()
                .all(|a| a.status == ActionStatus::Pending && a.error.is_some())
        );
        assert_eq!(fake.state("web1"), None);
    }

    #[tokio::test]
    async fn test_shared_image_pulled_once() {
        let (reconciler, fake, store, providers) = setup_with_providers();
        store.apply_document(two_on_one_image());
        providers.images.set_pull_delay(Duration::from_millis(100));

        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(providers.images.pull_count("ubuntu-24.04"), 1);
        assert_eq!(report.pulled, vec!["ubuntu-24.04"]);
        assert!(report.actions.iter().all(|a| a.status == ActionStatus::Succeeded));
        assert_eq!(fake.state("web1"), Some(ActiveState::Active));
        assert_eq!(fake.state("web2"), Some(ActiveState::Active));
    }

    #[tokio::test]
    async fn test_concurrent_creates_wait_for_one_pull() {
        let (reconciler, _fake, store, providers) = setup_with_providers();
        store.apply_document(two_on_one_image());
        providers.images.set_pull_delay(Duration::from_millis(100));

        let web1 = Action::new(ActionKind::Create, "web1", DriftReason::Missing, "");
        let web2 = Action::new(ActionKind::Create, "web2", DriftReason::Missing, "");
        let (a, b) = tokio::join!(reconciler.perform(&web1), reconciler.perform(&web2));
        a.unwrap();
        b.unwrap();
        assert_eq!(providers.images.pulls(), vec!["ubuntu-24.04"]);
    }

    #[tokio::test]
    async fn test_failed_image_pull_fails_dependent_creates() {
        let (reconciler, _fake, store, providers) = setup_with_providers();
        store.apply_document(two_on_one_image());
        providers.images.fail_pull("ubuntu-24.04");

        let report = reconciler.full_pass().await.unwrap();
        assert!(report.image_failures.contains_key("ubuntu-24.04"));
        let failed: Vec<&str> = report.failed().map(|a| a.name.as_str()).collect();
        assert_eq!(failed, vec!["web1", "web2"]);
        assert!(!providers.images.is_present("ubuntu-24.04"));
    }

    #[tokio::test]
    async fn test_image_phase_keeps_declared_images_present() {
        let (reconciler, _fake, store, providers) = setup_with_providers();
        let mut doc = sample_document("host1");
        let mut debian = doc.images["ubuntu-24.04"].clone();
        debian.name = "debian-12".to_string();
        doc.images.insert("debian-12".to_string(), debian);
        store.apply_document(doc);

        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(report.pulled, vec!["debian-12", "ubuntu-24.04"]);
        assert!(reconciler.full_pass().await.unwrap().pulled.is_empty());

        providers.images.forget("debian-12");
        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(report.pulled, vec!["debian-12"]);
        assert!(report.actions.is_empty());
        assert_eq!(providers.images.pull_count("debian-12"), 2);
    }

    #[tokio::test]
    async fn test_profile_drift_is_reapplied() {
        let (reconciler, fake, store, providers) = setup_with_providers();
        reconciler.full_pass().await.unwrap();

        providers.profiles.mark_drifted("web1");
        let report = reconciler.full_pass().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        let action = &report.actions[0];
        assert_eq!(action.kind, ActionKind::Configure);
        assert_eq!(action.reason, DriftReason::ConfigMismatch);
        assert_eq!(action.status, ActionStatus::Succeeded);
        assert_eq!(providers.profiles.calls(), vec!["create web1", "create web1"]);
        // Not restarted to pick the change up.
        assert_eq!(fake.state("web1"), Some(ActiveState::Active));
        assert!(store.drift("web1").is_none());

        assert!(reconciler.full_pass().await.unwrap().actions.is_empty());
    }
}
