//! In-memory service manager with systemd's asynchronous job semantics.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::model::ActiveState;
use crate::store::lock;
use crate::systemd::{
    JobId, JobNotification, JobResult, JobVerb, ServiceManager, UnitStatus, container_name,
    unit_name,
};

#[derive(Debug)]
struct FakeState {
    units: BTreeMap<String, ActiveState>,
    failures: HashMap<(String, JobVerb), JobResult>,
    delays: HashMap<String, Duration>,
    status_failures: HashSet<String>,
    submitted: Vec<(String, JobVerb)>,
    completed: Vec<(String, JobVerb)>,
    alive: bool,
}

/// Jobs complete on a spawned task, after an optional per-container delay,
/// and post their notification only once the unit state has changed.
pub struct FakeServiceManager {
    state: Arc<Mutex<FakeState>>,
    notify: mpsc::UnboundedSender<JobNotification>,
    next_job: AtomicU64,
}

impl FakeServiceManager {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<JobNotification>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            state: Arc::new(Mutex::new(FakeState {
                units: BTreeMap::new(),
                failures: HashMap::new(),
                delays: HashMap::new(),
                status_failures: HashSet::new(),
                submitted: Vec::new(),
                completed: Vec::new(),
                alive: true,
            })),
            notify,
            next_job: AtomicU64::new(1),
        });
        (manager, rx)
    }

    pub fn add_container(&self, name: &str, active: ActiveState) {
        lock(&self.state).units.insert(name.to_string(), active);
    }

    pub fn remove_container(&self, name: &str) {
        lock(&self.state).units.remove(name);
    }

    /// Change a unit behind the agent's back.
    pub fn set_state(&self, name: &str, active: ActiveState) {
        if let Some(state) = lock(&self.state).units.get_mut(name) {
            *state = active;
        }
    }

    pub fn state(&self, name: &str) -> Option<ActiveState> {
        lock(&self.state).units.get(name).copied()
    }

    /// Make every `verb` job on `name` finish with `result`.
    pub fn fail_jobs(&self, name: &str, verb: JobVerb, result: JobResult) {
        lock(&self.state)
            .failures
            .insert((name.to_string(), verb), result);
    }

    pub fn clear_failures(&self, name: &str) {
        lock(&self.state).failures.retain(|(n, _), _| n != name);
    }

    pub fn delay_jobs(&self, name: &str, delay: Duration) {
        lock(&self.state).delays.insert(name.to_string(), delay);
    }

    /// Make status queries for `name` fail.
    pub fn fail_status(&self, name: &str) {
        lock(&self.state).status_failures.insert(name.to_string());
    }

    pub fn set_alive(&self, alive: bool) {
        lock(&self.state).alive = alive;
    }

    pub fn submitted_jobs(&self) -> Vec<(String, JobVerb)> {
        lock(&self.state).submitted.clone()
    }

    /// Finished jobs in completion order.
    pub fn completed_jobs(&self) -> Vec<(String, JobVerb)> {
        lock(&self.state).completed.clone()
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if lock(&self.state).alive {
            Ok(())
        } else {
            Err(BackendError::Unavailable("fake init system stopped".to_string()))
        }
    }
}

/// Apply `verb` to the fake unit table and return the job result.
fn finish_job(state: &mut FakeState, name: &str, verb: JobVerb) -> JobResult {
    let exists = state.units.contains_key(name);
    if let Some(result) = state.failures.get(&(name.to_string(), verb)).copied() {
        if exists && matches!(verb, JobVerb::Start | JobVerb::Restart) {
            state.units.insert(name.to_string(), ActiveState::Failed);
        }
        return result;
    }
    match verb {
        JobVerb::Start | JobVerb::Restart if exists => {
            state.units.insert(name.to_string(), ActiveState::Active);
            JobResult::Done
        }
        JobVerb::Start | JobVerb::Restart => JobResult::Failed,
        JobVerb::Stop => {
            if exists {
                state.units.insert(name.to_string(), ActiveState::Inactive);
            }
            JobResult::Done
        }
        JobVerb::Enable | JobVerb::Disable => JobResult::Done,
    }
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    async fn enqueue(&self, unit: &str, verb: JobVerb) -> Result<JobId, BackendError> {
        self.check_alive()?;
        let name = container_name(unit)
            .ok_or_else(|| BackendError::Command {
                command: format!("{verb} {unit}"),
                message: "not a container unit".to_string(),
            })?
            .to_string();
        let job = self.next_job.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = lock(&self.state);
            state.submitted.push((name.clone(), verb));
            state.delays.get(&name).copied().unwrap_or_default()
        };

        let state = Arc::clone(&self.state);
        let notify = self.notify.clone();
        let unit = unit.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = {
                let mut state = lock(&state);
                let result = finish_job(&mut state, &name, verb);
                state.completed.push((name, verb));
                result
            };
            let _ = notify.send(JobNotification { job, unit, result });
        });
        Ok(job)
    }

    async fn unit_status(&self, unit: &str) -> Result<UnitStatus, BackendError> {
        self.check_alive()?;
        let name = container_name(unit).unwrap_or(unit);
        let state = lock(&self.state);
        if state.status_failures.contains(name) {
            return Err(BackendError::Command {
                command: format!("show {unit}"),
                message: "bus timeout".to_string(),
            });
        }
        let active = state.units.get(name).copied();
        Ok(UnitStatus {
            unit: unit.to_string(),
            exists: active.is_some(),
            active: active.unwrap_or(ActiveState::Inactive),
            sub_state: match active {
                Some(ActiveState::Active) => "running".to_string(),
                Some(ActiveState::Failed) => "failed".to_string(),
                _ => "dead".to_string(),
            },
        })
    }

    async fn list_units(&self) -> Result<Vec<String>, BackendError> {
        self.check_alive()?;
        Ok(lock(&self.state).units.keys().map(|n| unit_name(n)).collect())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check_alive()
    }
}
