//! Diff of desired against observed state, and the ordered plan it yields.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::UnmanagedPolicy;
use crate::model::{
    ActiveState, ContainerSpec, DriftReason, DriftRecord, Ensure, ObservedContainer, RunState,
};
use crate::protocol::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    /// Re-apply the profile of an existing container.
    Configure,
    Start,
    Restart,
    Stop,
    Remove,
}

impl ActionKind {
    /// Global execution phase. Every action of a lower phase finishes
    /// before any action of a higher one starts.
    pub fn phase(&self) -> u8 {
        match self {
            ActionKind::Create | ActionKind::Configure => 0,
            ActionKind::Start | ActionKind::Restart => 1,
            ActionKind::Stop => 2,
            ActionKind::Remove => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Configure => "configure",
            ActionKind::Start => "start",
            ActionKind::Restart => "restart",
            ActionKind::Stop => "stop",
            ActionKind::Remove => "remove",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub code: StatusCode,
    pub message: String,
    pub retryable: bool,
}

/// One step of a plan, bound to exactly one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub name: String,
    /// Why the action was planned; becomes the drift reason on failure.
    pub reason: DriftReason,
    pub detail: String,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionFailure>,
}

impl Action {
    pub fn new(
        kind: ActionKind,
        name: impl Into<String>,
        reason: DriftReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            reason,
            detail: detail.into(),
            status: ActionStatus::Pending,
            attempts: 0,
            error: None,
        }
    }
}

/// A mismatch that is recorded but never acted upon.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub name: String,
    pub reason: DriftReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub generation: u64,
    /// Sorted by phase; planning order is kept within a phase.
    pub actions: Vec<Action>,
    pub findings: Vec<Finding>,
    /// Names observed in their desired state.
    pub converged: Vec<String>,
    /// Names left alone because their retries are exhausted.
    pub held: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    /// `(kind, name)` pairs in execution order.
    pub fn steps(&self) -> Vec<(ActionKind, &str)> {
        self.actions
            .iter()
            .map(|a| (a.kind, a.name.as_str()))
            .collect()
    }
}

/// Which containers a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    All,
    One { name: &'a str, force_restart: bool },
}

/// Everything the diff reads, borrowed from one consistent view.
pub struct PlanInput<'a> {
    pub generation: u64,
    pub desired: &'a BTreeMap<String, ContainerSpec>,
    pub observed: &'a BTreeMap<String, ObservedContainer>,
    pub managed: &'a HashSet<String>,
    pub drift: &'a HashMap<String, DriftRecord>,
    /// Existing containers whose profile files differ from the rendered
    /// profile, with a detail line.
    pub config_drift: &'a HashMap<String, String>,
    pub unmanaged: UnmanagedPolicy,
}

enum Verdict {
    Converged,
    Skip,
    Act(Vec<Action>),
    Flag(Finding),
}

/// Compute the plan for `scope`.
pub fn diff(input: &PlanInput<'_>, scope: Scope<'_>) -> Plan {
    let names: BTreeSet<&String> = match scope {
        Scope::All => input.desired.keys().chain(input.observed.keys()).collect(),
        Scope::One { name, .. } => input
            .desired
            .keys()
            .chain(input.observed.keys())
            .filter(|n| n.as_str() == name)
            .collect(),
    };
    let force_restart = matches!(
        scope,
        Scope::One {
            force_restart: true,
            ..
        }
    );

    let mut plan = Plan {
        generation: input.generation,
        ..Plan::default()
    };
    for name in names {
        let verdict = evaluate(input, name, force_restart);
        match verdict {
            Verdict::Converged => plan.converged.push(name.clone()),
            Verdict::Skip => {}
            Verdict::Flag(finding) => plan.findings.push(finding),
            Verdict::Act(actions) => {
                let exhausted = input
                    .drift
                    .get(name)
                    .is_some_and(|d| d.permanent && d.generation == input.generation);
                if exhausted {
                    plan.held.push(name.clone());
                } else {
                    plan.actions.extend(actions);
                }
            }
        }
    }
    plan.actions.sort_by_key(|a| a.kind.phase());
    plan
}

fn evaluate(input: &PlanInput<'_>, name: &str, force_restart: bool) -> Verdict {
    let observed = input.observed.get(name).filter(|o| o.exists);
    let Some(spec) = input.desired.get(name) else {
        if observed.is_none() {
            return Verdict::Converged;
        }
        if input.managed.contains(name) {
            return Verdict::Act(vec![Action::new(
                ActionKind::Remove,
                name,
                DriftReason::Extra,
                "no longer declared",
            )]);
        }
        return match input.unmanaged {
            UnmanagedPolicy::Ignore => Verdict::Skip,
            UnmanagedPolicy::Flag => Verdict::Flag(Finding {
                name: name.to_string(),
                reason: DriftReason::Extra,
                detail: "container not declared and not managed".to_string(),
            }),
        };
    };

    if spec.ensure == Ensure::Absent {
        return match observed {
            Some(_) => Verdict::Act(vec![Action::new(
                ActionKind::Remove,
                name,
                DriftReason::Extra,
                "declared absent",
            )]),
            None => Verdict::Converged,
        };
    }

    let Some(observed) = observed else {
        let mut actions = vec![Action::new(
            ActionKind::Create,
            name,
            DriftReason::Missing,
            "container does not exist",
        )];
        if spec.state == RunState::Running {
            actions.push(Action::new(
                ActionKind::Start,
                name,
                DriftReason::Missing,
                "container does not exist",
            ));
        }
        return Verdict::Act(actions);
    };

    if observed.active == ActiveState::Unknown || observed.active.is_transitional() {
        return Verdict::Skip;
    }

    let mut actions = Vec::new();
    if let Some(detail) = input.config_drift.get(name) {
        actions.push(Action::new(
            ActionKind::Configure,
            name,
            DriftReason::ConfigMismatch,
            detail.as_str(),
        ));
    }
    let mismatch = |kind| {
        Action::new(
            kind,
            name,
            DriftReason::StateMismatch,
            format!("desired {}, observed {}", spec.state, observed.active),
        )
    };
    match (spec.state, observed.active) {
        (RunState::Running, ActiveState::Failed) => actions.push(mismatch(ActionKind::Restart)),
        (RunState::Running, ActiveState::Inactive) => actions.push(mismatch(ActionKind::Start)),
        (RunState::Stopped, ActiveState::Active) => actions.push(mismatch(ActionKind::Stop)),
        (RunState::Running, ActiveState::Active) if force_restart => {
            actions.push(Action::new(
                ActionKind::Restart,
                name,
                DriftReason::StateMismatch,
                "restart requested",
            ));
        }
        _ => {}
    }
    if actions.is_empty() {
        Verdict::Converged
    } else {
        Verdict::Act(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        desired: BTreeMap<String, ContainerSpec>,
        observed: BTreeMap<String, ObservedContainer>,
        managed: HashSet<String>,
        drift: HashMap<String, DriftRecord>,
        config_drift: HashMap<String, String>,
        unmanaged: UnmanagedPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                desired: BTreeMap::new(),
                observed: BTreeMap::new(),
                managed: HashSet::new(),
                drift: HashMap::new(),
                config_drift: HashMap::new(),
                unmanaged: UnmanagedPolicy::Ignore,
            }
        }

        fn want(mut self, name: &str, ensure: Ensure, state: RunState) -> Self {
            let mut spec = ContainerSpec::new(name, "ubuntu-24.04");
            spec.ensure = ensure;
            spec.state = state;
            self.managed.insert(name.to_string());
            self.desired.insert(name.to_string(), spec);
            self
        }

        fn see(mut self, name: &str, active: ActiveState) -> Self {
            self.observed
                .insert(name.to_string(), ObservedContainer::new(name, active));
            self
        }

        fn plan(&self, scope: Scope<'_>) -> Plan {
            diff(
                &PlanInput {
                    generation: 1,
                    desired: &self.desired,
                    observed: &self.observed,
                    managed: &self.managed,
                    drift: &self.drift,
                    config_drift: &self.config_drift,
                    unmanaged: self.unmanaged,
                },
                scope,
            )
        }
    }

    #[test]
    fn test_missing_container_is_created_then_started() {
        let f = Fixture::new().want("web1", Ensure::Present, RunState::Running);
        let plan = f.plan(Scope::All);
        assert_eq!(
            plan.steps(),
            vec![(ActionKind::Create, "web1"), (ActionKind::Start, "web1")]
        );
        assert!(plan.actions.iter().all(|a| a.reason == DriftReason::Missing));
    }

    #[test]
    fn test_missing_stopped_container_is_only_created() {
        let f = Fixture::new().want("web1", Ensure::Present, RunState::Stopped);
        assert_eq!(f.plan(Scope::All).steps(), vec![(ActionKind::Create, "web1")]);
    }

    #[test]
    fn test_converged_state_yields_empty_plan() {
        let f = Fixture::new()
            .want("web1", Ensure::Present, RunState::Running)
            .see("web1", ActiveState::Active)
            .want("db1", Ensure::Present, RunState::Stopped)
            .see("db1", ActiveState::Inactive)
            .want("old", Ensure::Absent, RunState::Running);
        let plan = f.plan(Scope::All);
        assert!(plan.is_empty());
        assert_eq!(plan.converged, vec!["db1", "old", "web1"]);
    }

    #[test]
    fn test_state_mismatches() {
        let f = Fixture::new()
            .want("a", Ensure::Present, RunState::Running)
            .see("a", ActiveState::Inactive)
            .want("b", Ensure::Present, RunState::Stopped)
            .see("b", ActiveState::Active)
            .want("c", Ensure::Present, RunState::Running)
            .see("c", ActiveState::Failed)
            .want("d", Ensure::Present, RunState::Stopped)
            .see("d", ActiveState::Failed);
        let plan = f.plan(Scope::All);
        assert_eq!(
            plan.steps(),
            vec![
                (ActionKind::Start, "a"),
                (ActionKind::Restart, "c"),
                (ActionKind::Stop, "b"),
            ]
        );
        assert!(
            plan.actions
                .iter()
                .all(|a| a.reason == DriftReason::StateMismatch)
        );
    }

    #[test]
    fn test_profile_drift_is_reconfigured() {
        let mut f = Fixture::new()
            .want("web1", Ensure::Present, RunState::Running)
            .see("web1", ActiveState::Active)
            .want("db1", Ensure::Present, RunState::Running)
            .see("db1", ActiveState::Inactive)
            .want("new", Ensure::Present, RunState::Running);
        f.config_drift
            .insert("web1".to_string(), "web1.nspawn differs".to_string());
        f.config_drift
            .insert("db1".to_string(), "override.conf differs".to_string());
        // Containers still to be created get their profile from the create.
        f.config_drift
            .insert("new".to_string(), "missing".to_string());

        let plan = f.plan(Scope::All);
        assert_eq!(
            plan.steps(),
            vec![
                (ActionKind::Configure, "db1"),
                (ActionKind::Create, "new"),
                (ActionKind::Configure, "web1"),
                (ActionKind::Start, "db1"),
                (ActionKind::Start, "new"),
            ]
        );
        let configure = &plan.actions[0];
        assert_eq!(configure.reason, DriftReason::ConfigMismatch);
        assert_eq!(configure.detail, "override.conf differs");
        assert!(!plan.converged.contains(&"web1".to_string()));
    }

    #[test]
    fn test_absent_and_undeclared_containers_are_removed() {
        let mut f = Fixture::new()
            .want("old", Ensure::Absent, RunState::Running)
            .see("old", ActiveState::Active)
            .see("gone", ActiveState::Active);
        f.managed.insert("gone".to_string());
        let plan = f.plan(Scope::All);
        assert_eq!(
            plan.steps(),
            vec![(ActionKind::Remove, "gone"), (ActionKind::Remove, "old")]
        );
    }

    #[test]
    fn test_unmanaged_containers_are_untouched() {
        let mut f = Fixture::new().see("foreign", ActiveState::Active);
        assert!(f.plan(Scope::All).is_empty());
        assert!(f.plan(Scope::All).findings.is_empty());

        f.unmanaged = UnmanagedPolicy::Flag;
        let plan = f.plan(Scope::All);
        assert!(plan.is_empty());
        assert_eq!(plan.findings.len(), 1);
        assert_eq!(plan.findings[0].reason, DriftReason::Extra);
    }

    #[test]
    fn test_phase_ordering() {
        let mut f = Fixture::new()
            .see("zz-old", ActiveState::Active)
            .want("b-stop", Ensure::Present, RunState::Stopped)
            .see("b-stop", ActiveState::Active)
            .want("c-new", Ensure::Present, RunState::Running);
        f.managed.insert("zz-old".to_string());
        let kinds: Vec<ActionKind> = f.plan(Scope::All).actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Create,
                ActionKind::Start,
                ActionKind::Stop,
                ActionKind::Remove,
            ]
        );
    }

    #[test]
    fn test_transitional_and_unknown_are_skipped() {
        let f = Fixture::new()
            .want("a", Ensure::Present, RunState::Running)
            .see("a", ActiveState::Activating)
            .want("b", Ensure::Present, RunState::Stopped)
            .see("b", ActiveState::Unknown);
        let plan = f.plan(Scope::All);
        assert!(plan.is_empty());
        assert!(plan.converged.is_empty());
    }

    #[test]
    fn test_exhausted_container_is_held_until_generation_changes() {
        let mut f = Fixture::new()
            .want("web1", Ensure::Present, RunState::Running)
            .see("web1", ActiveState::Failed);
        let mut record = DriftRecord::new("web1", DriftReason::StateMismatch, "failed");
        record.permanent = true;
        record.generation = 1;
        f.drift.insert("web1".to_string(), record.clone());
        let plan = f.plan(Scope::All);
        assert!(plan.is_empty());
        assert_eq!(plan.held, vec!["web1"]);

        record.generation = 0;
        f.drift.insert("web1".to_string(), record);
        assert_eq!(
            f.plan(Scope::All).steps(),
            vec![(ActionKind::Restart, "web1")]
        );
    }

    #[test]
    fn test_scoped_plan_and_forced_restart() {
        let f = Fixture::new()
            .want("web1", Ensure::Present, RunState::Running)
            .see("web1", ActiveState::Active)
            .want("db1", Ensure::Present, RunState::Running);
        let scoped = f.plan(Scope::One {
            name: "web1",
            force_restart: false,
        });
        assert!(scoped.is_empty());

        let forced = f.plan(Scope::One {
            name: "web1",
            force_restart: true,
        });
        assert_eq!(forced.steps(), vec![(ActionKind::Restart, "web1")]);
    }
}
