//! Container lifecycle over the control socket
//!
//! Convergence from an empty host, status round-trip, and pruning of a
//! container removed from the desired state.

mod harness;

use chimera_agent::agent::ReloadReport;
use chimera_agent::model::ActiveState;
use chimera_agent::protocol::{Command, ListKind, StatusCode};
use chimera_agent::reconciler::ActionReport;
use chimera_agent::reconciler::plan::{ActionKind, ActionStatus};
use chimera_agent::server::AgentStatus;
use chimera_agent::store::ContainerView;
use chimera_agent::systemd::JobVerb;
use chimera_agent::test_util::sample_document;

use harness::{TestAgent, empty_node, two_containers};

#[tokio::test]
async fn test_converges_from_empty_host() {
    let agent = TestAgent::start(sample_document("host1")).await;

    let response = agent
        .call(Command::Status {
            name: Some("web1".to_string()),
        })
        .await;
    assert_eq!(response.status, StatusCode::Success);
    let view: ContainerView = response.payload_as().unwrap().unwrap();
    assert_eq!(view.observed.unwrap().active, ActiveState::Active);
    assert!(view.managed);
    assert!(view.drift.is_none());

    let jobs = agent.manager().submitted_jobs();
    assert_eq!(
        jobs,
        vec![
            ("web1".to_string(), JobVerb::Enable),
            ("web1".to_string(), JobVerb::Start)
        ]
    );
}

#[tokio::test]
async fn test_reload_of_converged_state_plans_nothing() {
    let agent = TestAgent::start(sample_document("host1")).await;
    let before = agent.manager().submitted_jobs().len();

    let response = agent.call(Command::ConfigReload).await;
    assert_eq!(response.status, StatusCode::Success);
    let report: ReloadReport = response.payload_as().unwrap().unwrap();
    assert_eq!(report.generation, 2);
    assert!(report.actions.is_empty());
    assert_eq!(agent.manager().submitted_jobs().len(), before);
}

#[tokio::test]
async fn test_status_reports_last_collection() {
    let agent = TestAgent::start(two_containers()).await;
    // Created outside the document; ignored but still observed.
    agent.manager().add_container("stray", ActiveState::Active);
    agent.stack.reconciler.full_pass().await.unwrap();

    let response = agent.call(Command::Status { name: None }).await;
    let status: AgentStatus = response.payload_as().unwrap().unwrap();
    assert_eq!(status.node, "host1");
    assert!(status.last_collection.is_some());
    assert!(status.last_pass.is_some());
    let names: Vec<&str> = status.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["stray", "web1", "web2"]);
    let stray = &status.containers[0];
    assert!(!stray.managed);
    assert!(stray.desired.is_none());
}

#[tokio::test]
async fn test_removed_from_document_is_pruned() {
    let agent = TestAgent::start(sample_document("host1")).await;
    agent.stack.loader.set(empty_node());

    let response = agent.call(Command::ConfigReload).await;
    assert_eq!(response.status, StatusCode::Success);
    let report: ReloadReport = response.payload_as().unwrap().unwrap();
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].kind, ActionKind::Remove);
    assert_eq!(report.actions[0].name, "web1");
    assert_eq!(report.actions[0].status, ActionStatus::Succeeded);
    assert_eq!(agent.manager().state("web1"), None);

    let response = agent
        .call(Command::List {
            kind: ListKind::Containers,
        })
        .await;
    let containers: Vec<ContainerView> = response.payload_as().unwrap().unwrap();
    assert!(containers.iter().all(|c| c.name != "web1"));
}

#[tokio::test]
async fn test_stop_then_start_on_one_connection() {
    let agent = TestAgent::start(sample_document("host1")).await;
    let mut client = agent.client().await;

    let response = client
        .call(Command::Stop {
            name: "web1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::Success);
    let report: ActionReport = response.payload_as().unwrap().unwrap();
    assert_eq!(report.observed.unwrap().active, ActiveState::Inactive);

    // A stopped container stays stopped across periodic passes.
    agent.stack.reconciler.full_pass().await.unwrap();
    assert_eq!(agent.manager().state("web1"), Some(ActiveState::Inactive));

    let response = client
        .call(Command::Start {
            name: "web1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::Success);
    assert_eq!(agent.manager().state("web1"), Some(ActiveState::Active));
}

#[tokio::test]
async fn test_exec_and_shell() {
    let agent = TestAgent::start(sample_document("host1")).await;

    let response = agent
        .call(Command::Exec {
            name: "web1".to_string(),
            argv: vec!["uname".to_string(), "-a".to_string()],
        })
        .await;
    assert_eq!(response.status, StatusCode::Success);
    let payload = response.payload.unwrap();
    assert_eq!(payload["stdout"], "uname -a\n");
    assert_eq!(payload["exit_code"], 0);

    let response = agent
        .call(Command::Shell {
            name: "web1".to_string(),
        })
        .await;
    assert_eq!(
        response.payload.unwrap()["argv"],
        serde_json::json!(["machinectl", "shell", "web1"])
    );
}
