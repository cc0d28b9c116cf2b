//! Control socket behaviour
//!
//! Authorization from peer credentials, per-name conflicts, isolation
//! between names, and rejection of malformed input.

mod harness;

use std::time::{Duration, Instant};

use chimera_agent::protocol::{Command, MAX_FRAME_LEN, Response, StatusCode};
use chimera_agent::test_util::sample_document;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use harness::{TestAgent, two_containers};

fn stop(name: &str) -> Command {
    Command::Stop {
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_unprivileged_caller_is_denied() {
    let agent = TestAgent::unprivileged(sample_document("host1")).await;
    let before = agent.manager().submitted_jobs();

    let response = agent
        .call(Command::Spawn {
            name: "web1".to_string(),
        })
        .await;
    assert_eq!(response.status, StatusCode::Denied);
    assert!(response.payload.is_none());
    assert_eq!(agent.manager().submitted_jobs(), before);

    // Reads stay open to everyone.
    let response = agent.call(Command::Status { name: None }).await;
    assert_eq!(response.status, StatusCode::Success);
    let response = agent.call(Command::ConfigValidate).await;
    assert_eq!(response.status, StatusCode::Success);
}

#[tokio::test]
async fn test_same_name_conflicts() {
    let agent = TestAgent::start(sample_document("host1")).await;
    agent
        .manager()
        .delay_jobs("web1", Duration::from_millis(500));

    let (a, b) = tokio::join!(agent.call(stop("web1")), agent.call(stop("web1")));
    let mut statuses = vec![a.status, b.status];
    statuses.sort_by_key(|s| s.exit_code());
    assert_eq!(statuses, vec![StatusCode::Success, StatusCode::Conflict]);

    let stops = agent
        .manager()
        .submitted_jobs()
        .iter()
        .filter(|(name, _)| name == "web1")
        .filter(|(_, verb)| *verb == chimera_agent::systemd::JobVerb::Stop)
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn test_different_names_do_not_block() {
    let agent = TestAgent::start(two_containers()).await;
    agent
        .manager()
        .delay_jobs("web1", Duration::from_millis(1500));

    let started = Instant::now();
    let slow = agent.call(stop("web1"));
    let fast = async {
        // Let the slow request claim web1 first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = agent.call(stop("web2")).await;
        (response, started.elapsed())
    };
    let (slow, (fast, fast_elapsed)) = tokio::join!(slow, fast);

    assert_eq!(slow.status, StatusCode::Success);
    assert_eq!(fast.status, StatusCode::Success);
    assert!(fast_elapsed < Duration::from_millis(1000));
}

async fn raw_exchange(agent: &TestAgent, line: &[u8]) -> Option<Response> {
    let stream = UnixStream::connect(&agent.socket).await.unwrap();
    let (read, mut write) = stream.into_split();
    write.write_all(line).await.unwrap();
    let mut reader = BufReader::new(read);
    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    serde_json::from_str(reply.trim_end()).ok()
}

#[tokio::test]
async fn test_malformed_requests() {
    let agent = TestAgent::start(sample_document("host1")).await;

    let response = raw_exchange(&agent, b"{\"id\":9,\"command\":\"format_disk\"}\n")
        .await
        .unwrap();
    assert_eq!(response.id, 9);
    assert_eq!(response.status, StatusCode::BadRequest);

    let response = raw_exchange(&agent, b"not json\n").await.unwrap();
    assert_eq!(response.status, StatusCode::BadRequest);

    let mut oversized = vec![b'x'; MAX_FRAME_LEN + 16];
    oversized.push(b'\n');
    let response = raw_exchange(&agent, &oversized).await.unwrap();
    assert_eq!(response.status, StatusCode::BadRequest);
}

#[tokio::test]
async fn test_unknown_names() {
    let agent = TestAgent::start(sample_document("host1")).await;

    let response = agent
        .call(Command::Spawn {
            name: "ghost".to_string(),
        })
        .await;
    assert_eq!(response.status, StatusCode::NotFound);

    let response = agent
        .call(Command::ImagePull {
            name: "debian-13".to_string(),
        })
        .await;
    assert_eq!(response.status, StatusCode::NotFound);
}
