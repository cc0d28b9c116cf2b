//! Per-connection request handling.
//!
//! A connection is authenticated once from the socket's peer credentials,
//! then reads one JSON request per line and answers each in order. Reads
//! are served from the store; everything mutating goes through the agent
//! and is bounded by the request timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::agent::{AgentHandle, Operation};
use crate::audit::AuditLogger;
use crate::error::{AgentError, Result};
use crate::model::{Ensure, Profile};
use crate::protocol::{
    Command, ListKind, ProtocolError, Request, Response, StatusCode, read_frame, write_frame,
};
use crate::reconciler::ActionReport;
use crate::store::{ContainerView, StateStore};

/// Caller identity taken from the transport, never from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl Identity {
    pub fn of(stream: &UnixStream) -> std::io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

/// Decides which identities may run mutating commands.
#[derive(Debug, Clone)]
pub struct Authorizer {
    privileged_uids: Vec<u32>,
    privileged_gid: Option<u32>,
}

impl Authorizer {
    pub fn new(privileged_uids: Vec<u32>, privileged_gid: Option<u32>) -> Self {
        Self {
            privileged_uids,
            privileged_gid,
        }
    }

    pub fn is_elevated(&self, identity: &Identity) -> bool {
        self.privileged_uids.contains(&identity.uid) || self.privileged_gid == Some(identity.gid)
    }

    pub fn authorize(&self, identity: &Identity, command: &Command) -> Result<()> {
        if command.is_mutating() && !self.is_elevated(identity) {
            return Err(AgentError::Authorization(format!(
                "{} requires an elevated identity (uid {})",
                command.verb(),
                identity.uid
            )));
        }
        Ok(())
    }
}

/// Payload of `status` without a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub node: String,
    pub generation: u64,
    pub last_pass: Option<DateTime<Utc>>,
    pub last_collection: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerView>,
}

pub struct ServerContext {
    pub store: Arc<StateStore>,
    pub agent: AgentHandle,
    pub auth: Authorizer,
    pub audit: Arc<AuditLogger>,
    pub request_timeout: Duration,
}

pub async fn handle_connection(stream: UnixStream, ctx: Arc<ServerContext>) {
    let span = info_span!("connection", id = %Uuid::new_v4());
    serve(stream, ctx).instrument(span).await
}

async fn serve(stream: UnixStream, ctx: Arc<ServerContext>) {
    let identity = match Identity::of(&stream) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Peer credentials unavailable, closing: {}", e);
            return;
        }
    };
    debug!(uid = identity.uid, pid = ?identity.pid, "Client connected");

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                let response = Response::error(0, StatusCode::BadRequest, e.to_string());
                let _ = write_frame(&mut write, &response).await;
                break;
            }
            Err(e) => {
                debug!("Connection error: {}", e);
                break;
            }
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => dispatch(&ctx, &identity, request).await,
            Err(e) => Response::error(
                request_id(&frame),
                StatusCode::BadRequest,
                format!("malformed request: {e}"),
            ),
        };
        if let Err(e) = write_frame(&mut write, &response).await {
            // The caller went away; whatever the request did stays done.
            debug!(id = response.id, "Failed to write response: {}", e);
            break;
        }
    }
    debug!("Client disconnected");
}

/// Best-effort id of a request that failed to parse.
fn request_id(frame: &[u8]) -> u64 {
    serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}

/// Authorize and execute one request.
pub async fn dispatch(ctx: &ServerContext, identity: &Identity, request: Request) -> Response {
    let Request { id, command } = request;
    if let Err(e) = ctx.auth.authorize(identity, &command) {
        ctx.audit.request_denied(identity.uid, command.verb());
        return Response::error(id, e.status_code(), e.to_string());
    }

    debug!(id, command = command.verb(), "Dispatching");
    let result = if command.is_mutating() {
        match tokio::time::timeout(ctx.request_timeout, execute(ctx, id, command)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::RequestTimeout(ctx.request_timeout)),
        }
    } else {
        execute(ctx, id, command).await
    };

    result.unwrap_or_else(|e| {
        debug!(id, "Request failed: {}", e);
        Response::error(id, e.status_code(), e.to_string())
    })
}

async fn execute(ctx: &ServerContext, id: u64, command: Command) -> Result<Response> {
    let payload = match command {
        Command::Status { name: None } => to_json(&AgentStatus {
            node: ctx.store.node().to_string(),
            generation: ctx.store.generation(),
            last_pass: ctx.store.last_pass(),
            last_collection: ctx.store.last_collection(),
            containers: ctx.store.observed_views(),
        })?,
        Command::Status { name: Some(name) } => {
            let view = ctx
                .store
                .view(&name)
                .ok_or_else(|| AgentError::NotFound(format!("container {name}")))?;
            to_json(&view)?
        }
        Command::List {
            kind: ListKind::Containers,
        } => to_json(&listed_containers(&ctx.store))?,
        Command::List {
            kind: ListKind::Profiles,
        }
        | Command::ProfileList => to_json(&profiles(&ctx.store))?,
        Command::List {
            kind: ListKind::Images,
        }
        | Command::ImageList => to_json(&ctx.agent.image_list().await?)?,
        Command::Spawn { name } => return apply(ctx, id, Operation::Spawn, &name).await,
        Command::Start { name } => return apply(ctx, id, Operation::Start, &name).await,
        Command::Stop { name } => return apply(ctx, id, Operation::Stop, &name).await,
        Command::Restart { name } => return apply(ctx, id, Operation::Restart, &name).await,
        Command::Remove { name } => return apply(ctx, id, Operation::Remove, &name).await,
        Command::Exec { name, argv } => to_json(&ctx.agent.exec(&name, argv).await?)?,
        Command::Shell { name } => {
            let argv = ctx.agent.shell(&name).await?;
            serde_json::json!({ "argv": argv })
        }
        Command::ImagePull { name } => to_json(&ctx.agent.image_pull(&name).await?)?,
        Command::ConfigValidate => to_json(&ctx.agent.validate().await?)?,
        Command::ConfigReload => to_json(&ctx.agent.reload().await?)?,
    };
    Ok(Response::success(id, payload))
}

/// Run a lifecycle operation; a failed action still carries its report.
async fn apply(ctx: &ServerContext, id: u64, op: Operation, name: &str) -> Result<Response> {
    let report: ActionReport = ctx.agent.apply(op, name).await?;
    let payload = to_json(&report)?;
    Ok(match report.failure() {
        None => Response::success(id, payload),
        Some(failure) => Response {
            id,
            status: failure.code,
            payload: Some(payload),
            error: Some(failure.message.clone()),
        },
    })
}

/// Containers on the host plus those declared present.
fn listed_containers(store: &StateStore) -> Vec<ContainerView> {
    store
        .all_views()
        .into_iter()
        .filter(|v| {
            v.observed.is_some()
                || v.desired
                    .as_ref()
                    .is_some_and(|d| d.ensure == Ensure::Present)
        })
        .collect()
}

fn profiles(store: &StateStore) -> Vec<Profile> {
    store.desired().profiles.values().cloned().collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AgentError::Internal(e.to_string()))
}
