//! Control-channel wire contract.
//!
//! One JSON object per line in each direction. A request carries a
//! client-chosen `id`, echoed in the response:
//!
//! ```text
//! {"id":7,"command":"spawn","name":"web1"}
//! {"id":7,"status":"success","payload":{...}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line, newline included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Images,
    Containers,
    Profiles,
}

/// Commands accepted on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    List { kind: ListKind },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Spawn { name: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Remove { name: String },
    Exec { name: String, argv: Vec<String> },
    Shell { name: String },
    ImagePull { name: String },
    ImageList,
    ConfigValidate,
    ConfigReload,
    ProfileList,
}

impl Command {
    /// Commands that require the elevated identity.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Spawn { .. }
                | Command::Start { .. }
                | Command::Stop { .. }
                | Command::Restart { .. }
                | Command::Remove { .. }
                | Command::Exec { .. }
                | Command::Shell { .. }
                | Command::ImagePull { .. }
                | Command::ConfigReload
        )
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::List { .. } => "list",
            Command::Status { .. } => "status",
            Command::Spawn { .. } => "spawn",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Restart { .. } => "restart",
            Command::Remove { .. } => "remove",
            Command::Exec { .. } => "exec",
            Command::Shell { .. } => "shell",
            Command::ImagePull { .. } => "image pull",
            Command::ImageList => "image list",
            Command::ConfigValidate => "config validate",
            Command::ConfigReload => "config reload",
            Command::ProfileList => "profile list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Outcome class surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    Success,
    NotFound,
    Conflict,
    Denied,
    UpstreamFailure,
    Timeout,
    BadRequest,
    Internal,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        *self == StatusCode::Success
    }

    /// Process exit code used by the client.
    pub fn exit_code(&self) -> i32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::UpstreamFailure | StatusCode::Internal => 1,
            StatusCode::NotFound => 2,
            StatusCode::Conflict => 3,
            StatusCode::Denied => 4,
            StatusCode::Timeout => 5,
            StatusCode::BadRequest => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: u64, payload: serde_json::Value) -> Self {
        Self {
            id,
            status: StatusCode::Success,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: u64, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            payload: None,
            error: Some(message.into()),
        }
    }

    /// Decode the payload into a typed view.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        match &self.payload {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Read one line. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_FRAME_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() >= MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN));
    }
    Ok(Some(line))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
