//! Client side of the control socket.

use std::path::Path;

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::protocol::{Command, ProtocolError, Request, Response, read_frame, write_frame};

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            next_id: 1,
        })
    }

    /// Send one command and wait for its response.
    pub async fn call(&mut self, command: Command) -> Result<Response, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;
        write_frame(&mut self.writer, &Request { id, command }).await?;

        let frame = read_frame(&mut self.reader).await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed the connection",
            )
        })?;
        Ok(serde_json::from_slice(&frame)?)
    }
}
