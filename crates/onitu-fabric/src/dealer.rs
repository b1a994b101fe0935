//! Dealer - the connect-and-request side of the fabric
//!
//! A dealer dials a router endpoint and issues requests over one
//! connection; replies come back in request order. Reconnection is the
//! caller's business and is transparent to the protocol - a fresh dealer on
//! a fresh connection continues where the old one left off (resumability is
//! handled above this layer, via `upload_id`).

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::command::{Command, Reply, Request};
use crate::frames::{read_frames, write_frames};
use crate::FabricError;

/// Default per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One connection to a router endpoint.
pub struct Dealer {
    stream: TcpStream,
    timeout: Duration,
}

impl Dealer {
    /// Dials a router at an arbitrary address.
    pub async fn connect(addr: &str) -> Result<Self, FabricError> {
        let stream = TcpStream::connect(addr).await?;
        debug!(addr, "Dealer connected");
        Ok(Self {
            stream,
            timeout: REQUEST_TIMEOUT,
        })
    }

    /// Dials a router on localhost by port (the common case: all processes
    /// of a session are colocated).
    pub async fn connect_local(port: u16) -> Result<Self, FabricError> {
        Self::connect(&format!("127.0.0.1:{port}")).await
    }

    /// Overrides the per-request deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and reads one reply.
    async fn exchange(&mut self, request: &Request) -> Result<Vec<Vec<u8>>, FabricError> {
        let frames = request.to_frames();
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        write_frames(&mut self.stream, &refs).await?;

        let reply = tokio::time::timeout(self.timeout, read_frames(&mut self.stream))
            .await
            .map_err(|_| FabricError::Timeout)??;
        reply.ok_or_else(|| FabricError::Protocol("connection closed before reply".into()))
    }

    /// Requests a chunk: `(name, offset, size)` -> at most `size` bytes.
    pub async fn fetch_chunk(
        &mut self,
        name: &str,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, FabricError> {
        let request = Request::Chunk {
            name: name.to_string(),
            offset,
            size,
        };
        match Reply::decode_data(self.exchange(&request).await?)? {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Busy => Err(FabricError::Busy),
            Reply::Error(reason) => Err(FabricError::Remote(reason)),
            Reply::Ok => Err(FabricError::Protocol("bare OK to a chunk request".into())),
        }
    }

    /// Delivers a command and waits for the acknowledgement.
    pub async fn send_command(&mut self, command: &Command) -> Result<(), FabricError> {
        let request = Request::Command(command.clone());
        match Reply::decode_ack(self.exchange(&request).await?)? {
            Reply::Ok => Ok(()),
            Reply::Busy => Err(FabricError::Busy),
            Reply::Error(reason) => Err(FabricError::Remote(reason)),
            Reply::Bytes(_) => Err(FabricError::Protocol("data reply to a command".into())),
        }
    }

    /// Delivers a command and returns the raw data reply (broker
    /// `GET_FILE`).
    pub async fn request_file(&mut self, command: &Command) -> Result<Vec<u8>, FabricError> {
        let request = Request::Command(command.clone());
        match Reply::decode_data(self.exchange(&request).await?)? {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Busy => Err(FabricError::Busy),
            Reply::Error(reason) => Err(FabricError::Remote(reason)),
            Reply::Ok => Err(FabricError::Protocol("bare OK to a file request".into())),
        }
    }
}
