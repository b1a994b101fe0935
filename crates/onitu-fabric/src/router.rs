//! Router endpoint - identity-addressed request serving
//!
//! A router binds an ephemeral TCP port (published by the caller in the
//! metadata store) and answers requests from any number of dialing peers.
//! Each accepted connection is one peer identity; its requests are handled
//! strictly in order, so replies never interleave within a connection.
//! Across connections, handling runs concurrently up to a bounded number of
//! in-flight requests - on overflow the peer gets an explicit [`Reply::Busy`]
//! instead of a silent drop.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Reply, Request};
use crate::frames::{read_frames, write_frames};
use crate::FabricError;

/// Serves the requests arriving at a router endpoint.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request; the returned reply goes back to the same peer.
    async fn handle(&self, request: Request) -> Reply;
}

/// A bound router endpoint, not yet serving.
pub struct Router {
    listener: TcpListener,
    port: u16,
}

impl Router {
    /// Binds a router on an ephemeral localhost port.
    pub async fn bind() -> Result<Self, FabricError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "Router endpoint bound");
        Ok(Self { listener, port })
    }

    /// The bound port, for publication in the store.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept-and-serve loop; returns when `cancel` fires.
    ///
    /// `max_inflight` bounds concurrently executing handlers across all
    /// peers; requests beyond the bound receive [`Reply::Busy`].
    pub async fn serve(
        self,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
        max_inflight: usize,
    ) {
        let inflight = Arc::new(Semaphore::new(max_inflight));

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = cancel.cancelled() => {
                    info!(port = self.port, "Router shutting down");
                    return;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Peer connected to router");
                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    let inflight = inflight.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_peer(stream, handler, cancel, inflight).await {
                            debug!(%peer, error = %err, "Peer connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Router accept failed");
                }
            }
        }
    }
}

/// Sequential request loop for one peer connection.
async fn serve_peer(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    inflight: Arc<Semaphore>,
) -> Result<(), FabricError> {
    loop {
        let frames = tokio::select! {
            frames = read_frames(&mut stream) => frames?,
            () = cancel.cancelled() => return Ok(()),
        };
        let Some(frames) = frames else {
            return Ok(()); // peer closed cleanly
        };

        let reply = match Request::from_frames(&frames) {
            Ok(request) => match inflight.clone().try_acquire_owned() {
                Ok(_permit) => handler.handle(request).await,
                Err(_) => Reply::Busy,
            },
            Err(err) => Reply::Error(err.to_string()),
        };

        let frames = reply.to_frames();
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        write_frames(&mut stream, &refs).await?;
    }
}
