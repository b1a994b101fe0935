//! Broker - whole-file reads for out-of-band consumers
//!
//! Exposes `GET_FILE(fid)` to external surfaces (the REST API). Resolves
//! the fid to an up-to-date holder, proxies a chunked read from that
//! driver's router endpoint, and replies with the concatenated bytes.
//! Failures carry an HTTP-like code in the reason text: 404 unknown fid,
//! 408 timeout, 409 state conflict (no holder), 500 internal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onitu_core::{Error, Fid, FileRecord, Result};
use onitu_fabric::{Command, Dealer, FabricError, Reply, Request, RequestHandler, Router};
use onitu_store::{keys, Store};

/// Chunk size used when proxying reads from a holder.
const BROKER_CHUNK_SIZE: u64 = 1024 * 1024;

/// Request router answering `GET_FILE` for external consumers.
pub struct Broker {
    store: Store,
    cancel: CancellationToken,
}

impl Broker {
    /// Builds a broker over an opened store.
    #[must_use]
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancellation token observed by the serving loop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the broker endpoint, publishes it, and serves until shutdown.
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let router = Router::bind()
            .await
            .map_err(|e| Error::service(format!("cannot bind broker router: {e}")))?;
        self.store.put(keys::BROKER_PORT, &router.port()).await?;

        info!(port = router.port(), "Broker listening");

        let handler = Arc::new(BrokerHandler {
            broker: self.clone(),
        });
        router.serve(handler, self.cancel.clone(), 8).await;

        info!("Broker stopped");
        Ok(())
    }

    /// Fetches a whole file from any up-to-date holder.
    async fn fetch_file(&self, fid: Fid) -> std::result::Result<Vec<u8>, String> {
        let record: FileRecord = self
            .store
            .get(&keys::file(&fid))
            .await
            .map_err(|e| format!("500 {e}"))?
            .ok_or_else(|| format!("404 file {fid} not found"))?;

        // Any holder works; lexicographic min keeps it deterministic.
        let holder = record
            .uptodate
            .iter()
            .next()
            .ok_or_else(|| format!("409 no driver holds an up-to-date copy of {fid}"))?;

        let port: u16 = self
            .store
            .get(&keys::router(holder))
            .await
            .map_err(|e| format!("500 {e}"))?
            .ok_or_else(|| format!("500 holder '{holder}' has no router registered"))?;

        let mut dealer = Dealer::connect_local(port)
            .await
            .map_err(|e| format!("500 cannot reach holder '{holder}': {e}"))?;

        debug!(%fid, holder = %holder, size = record.size, "Proxying file read");

        let name = fid.to_string();
        let mut bytes = Vec::with_capacity(record.size as usize);
        let mut offset = 0u64;
        while offset < record.size {
            let wanted = BROKER_CHUNK_SIZE.min(record.size - offset);
            let chunk = match dealer.fetch_chunk(&name, offset, wanted).await {
                Ok(chunk) => chunk,
                Err(FabricError::Timeout) => {
                    return Err(format!("408 holder '{holder}' timed out at offset {offset}"));
                }
                Err(FabricError::Busy) => {
                    return Err(format!("409 holder '{holder}' busy at offset {offset}"));
                }
                Err(err) => return Err(format!("500 {err}")),
            };
            if chunk.is_empty() {
                return Err(format!("500 short read from '{holder}' at offset {offset}"));
            }
            offset += chunk.len() as u64;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

struct BrokerHandler {
    broker: Arc<Broker>,
}

#[async_trait::async_trait]
impl RequestHandler for BrokerHandler {
    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Command(Command::GetFile { fid }) => {
                match self.broker.fetch_file(fid).await {
                    Ok(bytes) => Reply::Bytes(bytes),
                    Err(reason) => {
                        warn!(%fid, reason, "GET_FILE failed");
                        Reply::Error(reason)
                    }
                }
            }
            Request::Command(other) => {
                Reply::Error(format!("409 unsupported command {:#04x} at the broker", other.tag()))
            }
            Request::Chunk { .. } => Reply::Error("409 the broker serves whole files only".into()),
        }
    }
}
