//! Chunked transfer execution - the target side of a transfer order
//!
//! A transfer pulls chunks from the source driver's router and drives the
//! backend through the upload state machine:
//!
//! ```text
//! Idle -> Opening -> Writing(offset) -> Committing -> Committed
//!                                    `-> Aborted
//! ```
//!
//! Resumability: the acknowledged offset and the backend's `upload_id` are
//! persisted in this driver's extras after every chunk. After a crash the
//! plug finds `upload_id` present and resumes from the next unacknowledged
//! offset; backends that disagree must tolerate the replay at the same
//! offset (the contract requires idempotence there), or fail the chunk with
//! a service error so the referee re-orders.
//!
//! A failed transfer leaves `upload_id` in the extras for a later resume;
//! the plug does not retry on its own.

use tracing::{debug, info, warn};
use uuid::Uuid;

use onitu_core::{DriverName, Error, Fid, Result};
use onitu_fabric::{Command, Dealer, FabricError};

use crate::plug::Plug;

/// Phase of the upload state machine, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// No transfer in progress.
    Idle,
    /// `start_upload` running.
    Opening,
    /// Chunks flowing; the offset is the next byte to write.
    Writing(u64),
    /// `end_upload` running.
    Committing,
    /// Commit confirmed; `upload_id` cleared.
    Committed,
    /// Abandoned via `abort_upload`.
    Aborted,
}

/// Spawns a transfer task for an order received from the referee.
///
/// Duplicate orders for an in-flight `(fid, source)` are a no-op thanks to
/// the lease; the acknowledgement to the referee happens before the
/// transfer completes (completion is reported separately with
/// `TRANSFER_COMPLETE`).
pub(crate) fn spawn(plug: Plug, fid: Fid, source: DriverName, size: u64) {
    if source == *plug.name() {
        debug!(%fid, "Ignoring transfer order naming ourselves as source");
        return;
    }
    if !plug.claim_lease(fid, &source) {
        return;
    }

    tokio::spawn(async move {
        let transfer_id = Uuid::new_v4();
        let result = run(&plug, fid, &source, size, transfer_id).await;
        plug.release_lease(&fid);
        match result {
            Ok(()) => {}
            Err(err) if err.is_shutdown() => {
                debug!(%fid, %transfer_id, "Transfer stopped by shutdown");
            }
            Err(err) => {
                warn!(
                    %fid,
                    %transfer_id,
                    source = %source,
                    error = %err,
                    "Transfer failed; upload state kept for resume"
                );
            }
        }
    });
}

/// Executes one transfer under the fid's serialization lock.
async fn run(
    plug: &Plug,
    fid: Fid,
    source: &DriverName,
    size: u64,
    transfer_id: Uuid,
) -> Result<()> {
    let _guard = plug.lock_fid(fid).await;

    let mut meta = plug
        .get_metadata_by_fid(fid)
        .await?
        .ok_or_else(|| Error::service(format!("transfer ordered for unknown fid {fid}")))?;

    if meta.uptodate.contains(plug.name()) {
        debug!(%fid, "Already up to date, acknowledging without transfer");
        return report_complete(plug, fid).await;
    }

    let backend = plug.backend()?;
    let mut phase = UploadPhase::Idle;

    // Resume or open. The backend's reported offset wins on disagreement;
    // we replay from the acknowledged offset, which the backend must accept
    // idempotently.
    let mut offset = if meta.upload_id().is_some() {
        let resume_at = meta.acknowledged_offset();
        info!(
            %fid,
            %transfer_id,
            resume_at,
            upload_id = meta.upload_id().unwrap_or_default(),
            "Resuming interrupted upload"
        );
        advance(&fid, &mut phase, UploadPhase::Writing(resume_at));
        resume_at
    } else {
        advance(&fid, &mut phase, UploadPhase::Opening);
        backend.start_upload(&mut meta).await?;
        plug.write_extras(&meta).await?;
        0
    };

    info!(
        %fid,
        %transfer_id,
        source = %source,
        size,
        offset,
        "Transfer started"
    );

    let port = plug.router_port_of(source).await?;
    let mut dealer = Dealer::connect_local(port)
        .await
        .map_err(|e| Error::service(format!("cannot reach source '{source}': {e}")))?;

    let chunk_size = plug.chunk_size();
    let name = fid.to_string();

    if size == 0 {
        // Empty file: commit with one zero-length chunk.
        advance(&fid, &mut phase, UploadPhase::Writing(0));
        backend.upload_chunk(&mut meta, 0, &[]).await?;
    }

    while offset < size {
        let wanted = chunk_size.min(size - offset);
        let chunk = match dealer.fetch_chunk(&name, offset, wanted).await {
            Ok(chunk) => chunk,
            Err(FabricError::Busy) => {
                return Err(Error::service(format!(
                    "source '{source}' busy at offset {offset}"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if chunk.is_empty() {
            return Err(Error::service(format!(
                "source '{source}' returned no data at offset {offset} (file shrunk?)"
            )));
        }

        backend.upload_chunk(&mut meta, offset, &chunk).await?;
        offset += chunk.len() as u64;
        advance(&fid, &mut phase, UploadPhase::Writing(offset));

        meta.set_acknowledged_offset(offset);
        plug.write_extras(&meta).await?;
    }

    debug_assert!(matches!(phase, UploadPhase::Writing(_)));
    advance(&fid, &mut phase, UploadPhase::Committing);

    // A revision mismatch surfaces here as a service error and is not
    // retried: the referee observes the newer remote revision on its next
    // intake and reschedules.
    backend.end_upload(&mut meta).await?;

    meta.clear_upload_state();
    meta.size = size;
    plug.write_metadata(&meta).await?;
    advance(&fid, &mut phase, UploadPhase::Committed);

    info!(%fid, %transfer_id, size, "Transfer committed");
    report_complete(plug, fid).await
}

/// Logs and applies one state-machine transition.
fn advance(fid: &Fid, phase: &mut UploadPhase, next: UploadPhase) {
    debug!(%fid, from = ?*phase, to = ?next, "Upload phase");
    *phase = next;
}

async fn report_complete(plug: &Plug, fid: Fid) -> Result<()> {
    plug.notify_referee(Command::TransferComplete {
        fid,
        driver: plug.name().clone(),
    })
    .await
}

/// Spawns the application of a deletion order from the referee.
pub(crate) fn spawn_delete(plug: Plug, fid: Fid) {
    tokio::spawn(async move {
        if let Err(err) = apply_delete(&plug, fid).await {
            if err.is_shutdown() {
                debug!(%fid, "Deletion stopped by shutdown");
            } else {
                warn!(%fid, error = %err, "Deletion order failed");
            }
        }
    });
}

/// Applies a deletion order: remove the backend file, then confirm to the
/// referee. Idempotent end to end - an already-gone record or file still
/// confirms.
async fn apply_delete(plug: &Plug, fid: Fid) -> Result<()> {
    let _guard = plug.lock_fid(fid).await;

    if let Some(meta) = plug.get_metadata_by_fid(fid).await? {
        let backend = plug.backend()?;
        backend.delete_file(&meta).await?;
        info!(%fid, filename = %meta.filename, "Deletion order applied");
    } else {
        debug!(%fid, "Deletion order for unknown record, confirming anyway");
    }

    plug.notify_referee(Command::Delete {
        fid,
        driver: plug.name().clone(),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_progression_shape() {
        // The machine only ever moves forward; Writing carries the next
        // offset to write.
        let phases = [
            UploadPhase::Idle,
            UploadPhase::Opening,
            UploadPhase::Writing(0),
            UploadPhase::Writing(1024),
            UploadPhase::Committing,
            UploadPhase::Committed,
        ];
        for pair in phases.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(UploadPhase::Writing(7), UploadPhase::Writing(7));
        assert_ne!(UploadPhase::Writing(7), UploadPhase::Writing(8));
        assert_ne!(UploadPhase::Committed, UploadPhase::Aborted);
    }
}
