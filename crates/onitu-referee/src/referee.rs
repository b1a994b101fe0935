//! Referee event loop and lease bookkeeping
//!
//! Per metadata-change event:
//! 1. Load the record (deriving `owners` from the routing rules when the
//!    reporter could not).
//! 2. `targets = owners \ uptodate`; for each target without an
//!    outstanding lease pick the lexicographically smallest source in
//!    `uptodate` and publish `TRANSFER(fid, source, size)`.
//! 3. `TRANSFER_COMPLETE(fid, t)` atomically adds `t` to `uptodate`.
//! 4. `DELETE(fid, d)` shrinks ownership and propagates the deletion; the
//!    record disappears once the last owner confirmed.
//!
//! Leases are in-memory only. At startup - and periodically, to re-issue
//! orders lost to a crashed target - the referee rescans records with
//! `uptodate ⊊ owners`; targets treat re-issued orders for an in-flight
//! transfer as a no-op.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onitu_core::{DriverName, Error, Fid, FileRecord, Result, RuleSet};
use onitu_fabric::{Command, Dealer, Reply, Request, RequestHandler, Router};
use onitu_store::{keys, Store};

/// How often pending records are rescanned for lost orders.
const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Age after which an unanswered lease is considered lost and re-issued.
const LEASE_TIMEOUT: Duration = Duration::from_secs(60);

struct Lease {
    source: DriverName,
    issued: Instant,
}

/// The central arbiter. One per session.
pub struct Referee {
    store: Store,
    rules: RuleSet,
    /// Outstanding transfer orders: `(fid, target)` -> lease.
    leases: DashMap<(Fid, DriverName), Lease>,
    cancel: CancellationToken,
}

impl Referee {
    /// Builds a referee over an opened store.
    #[must_use]
    pub fn new(store: Store, rules: RuleSet) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            store,
            rules,
            leases: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Cancellation token observed by the serving loops.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the command endpoint, publishes it, reconstructs outstanding
    /// work, and serves until shutdown.
    pub async fn listen(self: std::sync::Arc<Self>) -> Result<()> {
        let router = Router::bind()
            .await
            .map_err(|e| Error::service(format!("cannot bind referee router: {e}")))?;
        self.store.put(keys::REFEREE_PORT, &router.port()).await?;

        info!(port = router.port(), "Referee listening");

        self.reissue_pending().await?;

        let rescan = self.clone();
        let rescan_cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESCAN_INTERVAL);
            tick.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = rescan.reissue_pending().await {
                            if err.is_shutdown() {
                                return;
                            }
                            warn!(error = %err, "Pending rescan failed");
                        }
                    }
                    () = rescan_cancel.cancelled() => return,
                }
            }
        });

        let handler = std::sync::Arc::new(RefereeHandler { referee: self.clone() });
        router.serve(handler, self.cancel.clone(), 16).await;

        info!("Referee stopped");
        Ok(())
    }

    /// Requests shutdown of the serving loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Scans for records whose `uptodate` lags `owners` and (re-)issues
    /// transfer orders, skipping fresh leases.
    async fn reissue_pending(&self) -> Result<()> {
        let mut pending = 0usize;
        for (key, value) in self.store.range(keys::FILE_PREFIX).await? {
            let Some(fid) = keys::fid_of_record_key(&key) else {
                continue;
            };
            let record: FileRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key, error = %err, "Skipping corrupt record");
                    continue;
                }
            };
            if !record.uptodate.is_empty() && record.uptodate != record.owners {
                pending += 1;
                self.schedule_transfers(fid, &record).await;
            }
        }
        if pending > 0 {
            debug!(pending, "Pending records rescanned");
        }
        Ok(())
    }

    async fn load_record(&self, fid: Fid) -> Result<Option<FileRecord>> {
        Ok(self.store.get(&keys::file(&fid)).await?)
    }

    /// A driver reported a new or updated record.
    async fn handle_update(&self, fid: Fid, reporter: &DriverName) -> Result<()> {
        let Some(mut record) = self.load_record(fid).await? else {
            warn!(%fid, %reporter, "Update report for unknown record");
            return Ok(());
        };

        if record.owners.is_empty() {
            record.owners = self.rules.owners_for(&record.folder, &record.filename);
            if record.owners.is_empty() {
                debug!(%fid, "No routing rule matches; ignoring update");
                return Ok(());
            }
            self.store.put(&keys::file(&fid), &record).await?;
        }

        // The reporter holds a fresh version: leases issued against older
        // content are now stale.
        self.drop_leases_of(fid);

        info!(
            %fid,
            filename = %record.filename,
            reporter = %reporter,
            owners = record.owners.len(),
            "Metadata update"
        );

        self.schedule_transfers(fid, &record).await;
        Ok(())
    }

    /// Issues transfer orders for every target lacking the latest version.
    async fn schedule_transfers(&self, fid: Fid, record: &FileRecord) {
        // Deterministic tie-break: lexicographically smallest holder.
        let Some(source) = record.uptodate.iter().next().cloned() else {
            debug!(%fid, "No up-to-date source available yet");
            return;
        };

        for target in record.owners.difference(&record.uptodate) {
            let lease_key = (fid, target.clone());
            if let Some(lease) = self.leases.get(&lease_key) {
                if lease.issued.elapsed() < LEASE_TIMEOUT {
                    continue;
                }
                debug!(%fid, target = %target, "Lease expired, re-issuing order");
            }

            match self
                .send_order(
                    target,
                    &Command::Transfer {
                        fid,
                        source: source.clone(),
                        size: record.size,
                    },
                )
                .await
            {
                Ok(()) => {
                    info!(
                        %fid,
                        source = %source,
                        target = %target,
                        size = record.size,
                        "Transfer ordered"
                    );
                    self.leases.insert(
                        lease_key,
                        Lease {
                            source: source.clone(),
                            issued: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    warn!(%fid, target = %target, error = %err, "Cannot deliver transfer order");
                }
            }
        }
    }

    /// A target finished applying a transfer.
    async fn handle_transfer_complete(&self, fid: Fid, target: &DriverName) -> Result<()> {
        let Some(mut record) = self.load_record(fid).await? else {
            debug!(%fid, %target, "Completion for unknown record (deleted meanwhile)");
            self.leases.remove(&(fid, target.clone()));
            return Ok(());
        };

        record.uptodate.insert(target.clone());

        let mut batch = self.store.batch();
        batch.put(&keys::file(&fid), &record)?;
        batch.put(&keys::uptodate(&fid, target), &true)?;
        batch.commit().await?;

        self.leases.remove(&(fid, target.clone()));

        if record.is_settled() {
            info!(%fid, filename = %record.filename, "File settled: every owner up to date");
        } else {
            debug!(
                %fid,
                target = %target,
                remaining = record.pending_targets().len(),
                "Transfer completed"
            );
        }
        Ok(())
    }

    /// A driver reported (or confirmed) a deletion.
    async fn handle_delete(&self, fid: Fid, reporter: &DriverName) -> Result<()> {
        let Some(mut record) = self.load_record(fid).await? else {
            debug!(%fid, %reporter, "Deletion for unknown record (already torn down)");
            return Ok(());
        };

        record.owners.remove(reporter);
        record.uptodate.remove(reporter);
        self.leases.remove(&(fid, reporter.clone()));

        let mut batch = self.store.batch();
        batch.delete(&keys::entry(&fid, reporter));
        batch.delete(&keys::uptodate(&fid, reporter));

        if record.owners.is_empty() {
            // Last owner confirmed: tear the record and its satellites down.
            batch.delete(&keys::file(&fid));
            for key in self.store.range_keys(&keys::file_satellites(&fid)).await? {
                batch.delete(&key);
            }
            batch.commit().await?;
            self.drop_leases_of(fid);
            info!(%fid, filename = %record.filename, "Record removed: all owners confirmed deletion");
            return Ok(());
        }

        batch.put(&keys::file(&fid), &record)?;
        batch.commit().await?;

        info!(
            %fid,
            filename = %record.filename,
            reporter = %reporter,
            remaining = record.owners.len(),
            "Deletion propagating"
        );

        for owner in &record.owners {
            if let Err(err) = self
                .send_order(
                    owner,
                    &Command::Delete {
                        fid,
                        driver: owner.clone(),
                    },
                )
                .await
            {
                warn!(%fid, owner = %owner, error = %err, "Cannot deliver deletion order");
            }
        }
        Ok(())
    }

    fn drop_leases_of(&self, fid: Fid) {
        self.leases.retain(|(lease_fid, _), _| *lease_fid != fid);
    }

    /// Dials a driver's router and delivers one order.
    async fn send_order(&self, driver: &DriverName, command: &Command) -> Result<()> {
        let port: u16 = self
            .store
            .get(&keys::router(driver))
            .await?
            .ok_or_else(|| Error::service(format!("driver '{driver}' has no router registered")))?;

        let mut dealer = Dealer::connect_local(port)
            .await
            .map_err(|e| Error::service(format!("cannot reach driver '{driver}': {e}")))?;
        dealer.send_command(command).await?;
        Ok(())
    }
}

struct RefereeHandler {
    referee: std::sync::Arc<Referee>,
}

#[async_trait::async_trait]
impl RequestHandler for RefereeHandler {
    async fn handle(&self, request: Request) -> Reply {
        let result = match request {
            Request::Command(Command::Update { fid, ref driver }) => {
                self.referee.handle_update(fid, driver).await
            }
            Request::Command(Command::TransferComplete { fid, ref driver }) => {
                self.referee.handle_transfer_complete(fid, driver).await
            }
            Request::Command(Command::Delete { fid, ref driver }) => {
                self.referee.handle_delete(fid, driver).await
            }
            Request::Command(Command::GetFile { .. }) => {
                return Reply::Error("409 GET_FILE is served by the broker".into());
            }
            Request::Command(Command::Transfer { .. }) => {
                return Reply::Error("409 transfer orders originate here".into());
            }
            Request::Chunk { .. } => {
                return Reply::Error("409 the referee serves no chunks".into());
            }
        };

        match result {
            Ok(()) => Reply::Ok,
            Err(err) if err.is_shutdown() => Reply::Error("500 store closed".into()),
            Err(err) => {
                warn!(error = %err, "Referee command failed");
                Reply::Error(format!("500 {err}"))
            }
        }
    }
}
