//! The plug context - services and the serving loop
//!
//! An explicit context value handed to the adapter at startup; the adapter
//! registers its handler implementation on it and then calls
//! [`Plug::listen`] to serve chunk requests and referee orders until
//! shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onitu_core::{canonicalize, DriverName, Error, Extras, Fid, FileRecord, Result, RuleSet};
use onitu_fabric::{Command, Dealer, Reply, Request, RequestHandler, Router};
use onitu_store::{keys, Store};

use crate::conflicts::ConflictMap;
use crate::handlers::IDriverBackend;
use crate::metadata::Metadata;
use crate::transfer;

/// Default chunk size for pulls: 1 MiB.
const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

struct Inner {
    name: DriverName,
    store: Store,
    rules: RuleSet,
    folders: BTreeMap<String, String>,
    chunk_size: u64,
    backend: OnceLock<Arc<dyn IDriverBackend>>,
    /// Per-fid serialization: no two handlers for one fid run concurrently
    /// within this driver.
    locks: DashMap<Fid, Arc<Mutex<()>>>,
    /// Outstanding transfer leases: fid -> source currently pulling.
    inflight: DashMap<Fid, DriverName>,
    cancel: CancellationToken,
    worker_limit: usize,
}

/// The per-driver runtime context. Cheap to clone.
#[derive(Clone)]
pub struct Plug {
    inner: Arc<Inner>,
}

impl Plug {
    /// Builds a plug over an opened store.
    ///
    /// `folders` maps folder names to backend-relative paths, as configured
    /// for this service in the setup file.
    #[must_use]
    pub fn new(
        store: Store,
        name: DriverName,
        rules: RuleSet,
        folders: BTreeMap<String, String>,
    ) -> Self {
        let worker_limit = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .max(4);

        Self {
            inner: Arc::new(Inner {
                name,
                store,
                rules,
                folders,
                chunk_size: DEFAULT_CHUNK_SIZE,
                backend: OnceLock::new(),
                locks: DashMap::new(),
                inflight: DashMap::new(),
                cancel: CancellationToken::new(),
                worker_limit,
            }),
        }
    }

    /// Registers the backend handlers. Must happen exactly once, before
    /// [`listen`](Plug::listen).
    pub fn register(&self, backend: Arc<dyn IDriverBackend>) {
        if self.inner.backend.set(backend).is_err() {
            warn!("Backend handlers registered twice; keeping the first registration");
        }
    }

    pub(crate) fn backend(&self) -> Result<Arc<dyn IDriverBackend>> {
        self.inner
            .backend
            .get()
            .cloned()
            .ok_or_else(|| Error::driver("no backend handlers registered on the plug"))
    }

    /// This driver's name.
    #[must_use]
    pub fn name(&self) -> &DriverName {
        &self.inner.name
    }

    /// The shared metadata store handle.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Chunk size used when pulling from a source driver.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    /// Worker-pool bound: `max(4, cpu)`.
    #[must_use]
    pub fn worker_limit(&self) -> usize {
        self.inner.worker_limit
    }

    /// Cancellation token observed by every loop the plug owns.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Backend-relative path of a configured folder.
    #[must_use]
    pub fn folder_path(&self, folder: &str) -> Option<&str> {
        self.inner.folders.get(folder).map(String::as_str)
    }

    /// Names of the folders configured for this driver.
    #[must_use]
    pub fn folders(&self) -> impl Iterator<Item = &str> {
        self.inner.folders.keys().map(String::as_str)
    }

    /// This driver's conflict map.
    #[must_use]
    pub fn conflict_map(&self) -> ConflictMap {
        ConflictMap::new(self.inner.store.clone(), self.inner.name.clone())
    }

    /// Requests shutdown: watchers exit on next wakeup, workers finish the
    /// in-flight handler and drain.
    pub fn shutdown(&self) {
        info!(driver = %self.inner.name, "Plug shutdown requested");
        self.inner.cancel.cancel();
    }

    /// Acquires the serialization lock for a fid.
    ///
    /// Handlers for one fid never run concurrently within a driver;
    /// adapters take this lock around their own intake application so a
    /// change report cannot interleave with an in-flight transfer of the
    /// same file.
    pub async fn lock_fid(&self, fid: Fid) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .locks
            .entry(fid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Claims the transfer lease for `(fid, source)`.
    ///
    /// Returns `false` when a lease for this fid is already outstanding -
    /// re-issued orders for an in-flight transfer are a no-op.
    pub(crate) fn claim_lease(&self, fid: Fid, source: &DriverName) -> bool {
        match self.inner.inflight.entry(fid) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                debug!(
                    %fid,
                    current = %entry.get(),
                    requested = %source,
                    "Transfer lease already outstanding, ignoring order"
                );
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(source.clone());
                true
            }
        }
    }

    pub(crate) fn release_lease(&self, fid: &Fid) {
        self.inner.inflight.remove(fid);
    }

    // ------------------------------------------------------------------
    // Metadata services
    // ------------------------------------------------------------------

    /// Loads the metadata for a file, creating a fresh (unpersisted) value
    /// with owners derived from the routing rules when no record exists.
    pub async fn get_metadata(&self, folder: &str, filename: &str) -> Result<Metadata> {
        match self.try_get_metadata(folder, filename).await? {
            Some(meta) => Ok(meta),
            None => {
                let (folder, filename) = canonicalize(folder, filename);
                let mut meta = Metadata::new(&folder, &filename);
                meta.owners = self.inner.rules.owners_for(&folder, &filename);
                Ok(meta)
            }
        }
    }

    /// Loads the metadata for a file, `None` when no record exists.
    ///
    /// Refuses to reuse a fid whose stored name differs from the incoming
    /// one (hash collision); this is logged and surfaced as a service
    /// error.
    pub async fn try_get_metadata(&self, folder: &str, filename: &str) -> Result<Option<Metadata>> {
        let fid = Fid::compute(folder, filename);
        let Some(meta) = self.get_metadata_by_fid(fid).await? else {
            return Ok(None);
        };

        let incoming = canonicalize(folder, filename);
        let stored = canonicalize(&meta.folder, &meta.filename);
        if stored != incoming {
            error!(
                %fid,
                stored_filename = %meta.filename,
                incoming_filename = %incoming.1,
                "Fid collision: refusing to reuse fid for a different name"
            );
            return Err(Error::service(format!(
                "fid collision on {fid}: stored '{}' vs incoming '{}'",
                meta.filename, incoming.1
            )));
        }
        Ok(Some(meta))
    }

    /// Loads the metadata for a fid, joining this driver's extras.
    pub async fn get_metadata_by_fid(&self, fid: Fid) -> Result<Option<Metadata>> {
        let Some(record) = self
            .inner
            .store
            .get::<FileRecord>(&keys::file(&fid))
            .await?
        else {
            return Ok(None);
        };
        let extra: Extras = self
            .inner
            .store
            .get(&keys::entry(&fid, &self.inner.name))
            .await?
            .unwrap_or_default();
        Ok(Some(Metadata::from_record(fid, record, extra)))
    }

    /// Persists record and extras in one batch.
    pub async fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        let mut batch = self.inner.store.batch();
        batch.put(&keys::file(&meta.fid), &meta.record())?;
        batch.put(&keys::entry(&meta.fid, &self.inner.name), &meta.extra)?;
        batch.commit().await?;
        Ok(())
    }

    /// Persists only this driver's extras (resumable-upload bookkeeping).
    pub async fn write_extras(&self, meta: &Metadata) -> Result<()> {
        self.inner
            .store
            .put(&keys::entry(&meta.fid, &self.inner.name), &meta.extra)
            .await?;
        Ok(())
    }

    /// Files of a folder this driver should hold, as `filename -> fid`.
    pub async fn list(&self, folder: &str) -> Result<BTreeMap<String, Fid>> {
        let mut files = BTreeMap::new();
        for (key, value) in self.inner.store.range(keys::FILE_PREFIX).await? {
            let Some(fid) = keys::fid_of_record_key(&key) else {
                continue;
            };
            let record: FileRecord = serde_json::from_value(value)
                .map_err(|e| Error::service(format!("corrupt record {key}: {e}")))?;
            if record.folder == folder && record.owners.contains(&self.inner.name) {
                files.insert(record.filename, fid);
            }
        }
        Ok(files)
    }

    // ------------------------------------------------------------------
    // Reporting services (adapter -> referee)
    // ------------------------------------------------------------------

    /// Reports a new or updated file.
    ///
    /// Resets `uptodate` to this driver (it now holds the newest version),
    /// persists record and extras atomically, and notifies the referee.
    /// Files matching no routing rule are not synchronized and are skipped.
    pub async fn update_file(&self, meta: &mut Metadata) -> Result<()> {
        if meta.owners.is_empty() {
            meta.owners = self.inner.rules.owners_for(&meta.folder, &meta.filename);
        }
        if meta.owners.is_empty() {
            debug!(
                filename = %meta.filename,
                folder = %meta.folder,
                "No routing rule matches; file not synchronized"
            );
            return Ok(());
        }

        meta.uptodate = BTreeSet::from([self.inner.name.clone()]);

        let mut batch = self.inner.store.batch();
        batch.put(&keys::file(&meta.fid), &meta.record())?;
        batch.put(&keys::entry(&meta.fid, &self.inner.name), &meta.extra)?;
        for key in self
            .inner
            .store
            .range_keys(&keys::uptodate_prefix(&meta.fid))
            .await?
        {
            batch.delete(&key);
        }
        batch.put(&keys::uptodate(&meta.fid, &self.inner.name), &true)?;
        batch.commit().await?;

        info!(
            fid = %meta.fid,
            filename = %meta.filename,
            size = meta.size,
            "File update reported"
        );

        self.notify_referee(Command::Update {
            fid: meta.fid,
            driver: self.inner.name.clone(),
        })
        .await
    }

    /// Reports a deletion observed on this backend. The referee propagates
    /// it to the remaining owners and tears the record down once everyone
    /// confirmed.
    pub async fn delete_file(&self, meta: &Metadata) -> Result<()> {
        info!(fid = %meta.fid, filename = %meta.filename, "File deletion reported");
        self.notify_referee(Command::Delete {
            fid: meta.fid,
            driver: self.inner.name.clone(),
        })
        .await
    }

    /// Reports a rename observed on this backend.
    ///
    /// A fid is a pure function of `(folder, filename)`, so a rename
    /// synthesizes a new record (owners re-derived from the rules, this
    /// driver up to date) and deletes the old one. Returns the new
    /// metadata so the adapter can attach its extras and persist them.
    pub async fn move_file(&self, old: &Metadata, new_filename: &str) -> Result<Metadata> {
        let mut new_meta = self.get_metadata(&old.folder, new_filename).await?;
        new_meta.size = old.size;

        info!(
            old_fid = %old.fid,
            new_fid = %new_meta.fid,
            old_filename = %old.filename,
            new_filename,
            "File move reported"
        );

        self.update_file(&mut new_meta).await?;
        self.delete_file(old).await?;
        Ok(new_meta)
    }

    /// Abandons an interrupted upload, reclaiming its resumable state.
    ///
    /// Not called on ordinary transfer failure (the state is kept for
    /// resume); this is the explicit reclamation path, driven by an
    /// operator or a referee timeout.
    pub async fn abort_upload(&self, meta: &mut Metadata) -> Result<()> {
        let _guard = self.lock_fid(meta.fid).await;
        self.backend()?.abort_upload(meta).await?;
        meta.clear_upload_state();
        self.write_extras(meta).await?;
        info!(fid = %meta.fid, filename = %meta.filename, "Upload aborted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor persistence (poll-with-cursor intake)
    // ------------------------------------------------------------------

    /// The persisted change-stream cursor, if any.
    pub async fn cursor(&self) -> Result<Option<String>> {
        Ok(self.inner.store.get(&keys::cursor(&self.inner.name)).await?)
    }

    /// Persists the change-stream cursor.
    pub async fn set_cursor(&self, cursor: &str) -> Result<()> {
        self.inner
            .store
            .put(&keys::cursor(&self.inner.name), &cursor)
            .await?;
        debug!(cursor, "Cursor persisted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fabric plumbing
    // ------------------------------------------------------------------

    /// Sends one command to the referee and waits for the acknowledgement.
    pub(crate) async fn notify_referee(&self, command: Command) -> Result<()> {
        let port: u16 = self
            .inner
            .store
            .get(keys::REFEREE_PORT)
            .await?
            .ok_or_else(|| Error::service("referee endpoint not registered"))?;

        let mut dealer = Dealer::connect_local(port)
            .await
            .map_err(|e| Error::service(format!("cannot reach referee: {e}")))?;
        dealer.send_command(&command).await?;
        Ok(())
    }

    /// Resolves another driver's router port from the store.
    pub(crate) async fn router_port_of(&self, driver: &DriverName) -> Result<u16> {
        self.inner
            .store
            .get(&keys::router(driver))
            .await?
            .ok_or_else(|| Error::service(format!("driver '{driver}' has no router registered")))
    }

    /// Binds the chunk server, publishes its port, and serves until
    /// shutdown. This is the adapter's final, blocking call.
    pub async fn listen(&self) -> Result<()> {
        self.backend()?; // fail fast when nothing is registered

        let router = Router::bind()
            .await
            .map_err(|e| Error::service(format!("cannot bind router: {e}")))?;
        self.inner
            .store
            .put(&keys::router(&self.inner.name), &router.port())
            .await?;

        info!(
            driver = %self.inner.name,
            port = router.port(),
            workers = self.inner.worker_limit,
            "Plug listening"
        );

        let handler = Arc::new(PlugHandler { plug: self.clone() });
        router
            .serve(handler, self.inner.cancel.clone(), self.inner.worker_limit)
            .await;

        info!(driver = %self.inner.name, "Plug stopped");
        Ok(())
    }
}

/// Serves chunk requests and referee orders arriving at this driver's
/// router endpoint.
struct PlugHandler {
    plug: Plug,
}

#[async_trait::async_trait]
impl RequestHandler for PlugHandler {
    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Chunk { name, offset, size } => {
                match self.serve_chunk(&name, offset, size).await {
                    Ok(bytes) => Reply::Bytes(bytes),
                    Err(err) if err.is_shutdown() => Reply::Error("store closed".into()),
                    Err(err) => {
                        warn!(name, offset, size, error = %err, "Chunk request failed");
                        Reply::Error(err.to_string())
                    }
                }
            }
            Request::Command(Command::Transfer { fid, source, size }) => {
                transfer::spawn(self.plug.clone(), fid, source, size);
                Reply::Ok
            }
            Request::Command(Command::Delete { fid, .. }) => {
                transfer::spawn_delete(self.plug.clone(), fid);
                Reply::Ok
            }
            Request::Command(other) => {
                Reply::Error(format!("unsupported command {:#04x} at a driver", other.tag()))
            }
        }
    }
}

impl PlugHandler {
    /// Answers `(fid, offset, size)` with exactly
    /// `min(size, file_size - offset)` bytes via the backend's `get_chunk`.
    async fn serve_chunk(&self, name: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let fid: Fid = name
            .parse()
            .map_err(|_| Error::service(format!("chunk request names unknown fid '{name}'")))?;

        let _guard = self.plug.lock_fid(fid).await;

        let meta = self
            .plug
            .get_metadata_by_fid(fid)
            .await?
            .ok_or_else(|| Error::service(format!("no record for fid {fid}")))?;

        let backend = self.plug.backend()?;
        let remaining = meta.size.saturating_sub(offset);
        let wanted = size.min(remaining);
        if wanted == 0 {
            return Ok(Vec::new());
        }
        backend.get_chunk(&meta, offset, wanted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onitu_core::rules::{RoutingRule, SyncMode};

    fn driver(name: &str) -> DriverName {
        DriverName::new(name).unwrap()
    }

    async fn plug_with_rules(rules: RuleSet) -> Plug {
        let store = Store::open_in_memory().await.unwrap();
        let folders = BTreeMap::from([("docs".to_string(), String::new())]);
        Plug::new(store, driver("rep1"), rules, folders)
    }

    fn mirror_rules() -> RuleSet {
        RuleSet::new(vec![RoutingRule::new(
            "**",
            vec![driver("rep1"), driver("rep2")],
            SyncMode::Mirror,
        )
        .unwrap()])
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_per_fid() {
        let plug = plug_with_rules(RuleSet::default()).await;
        let fid = Fid::compute("docs", "a.txt");

        assert!(plug.claim_lease(fid, &driver("src")));
        // re-issued order for the same pair: no-op
        assert!(!plug.claim_lease(fid, &driver("src")));
        // a different source does not break the lease either
        assert!(!plug.claim_lease(fid, &driver("other")));

        plug.release_lease(&fid);
        assert!(plug.claim_lease(fid, &driver("other")));
    }

    #[tokio::test]
    async fn test_get_metadata_derives_owners_from_rules() {
        let plug = plug_with_rules(mirror_rules()).await;
        let meta = plug.get_metadata("docs", "report.pdf").await.unwrap();
        assert_eq!(meta.owners.len(), 2);
        assert!(meta.uptodate.is_empty());
    }

    #[tokio::test]
    async fn test_update_without_matching_rule_is_skipped() {
        // No rules at all: nothing owns the file, so nothing is reported
        // (and no referee needs to be running).
        let plug = plug_with_rules(RuleSet::default()).await;
        let mut meta = plug.get_metadata("docs", "a.txt").await.unwrap();
        meta.size = 10;
        plug.update_file(&mut meta).await.unwrap();
        assert!(!plug
            .store()
            .exists(&keys::file(&meta.fid))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fid_collision_is_refused() {
        let plug = plug_with_rules(mirror_rules()).await;

        // Forge a record stored under the fid of a *different* name.
        let fid = Fid::compute("docs", "b.txt");
        let record = FileRecord::new("docs", "a.txt");
        plug.store().put(&keys::file(&fid), &record).await.unwrap();

        let err = plug.try_get_metadata("docs", "b.txt").await.unwrap_err();
        assert!(err.to_string().contains("collision"));
    }

    #[tokio::test]
    async fn test_write_metadata_round_trip() {
        let plug = plug_with_rules(mirror_rules()).await;
        let mut meta = plug.get_metadata("docs", "a.txt").await.unwrap();
        meta.size = 42;
        meta.extra
            .insert("rev".to_string(), serde_json::json!("r7"));
        plug.write_metadata(&meta).await.unwrap();

        let loaded = plug
            .get_metadata_by_fid(meta.fid)
            .await
            .unwrap()
            .expect("record persisted");
        assert_eq!(loaded.size, 42);
        assert_eq!(loaded.extra.get("rev"), Some(&serde_json::json!("r7")));
    }

    #[tokio::test]
    async fn test_list_filters_by_folder_and_ownership() {
        let plug = plug_with_rules(mirror_rules()).await;

        let mut mine = plug.get_metadata("docs", "mine.txt").await.unwrap();
        plug.write_metadata(&mine).await.unwrap();
        mine.owners = BTreeSet::from([driver("rep1")]);
        plug.write_metadata(&mine).await.unwrap();

        let mut foreign = FileRecord::new("docs", "foreign.txt");
        foreign.owners = BTreeSet::from([driver("rep9")]);
        plug.store()
            .put(&keys::file(&Fid::compute("docs", "foreign.txt")), &foreign)
            .await
            .unwrap();

        let files = plug.list("docs").await.unwrap();
        assert!(files.contains_key("mine.txt"));
        assert!(!files.contains_key("foreign.txt"));
    }
}
