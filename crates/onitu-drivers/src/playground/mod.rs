//! Playground driver - cloud-style adapter over the in-process store
//!
//! Exercises the full cloud contract against [`PlaygroundStore`]: resumable
//! upload sessions tracked through `upload_id`, parent-revision checks on
//! commit, conflict-map bookkeeping for the store's case-insensitive
//! namespace, and poll-with-cursor change intake.

mod store;

pub use store::{CommitOutcome, PlaygroundStore, StoredObject};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use onitu_core::config::ServiceConfig;
use onitu_core::record::extra_keys;
use onitu_core::{Error, Result};
use onitu_plug::{
    IDriverBackend, IPollSource, Metadata, Plug, PollBatch, PollEntry, RemoteInfo,
};

/// Options enumerated for the playground driver.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaygroundOptions {
    /// Path prefix within the store under which this driver operates.
    #[serde(default)]
    pub root: String,
    /// Seconds between change polls; must be non-negative.
    pub changes_timer: i64,
    /// Access credentials checked against the store.
    pub access_key: String,
    /// Access credentials checked against the store.
    pub access_secret: String,
}

/// The playground backend adapter.
pub struct PlaygroundBackend {
    plug: Plug,
    store: Arc<PlaygroundStore>,
    root: String,
}

impl std::fmt::Debug for PlaygroundBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaygroundBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl PlaygroundBackend {
    /// Validates options and authenticates against the store.
    pub fn new(
        plug: Plug,
        store: Arc<PlaygroundStore>,
        options: &PlaygroundOptions,
    ) -> Result<Self> {
        if options.changes_timer < 0 {
            return Err(Error::driver(
                "the change timer option must be a positive integer",
            ));
        }
        store.authenticate(&options.access_key, &options.access_secret)?;

        Ok(Self {
            plug,
            store,
            root: options.root.trim_matches('/').to_string(),
        })
    }

    /// Joins non-empty segments with `/`.
    fn join(segments: &[&str]) -> String {
        segments
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Full store path of a folder-relative backend filename.
    fn full_path(&self, folder: &str, backend_filename: &str) -> Result<String> {
        let folder_path = self
            .plug
            .folder_path(folder)
            .ok_or_else(|| Error::driver(format!("folder '{folder}' not configured")))?;
        Ok(Self::join(&[&self.root, folder_path, backend_filename]))
    }

    /// The store path for a metadata value, conflict map applied.
    async fn store_path(&self, meta: &Metadata) -> Result<String> {
        let backend_filename = self
            .plug
            .conflict_map()
            .resolve_in_folder(&meta.folder, &meta.filename)
            .await?;
        self.full_path(&meta.folder, &backend_filename)
    }

    /// Splits a store path back into `(folder, backend_filename)`; `None`
    /// for paths outside the configured folders.
    fn resolve(&self, path: &str) -> Option<(String, String)> {
        let rel = if self.root.is_empty() {
            path
        } else {
            let stripped = path.strip_prefix(&self.root)?;
            match stripped.strip_prefix('/') {
                Some(rest) => rest,
                None if stripped.is_empty() => stripped,
                None => return None, // "root" must not match "rootfile"
            }
        };

        let mut best: Option<(String, String, usize)> = None;
        for folder in self.plug.folders() {
            let Some(folder_path) = self.plug.folder_path(folder) else {
                continue;
            };
            let candidate = if folder_path.is_empty() {
                Some(rel)
            } else {
                // segment boundary required: "sub" must not match "subfile.txt"
                rel.strip_prefix(folder_path)
                    .and_then(|r| r.strip_prefix('/'))
            };
            if let Some(filename) = candidate {
                if filename.is_empty() {
                    continue;
                }
                let specificity = folder_path.len();
                if best.as_ref().map_or(true, |(_, _, s)| specificity > *s) {
                    best = Some((folder.to_string(), filename.to_string(), specificity));
                }
            }
        }
        best.map(|(folder, filename, _)| (folder, filename))
    }
}

#[async_trait::async_trait]
impl IDriverBackend for PlaygroundBackend {
    fn normalize_path(&self, path: &str) -> Result<String> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::driver(format!(
                "the path '{path}' must not traverse upwards"
            )));
        }
        Ok(path.trim_matches('/').to_string())
    }

    async fn get_chunk(&self, meta: &Metadata, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.store_path(meta).await?;
        self.store.read(&path, offset, size)
    }

    async fn start_upload(&self, _meta: &mut Metadata) -> Result<()> {
        // Sessions are created lazily by the first chunk; nothing to
        // prepare, and repeating this on a re-ordered transfer is safe.
        Ok(())
    }

    async fn upload_chunk(&self, meta: &mut Metadata, offset: u64, chunk: &[u8]) -> Result<()> {
        let (upload_id, acknowledged) =
            self.store.chunk_upload(meta.upload_id(), offset, chunk)?;
        if meta.upload_id() != Some(upload_id.as_str()) {
            debug!(
                fid = %meta.fid,
                upload_id = %upload_id,
                "Storing upload session id in extras"
            );
            meta.extra.insert(
                extra_keys::UPLOAD_ID.to_string(),
                serde_json::json!(upload_id),
            );
        }
        debug!(fid = %meta.fid, offset, acknowledged, "Chunk uploaded to session");
        Ok(())
    }

    async fn end_upload(&self, meta: &mut Metadata) -> Result<()> {
        let path = self.store_path(meta).await?;

        let upload_id = match meta.upload_id() {
            Some(id) => id.to_string(),
            // Empty file: open a session with a single zero-length chunk.
            None if meta.size == 0 => self.store.chunk_upload(None, 0, &[])?.0,
            None => {
                return Err(Error::driver(format!(
                    "no upload session for '{}'",
                    meta.filename
                )));
            }
        };

        let parent_rev = meta
            .extra
            .get(extra_keys::REV)
            .and_then(|v| v.as_str())
            .map(ToString::to_string);

        // A newer remote revision surfaces here as a revision mismatch and
        // is not retried; the referee converges after its next intake.
        let outcome = self.store.commit(&path, &upload_id, parent_rev.as_deref())?;

        meta.extra
            .insert(extra_keys::REV.to_string(), serde_json::json!(outcome.rev));
        meta.extra.insert(
            extra_keys::MODIFIED.to_string(),
            serde_json::json!(outcome.modified.to_rfc3339()),
        );

        if outcome.path != path {
            // The store committed under its own name: record the mapping.
            if let Some((folder, backend_filename)) = self.resolve(&outcome.path) {
                self.plug
                    .conflict_map()
                    .record_in_folder(&folder, &meta.filename, &backend_filename)
                    .await?;
            }
        }
        Ok(())
    }

    async fn abort_upload(&self, meta: &mut Metadata) -> Result<()> {
        if let Some(upload_id) = meta.upload_id() {
            self.store.abandon(upload_id);
        }
        Ok(())
    }

    async fn move_file(&self, old: &Metadata, new: &mut Metadata) -> Result<()> {
        let old_path = self.store_path(old).await?;
        let new_path = self.store_path(new).await?;
        self.store.rename(&old_path, &new_path)?;
        self.plug
            .conflict_map()
            .remove_in_folder(&old.folder, &old.filename)
            .await?;
        Ok(())
    }

    async fn delete_file(&self, meta: &Metadata) -> Result<()> {
        let path = self.store_path(meta).await?;
        self.store.delete(&path);
        self.plug
            .conflict_map()
            .remove_in_folder(&meta.folder, &meta.filename)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IPollSource for PlaygroundBackend {
    async fn poll(&self, cursor: Option<&str>) -> Result<PollBatch> {
        let (raw_entries, next_cursor, has_more) = self.store.poll(cursor)?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (path, state) in raw_entries {
            let Some((folder, backend_filename)) = self.resolve(&path) else {
                continue; // outside our folders
            };
            entries.push(PollEntry {
                folder,
                backend_path: backend_filename,
                info: state.map(|object| RemoteInfo {
                    size: object.data.len() as u64,
                    modified: object.modified,
                    extra: [(
                        extra_keys::REV.to_string(),
                        serde_json::json!(object.rev),
                    )]
                    .into_iter()
                    .collect(),
                }),
            });
        }

        Ok(PollBatch {
            entries,
            cursor: next_cursor,
            has_more,
        })
    }
}

/// Starts a playground driver with its own private store (credentials
/// self-validated). Deployments that want several drivers against one
/// store use [`start_with_store`].
pub async fn start(plug: Plug, config: &ServiceConfig) -> Result<()> {
    let options: PlaygroundOptions = config.options_as()?;
    let store = Arc::new(PlaygroundStore::new(
        options.access_key.clone(),
        options.access_secret.clone(),
    ));
    start_with_store(plug, store, options).await
}

/// Starts a playground driver against a shared store instance.
pub async fn start_with_store(
    plug: Plug,
    store: Arc<PlaygroundStore>,
    options: PlaygroundOptions,
) -> Result<()> {
    let backend = Arc::new(PlaygroundBackend::new(plug.clone(), store, &options)?);
    plug.register(backend.clone());

    info!(
        driver = %plug.name(),
        root = %options.root,
        changes_timer = options.changes_timer,
        "Playground driver starting"
    );

    let timer = Duration::from_secs(options.changes_timer as u64);
    let intake_plug = plug.clone();
    let source = backend;
    tokio::spawn(async move {
        let _ = intake_plug.run_poll_intake(source, timer).await;
    });

    plug.listen().await
}
