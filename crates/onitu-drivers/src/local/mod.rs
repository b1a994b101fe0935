//! Local filesystem driver
//!
//! Mirrors configured folders under an absolute root directory. Incoming
//! chunks are written to a hidden `.{name}.onitu-tmp` sibling; the commit
//! renames it over the target so readers never observe a half-written
//! file. The file's mtime (as fractional seconds) is kept in the extras as
//! `revision` and gates change intake: only a strictly newer mtime is
//! reported, which also keeps the driver from re-reporting files it just
//! wrote itself.

mod watcher;

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use onitu_core::config::ServiceConfig;
use onitu_core::record::extra_keys;
use onitu_core::{Error, Result};
use onitu_plug::{EventIntake, IDriverBackend, Metadata, Plug, RawEvent, ResolvedChange};

/// Suffix of in-flight temporary files; never reported by intake.
const TMP_SUFFIX: &str = ".onitu-tmp";

/// Options enumerated for the local driver.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalOptions {
    /// Absolute root directory holding the configured folders.
    pub root: String,
}

/// The local filesystem backend.
pub struct LocalBackend {
    plug: Plug,
    root: PathBuf,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl LocalBackend {
    /// Validates options and prepares the folder directories.
    pub fn new(plug: Plug, options: &LocalOptions) -> Result<Self> {
        let root = normalize(Path::new(&options.root));
        if !root.is_absolute() {
            return Err(Error::driver(format!(
                "the root path '{}' is not absolute",
                options.root
            )));
        }

        let backend = Self { plug, root };
        for folder in backend.plug.folders().map(ToString::to_string).collect::<Vec<_>>() {
            let dir = backend.folder_dir(&folder)?;
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::driver(format!("cannot create '{}': {e}", dir.display())))?;
        }
        Ok(backend)
    }

    fn folder_dir(&self, folder: &str) -> Result<PathBuf> {
        let rel = self
            .plug
            .folder_path(folder)
            .ok_or_else(|| Error::driver(format!("folder '{folder}' not configured")))?;
        Ok(if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        })
    }

    /// Absolute path of a file.
    fn path_of(&self, meta: &Metadata) -> Result<PathBuf> {
        Ok(self.folder_dir(&meta.folder)?.join(&meta.filename))
    }

    /// Hidden sibling receiving in-flight chunks.
    fn tmp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}{TMP_SUFFIX}"))
    }

    fn is_tmp(path: &Path) -> bool {
        path.to_string_lossy().ends_with(TMP_SUFFIX)
    }

    /// Maps an absolute path back to `(folder, filename)`, preferring the
    /// most specific folder when paths nest.
    fn resolve(&self, path: &Path) -> Option<(String, String)> {
        let mut best: Option<(String, String, usize)> = None;
        for folder in self.plug.folders() {
            let Ok(dir) = self.folder_dir(folder) else {
                continue;
            };
            if let Ok(rel) = path.strip_prefix(&dir) {
                let depth = dir.components().count();
                let filename = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if filename.is_empty() {
                    continue;
                }
                if best.as_ref().map_or(true, |(_, _, d)| depth > *d) {
                    best = Some((folder.to_string(), filename, depth));
                }
            }
        }
        best.map(|(folder, filename, _)| (folder, filename))
    }

    // ------------------------------------------------------------------
    // Change application
    // ------------------------------------------------------------------

    /// Reports a file whose on-disk mtime is strictly newer than the
    /// stored revision.
    async fn apply_update(&self, path: &Path) -> Result<()> {
        if Self::is_tmp(path) || path.is_dir() {
            return Ok(());
        }
        let Some((folder, filename)) = self.resolve(path) else {
            return Ok(());
        };

        // Serialize against an in-flight transfer of the same fid; once it
        // finishes, the stored revision matches the on-disk mtime and the
        // event below is recognized as our own write.
        let _guard = self
            .plug
            .lock_fid(onitu_core::Fid::compute(&folder, &filename))
            .await;

        let mut meta = self.plug.get_metadata(&folder, &filename).await?;

        // The write is our own tmp-file activity settling down.
        if meta.upload_id().is_some() || Self::tmp_path(path).exists() {
            debug!(path = %path.display(), "Upload in progress, intake debounced");
            return Ok(());
        }

        let (size, mtime) = match stat(path) {
            Ok(stat) => stat,
            Err(_) => return Ok(()), // raced with a deletion
        };

        let stored = meta
            .extra
            .get(extra_keys::REVISION)
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        if mtime <= stored {
            return Ok(());
        }

        meta.size = size;
        meta.extra
            .insert(extra_keys::REVISION.to_string(), serde_json::json!(mtime));
        self.plug.update_file(&mut meta).await
    }

    async fn apply_delete(&self, path: &Path) -> Result<()> {
        if Self::is_tmp(path) {
            return Ok(());
        }
        let Some((folder, filename)) = self.resolve(path) else {
            return Ok(());
        };
        let _guard = self
            .plug
            .lock_fid(onitu_core::Fid::compute(&folder, &filename))
            .await;
        if let Some(meta) = self.plug.try_get_metadata(&folder, &filename).await? {
            self.plug.delete_file(&meta).await?;
        }
        Ok(())
    }

    async fn apply_move(&self, old: &Path, new: &Path) -> Result<()> {
        if Self::is_tmp(old) || Self::is_tmp(new) {
            return Ok(());
        }
        let old_resolved = self.resolve(old);
        let new_resolved = self.resolve(new);

        match (old_resolved, new_resolved) {
            (Some((folder, old_name)), Some((new_folder, new_name))) if folder == new_folder => {
                match self.plug.try_get_metadata(&folder, &old_name).await? {
                    Some(old_meta) => {
                        let mut new_meta = self.plug.move_file(&old_meta, &new_name).await?;
                        if let Ok((size, mtime)) = stat(new) {
                            new_meta.size = size;
                            new_meta
                                .extra
                                .insert(extra_keys::REVISION.to_string(), serde_json::json!(mtime));
                            self.plug.write_metadata(&new_meta).await?;
                        }
                        Ok(())
                    }
                    None => self.apply_update(new).await,
                }
            }
            // Crossing folders (or leaving the synced area) degrades to
            // delete + update.
            (old_resolved, _) => {
                if old_resolved.is_some() {
                    self.apply_delete(old).await?;
                }
                self.apply_update(new).await
            }
        }
    }

    async fn apply(&self, change: ResolvedChange) {
        let result = match &change {
            ResolvedChange::Updated(path) => self.apply_update(path).await,
            ResolvedChange::Deleted(path) => self.apply_delete(path).await,
            ResolvedChange::Moved { old, new } => self.apply_move(old, new).await,
        };
        if let Err(err) = result {
            if err.is_shutdown() {
                return;
            }
            warn!(?change, error = %err, "Failed to apply filesystem change");
        }
    }

    // ------------------------------------------------------------------
    // Startup reconciliation
    // ------------------------------------------------------------------

    /// Compares the disk against the expected file list: strictly newer
    /// mtimes are reported as updates, expected-but-missing files we held
    /// an up-to-date copy of are reported as deletions (a file we never
    /// transferred is not a deletion).
    pub async fn check_changes(&self) -> Result<()> {
        for folder in self.plug.folders().map(ToString::to_string).collect::<Vec<_>>() {
            let expected = self.plug.list(&folder).await?;
            let mut remaining: BTreeSet<String> = expected.keys().cloned().collect();

            let dir = self.folder_dir(&folder)?;
            for path in walk_files(&dir) {
                if Self::is_tmp(&path) {
                    continue;
                }
                if let Some((_, filename)) = self.resolve(&path) {
                    remaining.remove(&filename);
                }
                if let Err(err) = self.apply_update(&path).await {
                    if err.is_shutdown() {
                        return Err(err);
                    }
                    warn!(path = %path.display(), error = %err, "Reconciliation skipped a file");
                }
            }

            for filename in remaining {
                let Some(meta) = self.plug.try_get_metadata(&folder, &filename).await? else {
                    continue;
                };
                // Only report deletions of files we actually held; a copy
                // that never arrived must not delete it everywhere else.
                if meta.uptodate.contains(self.plug.name()) {
                    info!(folder = %folder, filename = %filename, "File missing on disk, reporting deletion");
                    self.plug.delete_file(&meta).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IDriverBackend for LocalBackend {
    fn normalize_path(&self, path: &str) -> Result<String> {
        let normalized = normalize(Path::new(path));
        if !normalized.is_absolute() {
            return Err(Error::driver(format!(
                "the folder path '{path}' is not absolute"
            )));
        }
        Ok(normalized.to_string_lossy().into_owned())
    }

    async fn get_chunk(&self, meta: &Metadata, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.path_of(meta)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::service(format!("error getting '{}': {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::service(format!("error seeking '{}': {e}", path.display())))?;

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| Error::service(format!("error reading '{}': {e}", path.display())))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn start_upload(&self, meta: &mut Metadata) -> Result<()> {
        let path = self.path_of(meta)?;
        let tmp = Self::tmp_path(&path);
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::service(format!("error creating '{}': {e}", parent.display())))?;
        }
        tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::service(format!("error creating '{}': {e}", tmp.display())))?;
        Ok(())
    }

    async fn upload_chunk(&self, meta: &mut Metadata, offset: u64, chunk: &[u8]) -> Result<()> {
        let path = self.path_of(meta)?;
        let tmp = Self::tmp_path(&path);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&tmp)
            .await
            .map_err(|e| Error::service(format!("error writing '{}': {e}", tmp.display())))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::service(format!("error seeking '{}': {e}", tmp.display())))?;
        file.write_all(chunk)
            .await
            .map_err(|e| Error::service(format!("error writing '{}': {e}", tmp.display())))?;
        file.flush()
            .await
            .map_err(|e| Error::service(format!("error flushing '{}': {e}", tmp.display())))?;
        Ok(())
    }

    async fn end_upload(&self, meta: &mut Metadata) -> Result<()> {
        let path = self.path_of(meta)?;
        let tmp = Self::tmp_path(&path);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::service(format!("error for '{}': {e}", path.display())))?;

        let (_, mtime) =
            stat(&path).map_err(|e| Error::service(format!("error for '{}': {e}", path.display())))?;
        meta.extra
            .insert(extra_keys::REVISION.to_string(), serde_json::json!(mtime));
        Ok(())
    }

    async fn abort_upload(&self, meta: &mut Metadata) -> Result<()> {
        let path = self.path_of(meta)?;
        remove_if_present(&Self::tmp_path(&path)).await
    }

    async fn move_file(&self, old: &Metadata, new: &mut Metadata) -> Result<()> {
        let old_path = self.path_of(old)?;
        let new_path = self.path_of(new)?;
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::service(format!("error creating '{}': {e}", parent.display())))?;
        }
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| Error::service(format!("error moving '{}': {e}", old_path.display())))?;
        Ok(())
    }

    async fn delete_file(&self, meta: &Metadata) -> Result<()> {
        let path = self.path_of(meta)?;
        remove_if_present(&path).await?;
        remove_if_present(&Self::tmp_path(&path)).await
    }
}

/// Runs the event intake loop until shutdown: raw watcher events in,
/// resolved changes applied.
async fn run_event_intake(
    backend: Arc<LocalBackend>,
    mut rx: mpsc::Receiver<RawEvent>,
    _watcher: notify::RecommendedWatcher,
) {
    let cancel = backend.plug.cancel_token();
    let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
    let mut tick = tokio::time::interval(EventIntake::DEFAULT_WINDOW);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("Watcher channel closed, intake stopping");
                    return;
                };
                for change in intake.push(event) {
                    backend.apply(change).await;
                }
            }
            _ = tick.tick() => {
                for change in intake.flush_expired() {
                    backend.apply(change).await;
                }
            }
            () = cancel.cancelled() => {
                debug!("Event intake stopping: shutdown requested");
                return;
            }
        }
    }
}

/// Starts the local driver: validate options, reconcile, watch, serve.
pub async fn start(plug: Plug, config: &ServiceConfig) -> Result<()> {
    let options: LocalOptions = config.options_as()?;
    let backend = Arc::new(LocalBackend::new(plug.clone(), &options)?);
    plug.register(backend.clone());

    info!(driver = %plug.name(), root = %backend.root.display(), "Local driver starting");

    backend.check_changes().await?;

    let folder_dirs: Vec<PathBuf> = plug
        .folders()
        .map(|folder| backend.folder_dir(folder))
        .collect::<Result<_>>()?;
    let dir_refs: Vec<&Path> = folder_dirs.iter().map(PathBuf::as_path).collect();
    let (watcher, rx) = watcher::spawn(&dir_refs)?;

    tokio::spawn(run_event_intake(backend.clone(), rx, watcher));

    plug.listen().await
}

// ---------------------------------------------------------------------------
// Small filesystem helpers
// ---------------------------------------------------------------------------

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem (the path may not exist yet).
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// `(size, mtime as fractional seconds)` of a file.
fn stat(path: &Path) -> std::io::Result<(u64, f64)> {
    let md = std::fs::metadata(path)?;
    let mtime = md
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    Ok((md.len(), mtime))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::service(format!(
            "error deleting '{}': {e}",
            path.display()
        ))),
    }
}

/// Every regular file under `dir`, depth-first.
fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_dots() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize(Path::new("relative/x")), PathBuf::from("relative/x"));
    }

    #[test]
    fn test_tmp_path_is_hidden_sibling() {
        let tmp = LocalBackend::tmp_path(Path::new("/root/docs/report.pdf"));
        assert_eq!(tmp, PathBuf::from("/root/docs/.report.pdf.onitu-tmp"));
        assert!(LocalBackend::is_tmp(&tmp));
        assert!(!LocalBackend::is_tmp(Path::new("/root/docs/report.pdf")));
    }

    #[test]
    fn test_walk_files_finds_nested() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("sub/deep/leaf.txt"), b"2").unwrap();

        let mut files = walk_files(dir.path());
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[1].ends_with("top.txt") || files[0].ends_with("top.txt"));
    }

    // ------------------------------------------------------------------
    // Handler contract
    // ------------------------------------------------------------------

    use onitu_core::RuleSet;
    use onitu_store::Store;

    async fn backend(root: &Path) -> LocalBackend {
        let store = Store::open_in_memory().await.unwrap();
        let folders = std::collections::BTreeMap::from([("sync".to_string(), String::new())]);
        let plug = Plug::new(
            store,
            onitu_core::DriverName::new("rep1").unwrap(),
            RuleSet::default(),
            folders,
        );
        LocalBackend::new(
            plug,
            &LocalOptions {
                root: root.to_string_lossy().into_owned(),
            },
        )
        .unwrap()
    }

    fn meta(filename: &str, size: u64) -> Metadata {
        let mut meta = Metadata::new("sync", filename);
        meta.size = size;
        meta
    }

    #[tokio::test]
    async fn test_get_chunk_is_exact_at_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        std::fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();
        let meta = meta("f.bin", 10);

        assert_eq!(backend.get_chunk(&meta, 0, 4).await.unwrap(), b"0123");
        assert_eq!(backend.get_chunk(&meta, 8, 100).await.unwrap(), b"89");
        assert!(backend.get_chunk(&meta, 10, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_protocol_commits_via_tmp_rename() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        let mut meta = meta("doc.txt", 5);

        backend.start_upload(&mut meta).await.unwrap();
        let tmp = dir.path().join(".doc.txt.onitu-tmp");
        assert!(tmp.exists(), "chunks land in a hidden tmp sibling");

        backend.upload_chunk(&mut meta, 0, b"hell").await.unwrap();
        // replay at an acknowledged offset is idempotent
        backend.upload_chunk(&mut meta, 0, b"hell").await.unwrap();
        backend.upload_chunk(&mut meta, 4, b"o").await.unwrap();
        backend.end_upload(&mut meta).await.unwrap();

        assert!(!tmp.exists());
        assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), b"hello");
        assert!(
            meta.extra.contains_key(extra_keys::REVISION),
            "commit records the on-disk mtime"
        );
    }

    #[tokio::test]
    async fn test_abort_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        let mut meta = meta("doc.txt", 4);

        backend.start_upload(&mut meta).await.unwrap();
        backend.abort_upload(&mut meta).await.unwrap();
        backend.abort_upload(&mut meta).await.unwrap();
        assert!(!dir.path().join(".doc.txt.onitu-tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_file_twice_is_equivalent_to_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        std::fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        let meta = meta("gone.txt", 1);

        backend.delete_file(&meta).await.unwrap();
        backend.delete_file(&meta).await.unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn test_move_file_handler_renames() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        std::fs::write(dir.path().join("old.txt"), b"content").unwrap();

        let old = meta("old.txt", 7);
        let mut new = meta("sub/new.txt", 7);
        backend.move_file(&old, &mut new).await.unwrap();

        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(
            std::fs::read(dir.path().join("sub/new.txt")).unwrap(),
            b"content"
        );
    }

    #[tokio::test]
    async fn test_normalize_path_rejects_relative() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;

        assert_eq!(
            backend.normalize_path("/a/b/../c").unwrap(),
            "/a/c".to_string()
        );
        assert!(matches!(
            backend.normalize_path("relative/path"),
            Err(onitu_core::Error::Driver(_))
        ));
    }

    #[tokio::test]
    async fn test_non_absolute_root_is_a_driver_error() {
        let store = Store::open_in_memory().await.unwrap();
        let plug = Plug::new(
            store,
            onitu_core::DriverName::new("rep1").unwrap(),
            RuleSet::default(),
            std::collections::BTreeMap::new(),
        );
        let err = LocalBackend::new(
            plug,
            &LocalOptions {
                root: "not/absolute".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, onitu_core::Error::Driver(_)));
    }
}
