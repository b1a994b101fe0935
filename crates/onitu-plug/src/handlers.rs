//! Handler contract between the plug and a backend adapter
//!
//! Every driver supplies an implementation of [`IDriverBackend`]; the plug
//! invokes it from its worker pool. Handlers are expected to block (await)
//! on backend I/O - the plug bounds concurrency and serializes per fid.
//!
//! Error semantics follow the two-kind split: [`Error::Driver`] for contract
//! violations attributable to the operator, [`Error::Service`] for transient
//! backend faults. A `Service` failure fails the current invocation only;
//! retry policy lives with the referee.

use onitu_core::Result;

use crate::metadata::Metadata;

/// Backend-provided handlers, registered on the [`Plug`](crate::Plug) at
/// startup.
#[async_trait::async_trait]
pub trait IDriverBackend: Send + Sync + 'static {
    /// Canonicalizes a configured path.
    ///
    /// # Errors
    /// [`Error::Driver`](onitu_core::Error::Driver) when the path is not
    /// absolute.
    fn normalize_path(&self, path: &str) -> Result<String>;

    /// Reads up to `size` bytes of the file at `offset`.
    ///
    /// Returns fewer bytes only when the file ends before `offset + size`.
    /// Must be reentrant: the chunk server calls it concurrently for
    /// different fids.
    async fn get_chunk(&self, meta: &Metadata, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Prepares the target container for an incoming upload.
    ///
    /// Idempotent: invoked again when a transfer is re-ordered. May set
    /// `meta.extra["upload_id"]` for resumable backends.
    async fn start_upload(&self, meta: &mut Metadata) -> Result<()>;

    /// Writes one chunk at `offset`.
    ///
    /// The offset supplied is authoritative. Must tolerate replay at a
    /// previously acknowledged offset (the plug replays the last chunk when
    /// resuming after a crash).
    async fn upload_chunk(&self, meta: &mut Metadata, offset: u64, chunk: &[u8]) -> Result<()>;

    /// Commits the upload.
    ///
    /// Posts the commit with the stored parent revision where the backend
    /// supports revisions; a revision mismatch means a newer remote version
    /// exists and must surface as a `Service` error without retry. Detects
    /// naming conflicts (case folding, auto-rename) and records them in the
    /// conflict map. On success updates `meta.extra` with the backend
    /// revision.
    async fn end_upload(&self, meta: &mut Metadata) -> Result<()>;

    /// Abandons an in-progress upload, clearing `upload_id`. Idempotent;
    /// partial backend state is left to the backend's own GC.
    async fn abort_upload(&self, meta: &mut Metadata) -> Result<()>;

    /// Renames a file where the backend supports it. Backends without a
    /// native move fall back to copy-and-delete at the referee level.
    async fn move_file(&self, old: &Metadata, new: &mut Metadata) -> Result<()>;

    /// Removes the file from the backend. Idempotent: deleting an absent
    /// file succeeds.
    async fn delete_file(&self, meta: &Metadata) -> Result<()>;
}
