//! Metadata - a file record joined with this driver's extras
//!
//! The working representation handlers receive: the shared
//! [`FileRecord`] fields plus the opaque per-driver [`Extras`] map. Loaded
//! through the plug's metadata services and persisted back with a single
//! write batch so record and extras never diverge.

use onitu_core::record::extra_keys;
use onitu_core::{Extras, Fid, FileRecord};
use std::collections::BTreeSet;

use onitu_core::DriverName;

/// One file as seen by one driver.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Immutable identity, derived from `(folder, filename)`.
    pub fid: Fid,
    /// Filename relative to its folder.
    pub filename: String,
    /// Folder the file belongs to.
    pub folder: String,
    /// Size in bytes.
    pub size: u64,
    /// Guessed at record creation.
    pub mimetype: String,
    /// Drivers that should hold this file.
    pub owners: BTreeSet<DriverName>,
    /// Drivers holding the latest version.
    pub uptodate: BTreeSet<DriverName>,
    /// This driver's opaque state. Never shared with other drivers.
    pub extra: Extras,
}

impl Metadata {
    /// Joins a stored record with this driver's extras.
    #[must_use]
    pub fn from_record(fid: Fid, record: FileRecord, extra: Extras) -> Self {
        Self {
            fid,
            filename: record.filename,
            folder: record.folder,
            size: record.size,
            mimetype: record.mimetype,
            owners: record.owners,
            uptodate: record.uptodate,
            extra,
        }
    }

    /// Builds a fresh metadata value for a file no driver has reported yet.
    #[must_use]
    pub fn new(folder: &str, filename: &str) -> Self {
        let fid = Fid::compute(folder, filename);
        let record = FileRecord::new(folder, filename);
        Self::from_record(fid, record, Extras::new())
    }

    /// The shared record part, for persistence.
    #[must_use]
    pub fn record(&self) -> FileRecord {
        FileRecord {
            filename: self.filename.clone(),
            folder: self.folder.clone(),
            size: self.size,
            mimetype: self.mimetype.clone(),
            owners: self.owners.clone(),
            uptodate: self.uptodate.clone(),
        }
    }

    /// The resumable upload handle, when an upload is in progress.
    #[must_use]
    pub fn upload_id(&self) -> Option<&str> {
        self.extra.get(extra_keys::UPLOAD_ID).and_then(|v| v.as_str())
    }

    /// Highest acknowledged upload offset, for resumption.
    #[must_use]
    pub fn acknowledged_offset(&self) -> u64 {
        self.extra
            .get(extra_keys::OFFSET)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Records the acknowledged offset.
    pub fn set_acknowledged_offset(&mut self, offset: u64) {
        self.extra
            .insert(extra_keys::OFFSET.to_string(), serde_json::json!(offset));
    }

    /// Drops the resumable upload bookkeeping after a commit or abort.
    pub fn clear_upload_state(&mut self) {
        self.extra.remove(extra_keys::UPLOAD_ID);
        self.extra.remove(extra_keys::OFFSET);
    }
}
