//! File records and per-driver extras
//!
//! A [`FileRecord`] is the shared truth about one synchronized file, stored
//! under `file:{fid}`. The `owners` set lists the drivers that should hold
//! the file per routing rules; `uptodate ⊆ owners` lists those currently
//! holding the latest version. Whenever `uptodate == owners` (and owners is
//! non-empty) no transfer is outstanding for the fid.
//!
//! Each driver additionally keeps an opaque [`Extras`] map under
//! `file:{fid}:entry:{driver}` - backend revision tokens, resumable upload
//! handles, local mtimes. Extras are never read by other drivers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::newtypes::DriverName;

/// Opaque per-driver state attached to a file record.
///
/// Self-describing values so a driver can stash whatever its backend needs;
/// nothing outside the owning driver ever interprets the contents.
pub type Extras = BTreeMap<String, serde_json::Value>;

/// Conventional keys drivers store in their [`Extras`] maps.
///
/// Purely advisory - the map stays opaque - but the plug runtime itself
/// reads `UPLOAD_ID` and `OFFSET` to resume interrupted transfers.
pub mod extra_keys {
    /// Backend revision token returned on commit (cloud backends).
    pub const REV: &str = "rev";
    /// Backend modification timestamp, RFC 3339.
    pub const MODIFIED: &str = "modified";
    /// Resumable upload handle while a chunked upload is in progress.
    pub const UPLOAD_ID: &str = "upload_id";
    /// Highest acknowledged upload offset, for resumption.
    pub const OFFSET: &str = "offset";
    /// Local mtime as seconds, for filesystem backends.
    pub const REVISION: &str = "revision";
}

/// Shared metadata for one synchronized file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Filename relative to its folder.
    pub filename: String,
    /// Folder name the file belongs to.
    pub folder: String,
    /// Size in bytes.
    pub size: u64,
    /// Guessed from the filename extension at creation.
    pub mimetype: String,
    /// Drivers that should hold this file per routing rules.
    pub owners: BTreeSet<DriverName>,
    /// Drivers currently holding the latest version.
    pub uptodate: BTreeSet<DriverName>,
}

impl FileRecord {
    /// Creates a fresh record with no up-to-date drivers yet.
    #[must_use]
    pub fn new(folder: impl Into<String>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let mimetype = guess_mimetype(&filename).to_string();
        Self {
            filename,
            folder: folder.into(),
            size: 0,
            mimetype,
            owners: BTreeSet::new(),
            uptodate: BTreeSet::new(),
        }
    }

    /// True when every owner holds the latest version.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.owners.is_empty() && self.uptodate == self.owners
    }

    /// Owners still missing the latest version.
    #[must_use]
    pub fn pending_targets(&self) -> BTreeSet<DriverName> {
        self.owners.difference(&self.uptodate).cloned().collect()
    }

    /// The `uptodate ⊆ owners` invariant; violated records indicate a bug
    /// or manual store tampering.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        self.uptodate.is_subset(&self.owners)
    }
}

/// Best-effort mimetype from the filename extension.
#[must_use]
pub fn guess_mimetype(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(name: &str) -> DriverName {
        DriverName::new(name).unwrap()
    }

    #[test]
    fn test_new_record_guesses_mimetype() {
        let record = FileRecord::new("music", "song.mp3");
        assert_eq!(record.mimetype, "audio/mpeg");
        assert_eq!(record.size, 0);
        assert!(record.owners.is_empty());
    }

    #[test]
    fn test_unknown_extension_is_octet_stream() {
        assert_eq!(guess_mimetype("blob.xyz123"), "application/octet-stream");
        assert_eq!(guess_mimetype("no_extension"), "application/octet-stream");
    }

    #[test]
    fn test_settled() {
        let mut record = FileRecord::new("docs", "a.txt");
        assert!(!record.is_settled(), "no owners means not settled");

        record.owners.insert(driver("rep1"));
        record.owners.insert(driver("rep2"));
        record.uptodate.insert(driver("rep1"));
        assert!(!record.is_settled());
        assert_eq!(record.pending_targets(), BTreeSet::from([driver("rep2")]));

        record.uptodate.insert(driver("rep2"));
        assert!(record.is_settled());
        assert!(record.pending_targets().is_empty());
    }

    #[test]
    fn test_invariant() {
        let mut record = FileRecord::new("docs", "a.txt");
        record.owners.insert(driver("rep1"));
        record.uptodate.insert(driver("rep1"));
        assert!(record.invariant_holds());

        record.uptodate.insert(driver("ghost"));
        assert!(!record.invariant_holds());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut record = FileRecord::new("docs", "a.txt");
        record.owners.insert(driver("rep1"));
        record.size = 42;

        let json = serde_json::to_string(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
