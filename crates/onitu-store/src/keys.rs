//! Canonical key builders for the store namespaces
//!
//! | Namespace | Contents |
//! |---|---|
//! | `file:{fid}` | shared [`FileRecord`](onitu_core::FileRecord) |
//! | `file:{fid}:entry:{driver}` | opaque per-driver extras |
//! | `file:{fid}:uptodate:{driver}` | presence marker for range scans |
//! | `{driver}:cursor` | opaque change-stream cursor |
//! | `{driver}:conflict:{local-name}` | backend-assigned name mapping |
//! | `drivers:{name}:router` | chunk-server port registration |
//! | `referee:port`, `broker:port` | arbiter endpoints |
//! | `services`, `rules` | setup snapshot |

use onitu_core::{DriverName, Fid};

/// Key of a shared file record.
#[must_use]
pub fn file(fid: &Fid) -> String {
    format!("file:{fid}")
}

/// Prefix under which all file records and their satellites live.
pub const FILE_PREFIX: &str = "file:";

/// Key of one driver's opaque extras for a file.
#[must_use]
pub fn entry(fid: &Fid, driver: &DriverName) -> String {
    format!("file:{fid}:entry:{driver}")
}

/// Prefix of every satellite key (extras + uptodate markers) of a fid.
#[must_use]
pub fn file_satellites(fid: &Fid) -> String {
    format!("file:{fid}:")
}

/// Presence marker: `driver` holds the latest version of `fid`.
#[must_use]
pub fn uptodate(fid: &Fid, driver: &DriverName) -> String {
    format!("file:{fid}:uptodate:{driver}")
}

/// Prefix for scanning the drivers holding a fid.
#[must_use]
pub fn uptodate_prefix(fid: &Fid) -> String {
    format!("file:{fid}:uptodate:")
}

/// Key of a driver's change-stream cursor.
#[must_use]
pub fn cursor(driver: &DriverName) -> String {
    format!("{driver}:cursor")
}

/// Key mapping an Onitu-side name to the backend-assigned one.
#[must_use]
pub fn conflict(driver: &DriverName, local_name: &str) -> String {
    format!("{driver}:conflict:{local_name}")
}

/// Prefix of a driver's whole conflict map.
#[must_use]
pub fn conflict_prefix(driver: &DriverName) -> String {
    format!("{driver}:conflict:")
}

/// Key where a driver publishes its chunk-server port.
#[must_use]
pub fn router(driver: &DriverName) -> String {
    format!("drivers:{driver}:router")
}

/// Key where the referee publishes its command port.
pub const REFEREE_PORT: &str = "referee:port";

/// Key where the broker publishes its request port.
pub const BROKER_PORT: &str = "broker:port";

/// Snapshot of the configured service names.
pub const SERVICES: &str = "services";

/// Snapshot of the routing rules.
pub const RULES: &str = "rules";

/// Length of a `file:{fid}` record key: 5 + 32 hex digits.
const RECORD_KEY_LEN: usize = 5 + 32;

/// True for a bare `file:{fid}` record key (not an extras or uptodate key).
#[must_use]
pub fn is_record_key(key: &str) -> bool {
    key.len() == RECORD_KEY_LEN && key.starts_with(FILE_PREFIX)
}

/// Extracts the fid from a `file:{fid}` record key.
#[must_use]
pub fn fid_of_record_key(key: &str) -> Option<Fid> {
    if !is_record_key(key) {
        return None;
    }
    key[FILE_PREFIX.len()..].parse().ok()
}
