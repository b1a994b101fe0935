//! The playground object store
//!
//! An in-process stand-in for a cloud storage service, with the contract
//! surface the plug runtime has to cope with in the wild:
//!
//! - a **case-insensitive, case-preserving** namespace: lookups fold case,
//!   the stored spelling wins, and committing a brand-new name that
//!   collides case-insensitively gets auto-renamed (`name (1).ext`)
//! - **resumable upload sessions**: chunks accumulate under a server-issued
//!   `upload_id`; replays at acknowledged offsets are accepted, gaps are
//!   rejected
//! - **revision checks on commit**: overwriting requires the current
//!   revision as `parent_rev`, otherwise the commit is refused
//! - a **change log with cursors** for poll-based intake
//!
//! Several driver processes of one deployment may share a store instance;
//! everything is guarded by one mutex (the store is small by design).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use onitu_core::{Error, Result};

/// One stored object, spelling preserved.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Path as the backend spells it.
    pub path: String,
    /// Content bytes.
    pub data: Vec<u8>,
    /// Current revision token.
    pub rev: String,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The path the backend actually committed under - may differ from the
    /// requested one on a naming conflict.
    pub path: String,
    /// Fresh revision token.
    pub rev: String,
    /// Commit timestamp.
    pub modified: DateTime<Utc>,
    /// Committed size in bytes.
    pub size: u64,
}

#[derive(Default)]
struct Inner {
    /// Case-folded path -> object.
    objects: BTreeMap<String, StoredObject>,
    /// Open upload sessions: id -> accumulated bytes.
    sessions: HashMap<String, Vec<u8>>,
    /// Mutation log: (case-folded path, spelling at mutation time).
    log: Vec<(String, String)>,
    rev_counter: u64,
}

/// The in-process object store.
pub struct PlaygroundStore {
    access_key: String,
    access_secret: String,
    inner: Mutex<Inner>,
}

impl PlaygroundStore {
    /// Creates a store accepting the given credentials.
    #[must_use]
    pub fn new(access_key: impl Into<String>, access_secret: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            access_secret: access_secret.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks the caller's credentials.
    pub fn authenticate(&self, access_key: &str, access_secret: &str) -> Result<()> {
        if access_key != self.access_key || access_secret != self.access_secret {
            return Err(Error::driver("invalid access credentials"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upload sessions
    // ------------------------------------------------------------------

    /// Appends one chunk to an upload session, creating the session when
    /// `upload_id` is `None`. Returns `(upload_id, acknowledged_length)`.
    ///
    /// A replay entirely inside the acknowledged range is accepted without
    /// effect; an offset beyond the acknowledged length is refused.
    pub fn chunk_upload(
        &self,
        upload_id: Option<&str>,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(String, u64)> {
        let mut inner = self.lock();

        let id = match upload_id {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                inner.sessions.insert(id.clone(), Vec::new());
                id
            }
        };

        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::service(format!("unknown upload session '{id}'")))?;

        let acknowledged = session.len() as u64;
        if offset == acknowledged {
            session.extend_from_slice(chunk);
        } else if offset + chunk.len() as u64 <= acknowledged {
            // replay of an already-acknowledged chunk
        } else {
            return Err(Error::service(format!(
                "upload offset {offset} does not match acknowledged length {acknowledged}"
            )));
        }

        let len = session.len() as u64;
        Ok((id, len))
    }

    /// Discards an upload session; unknown ids succeed (idempotent abort).
    pub fn abandon(&self, upload_id: &str) {
        self.lock().sessions.remove(upload_id);
    }

    /// Commits an upload session under `path`.
    ///
    /// Overwrites require `parent_rev` to match the current revision.
    /// Committing a new file whose case-folded name collides with an
    /// existing object is auto-renamed; the caller sees the assigned path
    /// in the outcome and is expected to record the conflict.
    pub fn commit(
        &self,
        path: &str,
        upload_id: &str,
        parent_rev: Option<&str>,
    ) -> Result<CommitOutcome> {
        let mut inner = self.lock();

        let data = inner
            .sessions
            .remove(upload_id)
            .ok_or_else(|| Error::service(format!("unknown upload session '{upload_id}'")))?;

        let folded = path.to_lowercase();
        let existing_rev = inner.objects.get(&folded).map(|o| o.rev.clone());

        let committed_path = match (&existing_rev, parent_rev) {
            (Some(current), Some(parent)) if current == parent => {
                // in-place overwrite keeps the backend's spelling
                inner.objects[&folded].path.clone()
            }
            (Some(current), Some(parent)) => {
                inner.sessions.insert(upload_id.to_string(), data);
                return Err(Error::service(format!(
                    "revision mismatch for '{path}': parent rev '{parent}' is not current ('{current}')"
                )));
            }
            (Some(_), None) => {
                // brand-new name colliding case-insensitively: auto-rename
                Self::autorename(&inner.objects, path)
            }
            (None, Some(parent)) => {
                inner.sessions.insert(upload_id.to_string(), data);
                return Err(Error::service(format!(
                    "revision mismatch for '{path}': parent rev '{parent}' but the file is gone"
                )));
            }
            (None, None) => path.to_string(),
        };

        inner.rev_counter += 1;
        let rev = format!("r{}", inner.rev_counter);
        let modified = Utc::now();
        let size = data.len() as u64;

        let folded_committed = committed_path.to_lowercase();
        inner.objects.insert(
            folded_committed.clone(),
            StoredObject {
                path: committed_path.clone(),
                data,
                rev: rev.clone(),
                modified,
            },
        );
        inner.log.push((folded_committed, committed_path.clone()));

        Ok(CommitOutcome {
            path: committed_path,
            rev,
            modified,
            size,
        })
    }

    /// Picks `stem (n).ext` with the smallest free `n`.
    fn autorename(objects: &BTreeMap<String, StoredObject>, path: &str) -> String {
        let (stem, ext) = match path.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !stem.ends_with('/') => {
                (stem.to_string(), format!(".{ext}"))
            }
            _ => (path.to_string(), String::new()),
        };
        for n in 1u32.. {
            let candidate = format!("{stem} ({n}){ext}");
            if !objects.contains_key(&candidate.to_lowercase()) {
                return candidate;
            }
        }
        unreachable!("u32 range exhausted");
    }

    // ------------------------------------------------------------------
    // Reads and mutations
    // ------------------------------------------------------------------

    /// Reads up to `size` bytes at `offset`; lookups fold case.
    pub fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let inner = self.lock();
        let object = inner
            .objects
            .get(&path.to_lowercase())
            .ok_or_else(|| Error::service(format!("cannot get chunk of '{path}': not found")))?;

        let start = (offset as usize).min(object.data.len());
        let end = (offset + size).min(object.data.len() as u64) as usize;
        Ok(object.data[start..end].to_vec())
    }

    /// Current metadata of an object, if present.
    #[must_use]
    pub fn metadata(&self, path: &str) -> Option<StoredObject> {
        self.lock().objects.get(&path.to_lowercase()).cloned()
    }

    /// Deletes an object; absent paths succeed.
    pub fn delete(&self, path: &str) {
        let mut inner = self.lock();
        let folded = path.to_lowercase();
        if let Some(object) = inner.objects.remove(&folded) {
            inner.log.push((folded, object.path));
        }
    }

    /// Renames an object; the new spelling is taken verbatim.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut inner = self.lock();
        let old_folded = old.to_lowercase();
        let new_folded = new.to_lowercase();

        if inner.objects.contains_key(&new_folded) && old_folded != new_folded {
            return Err(Error::service(format!(
                "cannot move '{old}': a file named '{new}' already exists"
            )));
        }

        let mut object = inner
            .objects
            .remove(&old_folded)
            .ok_or_else(|| Error::service(format!("cannot move '{old}': not found")))?;
        let old_path = std::mem::replace(&mut object.path, new.to_string());

        inner.rev_counter += 1;
        object.rev = format!("r{}", inner.rev_counter);
        object.modified = Utc::now();

        inner.objects.insert(new_folded.clone(), object);
        inner.log.push((old_folded, old_path));
        inner.log.push((new_folded, new.to_string()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change stream
    // ------------------------------------------------------------------

    /// Changes since `cursor`, deduplicated per path (latest state wins).
    ///
    /// Returns `(reported_path, current_state)` pairs - `None` state means
    /// the object is gone - plus the next cursor. Idempotent: the same
    /// cursor with no intervening mutation yields no entries and the same
    /// cursor back.
    pub fn poll(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<(String, Option<StoredObject>)>, String, bool)> {
        let inner = self.lock();
        let start = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::service(format!("malformed cursor '{raw}'")))?,
            None => 0,
        };
        let start = start.min(inner.log.len());

        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        // walk backwards so only the latest mutation per path survives
        for (folded, spelling) in inner.log[start..].iter().rev() {
            if !seen.insert(folded.clone()) {
                continue;
            }
            match inner.objects.get(folded) {
                Some(object) => entries.push((object.path.clone(), Some(object.clone()))),
                None => entries.push((spelling.clone(), None)),
            }
        }
        entries.reverse();

        Ok((entries, inner.log.len().to_string(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(store: &PlaygroundStore, data: &[u8]) -> String {
        let (id, len) = store.chunk_upload(None, 0, data).unwrap();
        assert_eq!(len, data.len() as u64);
        id
    }

    #[test]
    fn test_upload_and_commit_round_trip() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"hello world");
        let outcome = store.commit("docs/a.txt", &id, None).unwrap();
        assert_eq!(outcome.path, "docs/a.txt");
        assert_eq!(outcome.size, 11);

        assert_eq!(store.read("docs/a.txt", 0, 5).unwrap(), b"hello");
        assert_eq!(store.read("DOCS/A.TXT", 6, 100).unwrap(), b"world");
    }

    #[test]
    fn test_chunk_replay_is_idempotent() {
        let store = PlaygroundStore::new("k", "s");
        let (id, _) = store.chunk_upload(None, 0, b"aaaa").unwrap();
        let (_, len) = store.chunk_upload(Some(&id), 4, b"bbbb").unwrap();
        assert_eq!(len, 8);

        // replay of the second chunk
        let (_, len) = store.chunk_upload(Some(&id), 4, b"bbbb").unwrap();
        assert_eq!(len, 8);

        let outcome = store.commit("f.bin", &id, None).unwrap();
        assert_eq!(outcome.size, 8);
        assert_eq!(store.read("f.bin", 0, 8).unwrap(), b"aaaabbbb");
    }

    #[test]
    fn test_offset_gap_rejected() {
        let store = PlaygroundStore::new("k", "s");
        let (id, _) = store.chunk_upload(None, 0, b"aaaa").unwrap();
        assert!(store.chunk_upload(Some(&id), 8, b"cccc").is_err());
    }

    #[test]
    fn test_overwrite_requires_current_rev() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"v1");
        let first = store.commit("a.txt", &id, None).unwrap();

        let id = upload(&store, b"v2");
        let second = store.commit("a.txt", &id, Some(&first.rev)).unwrap();
        assert_eq!(second.path, "a.txt");

        // stale parent rev is refused
        let id = upload(&store, b"v3");
        let err = store.commit("a.txt", &id, Some(&first.rev)).unwrap_err();
        assert!(err.to_string().contains("revision mismatch"));
        assert_eq!(store.read("a.txt", 0, 10).unwrap(), b"v2");
    }

    #[test]
    fn test_case_collision_autorenames() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"first");
        store.commit("docs/Foo.txt", &id, None).unwrap();

        let id = upload(&store, b"second");
        let outcome = store.commit("docs/foo.txt", &id, None).unwrap();
        assert_eq!(outcome.path, "docs/foo (1).txt");

        // both contents preserved
        assert_eq!(store.read("docs/Foo.txt", 0, 10).unwrap(), b"first");
        assert_eq!(store.read("docs/foo (1).txt", 0, 10).unwrap(), b"second");
    }

    #[test]
    fn test_overwrite_keeps_backend_spelling() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"v1");
        let first = store.commit("Docs/Report.PDF", &id, None).unwrap();

        let id = upload(&store, b"v2");
        let second = store.commit("docs/report.pdf", &id, Some(&first.rev)).unwrap();
        assert_eq!(second.path, "Docs/Report.PDF");
    }

    #[test]
    fn test_delete_is_idempotent_and_logged() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"x");
        store.commit("a.txt", &id, None).unwrap();

        let (_, cursor, _) = store.poll(None).unwrap();
        store.delete("A.TXT");
        store.delete("A.TXT");

        let (entries, _, _) = store.poll(Some(&cursor)).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.is_none(), "deletion reported as absent state");
    }

    #[test]
    fn test_poll_cursor_idempotence() {
        let store = PlaygroundStore::new("k", "s");
        let id = upload(&store, b"x");
        store.commit("a.txt", &id, None).unwrap();

        let (entries, cursor, has_more) = store.poll(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!has_more);

        let (entries, cursor2, _) = store.poll(Some(&cursor)).unwrap();
        assert!(entries.is_empty());
        assert_eq!(cursor, cursor2);
    }

    #[test]
    fn test_poll_dedups_to_latest_state() {
        let store = PlaygroundStore::new("k", "s");
        for content in [b"v1".as_slice(), b"v2", b"v3"] {
            let id = upload(&store, content);
            let rev = store.metadata("a.txt").map(|o| o.rev);
            store.commit("a.txt", &id, rev.as_deref()).unwrap();
        }

        let (entries, _, _) = store.poll(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.as_ref().unwrap().data, b"v3");
    }

    #[test]
    fn test_authenticate() {
        let store = PlaygroundStore::new("key", "secret");
        assert!(store.authenticate("key", "secret").is_ok());
        assert!(store.authenticate("key", "wrong").is_err());
    }
}
