//! Change intake - turning backend activity into metadata updates
//!
//! Two patterns, selected by backend capability:
//!
//! - **Event-driven**: the adapter feeds raw watcher events through an
//!   [`EventIntake`], which pairs `moved-from`/`moved-to` halves inside a
//!   bounded window and degrades unpaired halves to delete + update.
//! - **Poll-with-cursor**: the adapter implements [`IPollSource`]; the plug
//!   iterates `poll(cursor)` until `has_more` is false, persists the
//!   cursor, and applies each surviving entry. Backend timestamps are
//!   compared against the stored `modified` extra - strictly newer wins, so
//!   a replayed cursor emits no redundant updates.
//!
//! Both intakes end in the same downstream: compute the fid, load the
//! record, and report through [`Plug::update_file`] / [`Plug::delete_file`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use onitu_core::record::extra_keys;
use onitu_core::{Extras, Fid, Result};

use crate::plug::Plug;

// ---------------------------------------------------------------------------
// Event-driven intake
// ---------------------------------------------------------------------------

/// Kind of a raw event delivered by an event-driven adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A file appeared.
    Created,
    /// File content was written.
    Written,
    /// A file disappeared.
    Deleted,
    /// First half of a move; pairs with a following `MovedTo`.
    MovedFrom,
    /// Second half of a move.
    MovedTo,
}

/// One raw event from the backend's watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Backend path the event concerns.
    pub path: PathBuf,
    /// What happened.
    pub kind: ChangeKind,
}

/// A change after pairing, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedChange {
    /// The file at this path is new or has new content.
    Updated(PathBuf),
    /// The file at this path is gone.
    Deleted(PathBuf),
    /// The file moved; both halves arrived inside the pairing window.
    Moved {
        /// Path before the move.
        old: PathBuf,
        /// Path after the move.
        new: PathBuf,
    },
}

/// Pairs move halves and coalesces raw events into resolved changes.
///
/// Backends that emit a single move event can bypass this and emit
/// [`ResolvedChange::Moved`] directly; backends with paired halves push
/// everything through here. The pairing window is one scheduling quantum
/// of the intake loop (100 ms by default); an unpaired `moved-from` older
/// than the window degrades to a deletion, an unpaired `moved-to` to an
/// update.
pub struct EventIntake {
    window: Duration,
    pending_from: VecDeque<(PathBuf, Instant)>,
}

impl EventIntake {
    /// Default pairing window: one intake scheduling quantum.
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

    /// Creates an intake with the given pairing window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending_from: VecDeque::new(),
        }
    }

    /// Feeds one raw event; returns the changes that resolved, expired
    /// `moved-from` halves first.
    pub fn push(&mut self, event: RawEvent) -> Vec<ResolvedChange> {
        let mut resolved = self.flush_expired();

        match event.kind {
            ChangeKind::Created | ChangeKind::Written => {
                resolved.push(ResolvedChange::Updated(event.path));
            }
            ChangeKind::Deleted => {
                resolved.push(ResolvedChange::Deleted(event.path));
            }
            ChangeKind::MovedFrom => {
                self.pending_from.push_back((event.path, Instant::now()));
            }
            ChangeKind::MovedTo => match self.pending_from.pop_front() {
                Some((old, _)) => {
                    resolved.push(ResolvedChange::Moved {
                        old,
                        new: event.path,
                    });
                }
                None => {
                    debug!(path = %event.path.display(), "Unpaired moved-to, degrading to update");
                    resolved.push(ResolvedChange::Updated(event.path));
                }
            },
        }
        resolved
    }

    /// Degrades `moved-from` halves older than the pairing window to
    /// deletions. Call on every intake tick.
    pub fn flush_expired(&mut self) -> Vec<ResolvedChange> {
        let now = Instant::now();
        let mut resolved = Vec::new();
        while let Some((path, since)) = self.pending_from.front() {
            if now.duration_since(*since) < self.window {
                break;
            }
            debug!(path = %path.display(), "Unpaired moved-from, degrading to deletion");
            resolved.push(ResolvedChange::Deleted(path.clone()));
            self.pending_from.pop_front();
        }
        resolved
    }

    /// Number of move halves waiting for their pair.
    #[must_use]
    pub fn pending_moves(&self) -> usize {
        self.pending_from.len()
    }
}

// ---------------------------------------------------------------------------
// Poll-with-cursor intake
// ---------------------------------------------------------------------------

/// Remote state of one entry reported by a polling backend.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    /// Size in bytes.
    pub size: u64,
    /// Backend modification timestamp; strictly newer than the stored one
    /// wins.
    pub modified: DateTime<Utc>,
    /// Backend-specific extras to merge (revision tokens etc.).
    pub extra: Extras,
}

/// One entry from a poll batch. `info == None` means the entry was deleted.
#[derive(Debug, Clone)]
pub struct PollEntry {
    /// Folder the entry belongs to.
    pub folder: String,
    /// Backend-side path, relative to the folder; translated back through
    /// the conflict map before becoming an Onitu name.
    pub backend_path: String,
    /// Remote state, or `None` for a deletion.
    pub info: Option<RemoteInfo>,
}

/// One page of a backend's change stream.
#[derive(Debug, Clone)]
pub struct PollBatch {
    /// Surviving entries, in backend order.
    pub entries: Vec<PollEntry>,
    /// Cursor to resume from next time.
    pub cursor: String,
    /// True when the backend has more pages immediately available.
    pub has_more: bool,
}

/// Change-stream access provided by polling backends.
#[async_trait::async_trait]
pub trait IPollSource: Send + Sync + 'static {
    /// Returns the changes since `cursor` (`None` for the beginning of
    /// time). Idempotent: the same cursor with no remote change yields the
    /// same (empty) result and the same cursor.
    async fn poll(&self, cursor: Option<&str>) -> Result<PollBatch>;
}

impl Plug {
    /// Runs the poll intake loop until shutdown.
    ///
    /// Each cycle drains the change stream (`has_more` pages immediately),
    /// persists the cursor, then sleeps `timer`. Errors inside a cycle are
    /// logged and do not kill the loop; store closure ends it cleanly.
    pub async fn run_poll_intake(
        &self,
        source: Arc<dyn IPollSource>,
        timer: Duration,
    ) -> Result<()> {
        let cancel = self.cancel_token();
        let mut cursor = self.cursor().await?;

        loop {
            match self.poll_cycle(source.as_ref(), &mut cursor).await {
                Ok(()) => {}
                Err(err) if err.is_shutdown() => {
                    debug!("Poll intake stopped: store closed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "Poll cycle failed; will retry on next tick");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(timer) => {}
                () = cancel.cancelled() => {
                    debug!("Poll intake stopped: shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Drains the change stream once and persists the final cursor.
    async fn poll_cycle(
        &self,
        source: &dyn IPollSource,
        cursor: &mut Option<String>,
    ) -> Result<()> {
        let mut advanced = false;
        loop {
            let batch = source.poll(cursor.as_deref()).await?;
            for entry in batch.entries {
                if let Err(err) = self.apply_poll_entry(entry).await {
                    if err.is_shutdown() {
                        return Err(err);
                    }
                    warn!(error = %err, "Failed to apply poll entry");
                }
            }

            if cursor.as_deref() != Some(batch.cursor.as_str()) {
                advanced = true;
            }
            *cursor = Some(batch.cursor);
            if !batch.has_more {
                break;
            }
        }

        if advanced {
            if let Some(cursor) = cursor.as_deref() {
                self.set_cursor(cursor).await?;
            }
        }
        Ok(())
    }

    /// Shared downstream of both intake modes, for one polled entry.
    async fn apply_poll_entry(&self, entry: PollEntry) -> Result<()> {
        // The backend reports its own spelling; translate back to the
        // Onitu name when a conflict mapping exists.
        let name = match self
            .conflict_map()
            .onitu_name_in_folder(&entry.folder, &entry.backend_path)
            .await?
        {
            Some(onitu_name) => onitu_name,
            None => entry.backend_path.clone(),
        };

        let fid = Fid::compute(&entry.folder, &name);
        let _guard = self.lock_fid(fid).await;

        match entry.info {
            None => {
                if let Some(meta) = self.try_get_metadata(&entry.folder, &name).await? {
                    debug!(fid = %meta.fid, filename = %name, "Deletion detected by poll");
                    self.delete_file(&meta).await?;
                }
                Ok(())
            }
            Some(info) => {
                let mut meta = self.get_metadata(&entry.folder, &name).await?;

                let stored: Option<DateTime<Utc>> = meta
                    .extra
                    .get(extra_keys::MODIFIED)
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                let newer = stored.map_or(true, |stored| info.modified > stored);
                if !newer {
                    debug!(fid = %meta.fid, filename = %name, "Polled entry not newer, skipping");
                    return Ok(());
                }

                meta.size = info.size;
                for (key, value) in info.extra {
                    meta.extra.insert(key, value);
                }
                meta.extra.insert(
                    extra_keys::MODIFIED.to_string(),
                    serde_json::json!(info.modified.to_rfc3339()),
                );
                self.update_file(&mut meta).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> PathBuf {
        PathBuf::from(p)
    }

    #[test]
    fn test_create_and_write_resolve_to_update() {
        let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
        let out = intake.push(RawEvent {
            path: path("/root/a.txt"),
            kind: ChangeKind::Created,
        });
        assert_eq!(out, vec![ResolvedChange::Updated(path("/root/a.txt"))]);

        let out = intake.push(RawEvent {
            path: path("/root/a.txt"),
            kind: ChangeKind::Written,
        });
        assert_eq!(out, vec![ResolvedChange::Updated(path("/root/a.txt"))]);
    }

    #[test]
    fn test_delete_resolves_to_delete() {
        let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
        let out = intake.push(RawEvent {
            path: path("/root/a.txt"),
            kind: ChangeKind::Deleted,
        });
        assert_eq!(out, vec![ResolvedChange::Deleted(path("/root/a.txt"))]);
    }

    #[test]
    fn test_move_pairing_within_window() {
        let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
        let out = intake.push(RawEvent {
            path: path("/root/old.txt"),
            kind: ChangeKind::MovedFrom,
        });
        assert!(out.is_empty());
        assert_eq!(intake.pending_moves(), 1);

        let out = intake.push(RawEvent {
            path: path("/root/new.txt"),
            kind: ChangeKind::MovedTo,
        });
        assert_eq!(
            out,
            vec![ResolvedChange::Moved {
                old: path("/root/old.txt"),
                new: path("/root/new.txt"),
            }]
        );
        assert_eq!(intake.pending_moves(), 0);
    }

    #[test]
    fn test_unpaired_moved_from_degrades_to_delete() {
        let mut intake = EventIntake::new(Duration::from_millis(0));
        intake.push(RawEvent {
            path: path("/root/gone.txt"),
            kind: ChangeKind::MovedFrom,
        });
        std::thread::sleep(Duration::from_millis(5));
        let out = intake.flush_expired();
        assert_eq!(out, vec![ResolvedChange::Deleted(path("/root/gone.txt"))]);
    }

    #[test]
    fn test_unpaired_moved_to_degrades_to_update() {
        let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
        let out = intake.push(RawEvent {
            path: path("/root/appeared.txt"),
            kind: ChangeKind::MovedTo,
        });
        assert_eq!(
            out,
            vec![ResolvedChange::Updated(path("/root/appeared.txt"))]
        );
    }

    #[test]
    fn test_moves_pair_in_order() {
        let mut intake = EventIntake::new(EventIntake::DEFAULT_WINDOW);
        intake.push(RawEvent {
            path: path("/a"),
            kind: ChangeKind::MovedFrom,
        });
        intake.push(RawEvent {
            path: path("/b"),
            kind: ChangeKind::MovedFrom,
        });

        let first = intake.push(RawEvent {
            path: path("/a2"),
            kind: ChangeKind::MovedTo,
        });
        assert_eq!(
            first,
            vec![ResolvedChange::Moved {
                old: path("/a"),
                new: path("/a2"),
            }]
        );

        let second = intake.push(RawEvent {
            path: path("/b2"),
            kind: ChangeKind::MovedTo,
        });
        assert_eq!(
            second,
            vec![ResolvedChange::Moved {
                old: path("/b"),
                new: path("/b2"),
            }]
        );
    }
}
