//! OS-notification watcher for the local driver
//!
//! Wraps the `notify` crate and converts raw OS events into the plug's
//! [`RawEvent`] representation. The watcher callback runs on notify's own
//! thread; events cross into the async world through an mpsc channel.
//! Paired renames (`RenameMode::Both`) are split into `moved-from` +
//! `moved-to` halves, which the plug's intake re-pairs immediately; single
//! halves flow through as-is and the intake window handles the rest.

use std::path::Path;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use onitu_core::{Error, Result};
use onitu_plug::{ChangeKind, RawEvent};

/// Starts a recursive watch over the given directories.
///
/// Returns the watcher (keep it alive: dropping it stops the watch) and
/// the event receiver.
pub fn spawn(roots: &[&Path]) -> Result<(RecommendedWatcher, mpsc::Receiver<RawEvent>)> {
    let (tx, rx) = mpsc::channel::<RawEvent>(1024);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<notify::Event, notify::Error>| match result {
            Ok(event) => {
                for raw in map_event(&event) {
                    if let Err(err) = tx.blocking_send(raw) {
                        warn!(error = %err, "Watcher event dropped (receiver gone)");
                        return;
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Filesystem watcher error");
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| Error::service(format!("cannot create filesystem watcher: {e}")))?;

    for root in roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::driver(format!("cannot watch '{}': {e}", root.display())))?;
        debug!(root = %root.display(), "Watching recursively");
    }

    Ok((watcher, rx))
}

/// Maps one notify event to zero or more raw intake events.
fn map_event(event: &notify::Event) -> Vec<RawEvent> {
    let first = || event.paths.first().cloned();

    match &event.kind {
        EventKind::Create(_) => first()
            .map(|path| {
                vec![RawEvent {
                    path,
                    kind: ChangeKind::Created,
                }]
            })
            .unwrap_or_default(),

        EventKind::Remove(_) => first()
            .map(|path| {
                vec![RawEvent {
                    path,
                    kind: ChangeKind::Deleted,
                }]
            })
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            vec![
                RawEvent {
                    path: event.paths[0].clone(),
                    kind: ChangeKind::MovedFrom,
                },
                RawEvent {
                    path: event.paths[1].clone(),
                    kind: ChangeKind::MovedTo,
                },
            ]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => first()
            .map(|path| {
                vec![RawEvent {
                    path,
                    kind: ChangeKind::MovedFrom,
                }]
            })
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => first()
            .map(|path| {
                vec![RawEvent {
                    path,
                    kind: ChangeKind::MovedTo,
                }]
            })
            .unwrap_or_default(),

        EventKind::Modify(_) => first()
            .map(|path| {
                vec![RawEvent {
                    path,
                    kind: ChangeKind::Written,
                }]
            })
            .unwrap_or_default(),

        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_maps_to_created() {
        let event = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/r/a.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(&event);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_rename_both_splits_into_halves() {
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/r/old.txt"), PathBuf::from("/r/new.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(&event);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].kind, ChangeKind::MovedFrom);
        assert_eq!(mapped[1].kind, ChangeKind::MovedTo);
    }

    #[test]
    fn test_access_ignored() {
        let event = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/r/a.txt")],
            attrs: Default::default(),
        };
        assert!(map_event(&event).is_empty());
    }

    #[test]
    fn test_no_paths_ignored() {
        let event = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![],
            attrs: Default::default(),
        };
        assert!(map_event(&event).is_empty());
    }
}
