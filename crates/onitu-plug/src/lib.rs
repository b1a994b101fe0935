//! Onitu Plug - the per-driver runtime
//!
//! The plug mediates between a backend adapter and the rest of the system.
//! Adapters provide **handlers** (the [`IDriverBackend`] trait) and consume
//! **services** on the [`Plug`] context: metadata access, update/delete/move
//! reporting, cursor persistence, and the conflict map.
//!
//! One plug per driver process. It owns:
//! - the chunk server (a fabric router answering `(fid, offset, size)`)
//! - the chunked upload state machine with resumable bookkeeping
//! - change intake, event-driven or poll-with-cursor
//! - per-fid serialization: no two handlers for the same fid run
//!   concurrently within one driver
//!
//! The plug never auto-retries a failed handler; it reports completion or
//! failure to the referee, which re-issues orders on its own cadence.

pub mod conflicts;
pub mod handlers;
pub mod intake;
pub mod metadata;
mod plug;
pub mod transfer;

pub use conflicts::ConflictMap;
pub use handlers::IDriverBackend;
pub use intake::{ChangeKind, EventIntake, IPollSource, PollBatch, PollEntry, RawEvent, RemoteInfo, ResolvedChange};
pub use metadata::Metadata;
pub use plug::Plug;
