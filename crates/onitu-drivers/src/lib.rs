//! Onitu Drivers - backend adapters
//!
//! Each adapter implements the plug's handler contract plus a `start()`
//! that validates its options, spawns its change-intake worker, and blocks
//! in `plug.listen()`:
//!
//! - [`local`]: a local filesystem replica with OS-notification intake and
//!   a hidden tmp-file protocol for in-flight chunks.
//! - [`playground`]: an in-process object store with a case-insensitive,
//!   case-preserving namespace, resumable upload sessions, and
//!   poll-with-cursor intake - the smallest backend exercising the full
//!   cloud-style contract.

pub mod local;
pub mod playground;
