//! Onitu Fabric - the message-passing substrate
//!
//! Connects plugs, the referee, and the broker with two access patterns:
//!
//! - **Router**: each driver binds a TCP listener (its "router" endpoint)
//!   and answers chunk requests `(name, offset, size)` and command frames.
//!   Each accepted connection is one peer identity; requests from one peer
//!   are answered in order.
//! - **Dealer**: a connect-and-request client used to pull chunks from a
//!   router and to deliver commands.
//!
//! Messages are length-prefixed multipart frames. Delivery is ordered and
//! reliable within one connection; nothing is guaranteed across
//! connections, and reconnection is transparent to callers (a dealer can
//! simply be re-dialed). At-most-once semantics are the plug's
//! responsibility, via `upload_id` bookkeeping.

pub mod command;
pub mod dealer;
pub mod frames;
pub mod router;

pub use command::{Command, Reply, Request};
pub use dealer::Dealer;
pub use router::{RequestHandler, Router};

use thiserror::Error;

/// Errors surfaced by fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Socket-level failure.
    #[error("fabric I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frames or an unknown command tag.
    #[error("fabric protocol error: {0}")]
    Protocol(String),

    /// The peer refused the request because its queue is full.
    #[error("peer busy")]
    Busy,

    /// The peer answered with an explicit error reply.
    #[error("remote error: {0}")]
    Remote(String),

    /// No reply arrived within the request deadline.
    #[error("request timed out")]
    Timeout,
}

impl From<FabricError> for onitu_core::Error {
    fn from(err: FabricError) -> Self {
        onitu_core::Error::service(err.to_string())
    }
}
