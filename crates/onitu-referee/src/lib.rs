//! Onitu Referee - the central transfer arbiter
//!
//! Consumes metadata-change reports from the driver plugs, applies the
//! routing rules, and publishes transfer orders so that every owner of a
//! file eventually holds its latest version. Stateless beyond the metadata
//! store: it is safe to restart, reconstructing outstanding work by
//! scanning records whose `uptodate` set lags their `owners` set.
//!
//! The crate also hosts the [`Broker`], the lightweight router that serves
//! whole files to out-of-band consumers (the REST surface).

mod broker;
mod referee;

pub use broker::Broker;
pub use referee::Referee;
