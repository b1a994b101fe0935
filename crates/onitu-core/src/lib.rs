//! Onitu Core - Domain logic shared by every Onitu process
//!
//! This crate contains the pieces every other crate builds on:
//! - **Fid addressing** - deterministic 128-bit file identifiers derived
//!   from `(folder, filename)`
//! - **Data model** - [`record::FileRecord`] and the opaque per-driver
//!   extras map
//! - **Routing rules** - ordered path-glob rules that decide which drivers
//!   own a file
//! - **Configuration** - the YAML setup file shared by the referee and the
//!   driver processes
//! - **Error kinds** - the tagged [`error::Error`] value distinguishing
//!   operator faults, transient backend faults, and store shutdown
//!
//! No I/O happens here; the store, fabric, and plug crates supply the
//! infrastructure around these types.

pub mod config;
pub mod error;
pub mod fid;
pub mod newtypes;
pub mod record;
pub mod rules;

pub use error::{Error, Result};
pub use fid::{canonicalize, Fid};
pub use newtypes::DriverName;
pub use record::{Extras, FileRecord};
pub use rules::RuleSet;
