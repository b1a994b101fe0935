//! Setup configuration
//!
//! The setup file is YAML:
//!
//! ```yaml
//! services:
//!   rep1:
//!     driver: local
//!     options:
//!       root: /home/alice/sync
//!     folders:
//!       docs: docs
//! rules:
//!   - match: "**"
//!     sync: [rep1, rep2]
//!     mode: mirror
//! ```
//!
//! Driver options are enumerated per driver; each adapter decodes its own
//! options struct with `deny_unknown_fields`, so an unknown option is a
//! fatal [`Error::Driver`] at start. The session identifier passed to every
//! process derives the shared store path and socket registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::newtypes::DriverName;
use crate::rules::{RoutingRule, RuleSet, SyncMode};

/// Top-level setup: services plus ordered routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Setup {
    /// Service name -> driver configuration.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Ordered routing rules; first match wins.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One configured driver instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Driver type, e.g. `local` or `playground`.
    pub driver: String,
    /// Driver-specific options, decoded by the adapter at start.
    #[serde(default)]
    pub options: serde_yaml::Mapping,
    /// Folder name -> path relative to the driver's root.
    #[serde(default)]
    pub folders: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Decodes the opaque options mapping into a driver's own options type.
    ///
    /// Adapters declare their options struct with `deny_unknown_fields`, so
    /// a typo in the setup file fails here rather than being ignored.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_yaml::from_value(serde_yaml::Value::Mapping(self.options.clone()))
            .map_err(|e| Error::driver(format!("invalid driver options: {e}")))
    }
}

/// One routing rule as written in the setup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Path glob matched against `{folder}/{filename}`.
    #[serde(rename = "match")]
    pub match_: String,
    /// Drivers that hold matching files.
    pub sync: Vec<String>,
    /// Sync mode; only `mirror` today.
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
}

fn default_mode() -> SyncMode {
    SyncMode::Mirror
}

impl Setup {
    /// Loads and parses the setup file.
    ///
    /// # Errors
    /// [`Error::Driver`] on unreadable or malformed YAML - this is an
    /// operator fault, fatal at start.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::driver(format!("cannot read setup file {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parses setup YAML from a string.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let setup: Setup = serde_yaml::from_str(raw)
            .map_err(|e| Error::driver(format!("malformed setup file: {e}")))?;
        setup.validate()?;
        Ok(setup)
    }

    /// Compiles the rule list, validating every referenced driver exists.
    pub fn rule_set(&self) -> Result<RuleSet, Error> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let mut sync = Vec::with_capacity(rule.sync.len());
            for name in &rule.sync {
                if !self.services.contains_key(name) {
                    return Err(Error::driver(format!(
                        "rule '{}' references unknown service '{name}'",
                        rule.match_
                    )));
                }
                sync.push(DriverName::new(name.clone())?);
            }
            rules.push(RoutingRule::new(&rule.match_, sync, rule.mode)?);
        }
        Ok(RuleSet::new(rules))
    }

    /// Looks up one service's configuration.
    pub fn service(&self, name: &str) -> Result<&ServiceConfig, Error> {
        self.services
            .get(name)
            .ok_or_else(|| Error::driver(format!("service '{name}' not present in setup")))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.services.is_empty() {
            return Err(Error::driver("setup declares no services"));
        }
        for name in self.services.keys() {
            DriverName::new(name.clone())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session environment
// ---------------------------------------------------------------------------

/// Filesystem locations derived from the session identifier.
///
/// Every process of one Onitu session shares the same store; socket ports
/// are registered inside that store rather than in the environment.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    /// Directory holding all session state.
    pub root: PathBuf,
    /// SQLite database backing the metadata store.
    pub store: PathBuf,
}

impl SessionPaths {
    /// Resolves the paths for a session identifier.
    ///
    /// Uses the platform data directory (`~/.local/share/onitu/{session}`
    /// on Linux), falling back to the system temp directory when no data
    /// directory is available.
    #[must_use]
    pub fn for_session(session: &str) -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("onitu")
            .join(session);
        let store = base.join("store.db");
        Self { root: base, store }
    }
}
