//! Routing rules - which drivers own which files
//!
//! Rules are ordered; the first whose glob matches the slash-joined
//! `{folder}/{filename}` path fixes the `owners` set at record-creation
//! time. Globs support `*` (within a segment), `?`, and `**` (across
//! segments) and are compiled once into anchored regexes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Error;
use crate::newtypes::DriverName;

/// How the matched drivers share the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Every listed driver holds a full copy.
    Mirror,
}

/// One compiled routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pattern: String,
    regex: Regex,
    sync: Vec<DriverName>,
    mode: SyncMode,
}

impl RoutingRule {
    /// Compiles a rule from its glob pattern and driver list.
    ///
    /// # Errors
    /// Returns [`Error::Driver`] when the driver list is empty or a name is
    /// invalid; glob compilation cannot fail since every metacharacter is
    /// escaped or translated.
    pub fn new(pattern: &str, sync: Vec<DriverName>, mode: SyncMode) -> Result<Self, Error> {
        if sync.is_empty() {
            return Err(Error::driver(format!(
                "rule '{pattern}' must list at least one driver"
            )));
        }
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| Error::driver(format!("rule '{pattern}' failed to compile: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            sync,
            mode,
        })
    }

    /// The original glob pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Drivers synchronized by this rule.
    #[must_use]
    pub fn sync(&self) -> &[DriverName] {
        &self.sync
    }

    /// The rule's sync mode.
    #[must_use]
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Ordered set of routing rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    /// Wraps an ordered rule list.
    #[must_use]
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Owners for a `(folder, filename)` pair: the `sync` list of the first
    /// matching rule, or an empty set when nothing matches (the file is then
    /// not synchronized).
    #[must_use]
    pub fn owners_for(&self, folder: &str, filename: &str) -> BTreeSet<DriverName> {
        let folder = folder.trim_end_matches('/');
        let path = if folder.is_empty() {
            filename.to_string()
        } else {
            format!("{folder}/{filename}")
        };

        for rule in &self.rules {
            if rule.matches(&path) {
                return rule.sync.iter().cloned().collect();
            }
        }
        BTreeSet::new()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Translates a path glob into an anchored regex.
///
/// `**` crosses segment boundaries, `*` and `?` stay within one segment.
/// A leading `/` on the pattern is ignored so `/music/*` and `music/*`
/// behave identically against folder-relative paths.
fn glob_to_regex(glob: &str) -> String {
    let glob = glob.trim_start_matches('/');
    let mut regex = String::with_capacity(glob.len() * 2 + 2);
    regex.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // swallow a following slash so "a/**/b" also matches "a/b"
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}
