//! Validated newtypes for driver and folder names
//!
//! Names end up embedded in store keys (`file:{fid}:entry:{driver}`), so the
//! constructors reject the `:` separator and anything unprintable rather than
//! letting a bad name corrupt the keyspace.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of a driver (service) instance, e.g. `rep1` or `dropbox-music`.
///
/// Ordered lexicographically; the referee relies on this ordering for
/// deterministic source selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriverName(String);

impl DriverName {
    /// Validates and wraps a driver name.
    ///
    /// # Errors
    /// Returns [`Error::Driver`] if the name is empty, contains `:`, or
    /// contains whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::driver("driver name must not be empty"));
        }
        if name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(Error::driver(format!(
                "driver name '{name}' must not contain ':' or whitespace"
            )));
        }
        Ok(Self(name))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DriverName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DriverName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DriverName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DriverName> for String {
    fn from(name: DriverName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(DriverName::new("rep1").is_ok());
        assert!(DriverName::new("dropbox-music").is_ok());
        assert!(DriverName::new("s3_backup").is_ok());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(DriverName::new("").is_err());
    }

    #[test]
    fn test_rejects_separator_and_whitespace() {
        assert!(DriverName::new("a:b").is_err());
        assert!(DriverName::new("a b").is_err());
        assert!(DriverName::new("tab\tname").is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = DriverName::new("alpha").unwrap();
        let b = DriverName::new("beta").unwrap();
        assert!(a < b);
    }
}
