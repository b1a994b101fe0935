//! Fid addressing - deterministic file identifiers
//!
//! A fid is a 128-bit identifier derived by hashing the canonicalized
//! `(folder, filename)` tuple. Canonicalization NFC-normalizes the filename
//! and strips trailing slashes from the folder; case is preserved (backends
//! with case-insensitive namespaces are handled by the conflict map, never
//! here). Collision resistance is relied upon at the 2^-64 birthday level
//! with no secondary disambiguation; callers detect the pathological case by
//! comparing the stored filename on record load.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::Error;

/// 128-bit file identifier, displayed as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fid([u8; 16]);

impl Fid {
    /// Derives the fid for a `(folder, filename)` pair.
    ///
    /// Pure: the same pair always yields the same fid, across processes and
    /// restarts. A rename to a different name therefore yields a different
    /// fid.
    #[must_use]
    pub fn compute(folder: &str, filename: &str) -> Self {
        let (folder, filename) = canonicalize(folder, filename);

        let mut hasher = Sha256::new();
        hasher.update(folder.as_bytes());
        // NUL keeps ("ab", "c") and ("a", "bc") from colliding.
        hasher.update([0u8]);
        hasher.update(filename.as_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Rebuilds a fid from its raw bytes (e.g. off the wire).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// The canonical form of a `(folder, filename)` pair: trailing slashes
/// stripped from the folder, filename NFC-normalized, case preserved.
///
/// Two pairs identify the same file exactly when their canonical forms are
/// equal; loaders compare these to detect the (astronomically unlikely)
/// fid collision rather than silently reusing a fid.
#[must_use]
pub fn canonicalize(folder: &str, filename: &str) -> (String, String) {
    (
        folder.trim_end_matches('/').to_string(),
        filename.nfc().collect(),
    )
}

impl Display for Fid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Fid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(Error::service(format!("invalid fid '{s}': expected 32 hex digits")));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .map_err(|_| Error::service(format!("invalid fid '{s}'")))?;
            bytes[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::service(format!("invalid fid '{s}'")))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Fid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fid> for String {
    fn from(fid: Fid) -> Self {
        fid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = Fid::compute("music", "song.mp3");
        let b = Fid::compute("music", "song.mp3");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_names_different_fids() {
        let a = Fid::compute("music", "song.mp3");
        let b = Fid::compute("music", "Song.mp3");
        let c = Fid::compute("music", "song2.mp3");
        assert_ne!(a, b, "case is preserved, not folded");
        assert_ne!(a, c);
    }

    #[test]
    fn test_folder_trailing_slash_stripped() {
        assert_eq!(
            Fid::compute("music/", "song.mp3"),
            Fid::compute("music", "song.mp3")
        );
    }

    #[test]
    fn test_folder_filename_boundary() {
        // The separator keeps shifted boundaries apart.
        assert_ne!(Fid::compute("ab", "c"), Fid::compute("a", "bc"));
    }

    #[test]
    fn test_nfc_normalization() {
        // "é" precomposed (U+00E9) vs decomposed (U+0065 U+0301)
        let precomposed = "caf\u{e9}.txt";
        let decomposed = "cafe\u{301}.txt";
        assert_eq!(
            Fid::compute("docs", precomposed),
            Fid::compute("docs", decomposed)
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let fid = Fid::compute("docs", "report.pdf");
        let hex = fid.to_string();
        assert_eq!(hex.len(), 32);
        assert_eq!(hex.parse::<Fid>().unwrap(), fid);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-fid".parse::<Fid>().is_err());
        assert!("zz".repeat(16).parse::<Fid>().is_err());
    }
}
