//! Cache key normalization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A normalized item key.
///
/// Deal titles arrive with inconsistent casing and spacing ("Hades  II", "hades ii"),
/// so every lookup goes through the same normalization: trim, lower-case, and
/// collapse runs of whitespace into a single space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: &str) -> Self {
        Self(Self::normalize(raw))
    }

    pub fn normalize(raw: &str) -> String {
        raw.split_whitespace()
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename of the disk-tier blob backing this key (hex SHA-256 of the normalized key).
    pub fn backing_filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        format!("{}.json", hash)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_case_and_whitespace() {
        assert_eq!(CacheKey::new("  Hades \t II ").as_str(), "hades ii");
        assert_eq!(CacheKey::new("hades ii"), CacheKey::from("HADES   II"));
    }

    #[test]
    fn test_backing_filename_is_stable_hex() {
        let name = CacheKey::new("Celeste").backing_filename();
        assert_eq!(name, CacheKey::new("celeste").backing_filename());
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 64 + ".json".len());
        assert!(name[..64].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, CacheKey::new("celeste 2").backing_filename());
    }
}
