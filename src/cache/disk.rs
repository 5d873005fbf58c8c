//! Persisted disk tier: one JSON blob per entry plus a separate index.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index.json            key -> IndexRecord (filename + access metadata)
//! <sha256(key)>.json    serialized CacheEntry<V>
//! ```
//!
//! Blobs and the index are written to a temporary file first and renamed into
//! place, so a crash leaves either the old or the new version on disk.

use super::entry::{duration_ms, expiry, CacheEntry};
use super::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub(crate) const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub(crate) enum DiskError {
    #[error("cache I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("cache encoding error on {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Index metadata for one durable entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl IndexRecord {
    fn from_entry<V>(entry: &CacheEntry<V>, filename: String) -> Self {
        Self {
            filename,
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            access_count: entry.access_count,
            ttl: entry.ttl,
            tag: entry.tag.clone(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expiry(self.created_at, self.ttl).map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: HashMap<String, IndexRecord>,
}

/// Outcome of a disk-tier read.
pub(crate) enum DiskRead<V> {
    Absent,
    Found(CacheEntry<V>),
    /// The blob was missing or undecodable; its index record has been pruned.
    Corrupt(String),
}

pub(crate) struct DiskTier {
    dir: PathBuf,
    index: HashMap<String, IndexRecord>,
}

impl DiskTier {
    /// Open (or create) the tier rooted at `dir`, reloading the index.
    ///
    /// An unreadable index is logged and replaced by an empty one rather than
    /// failing startup; orphaned blobs are overwritten as keys come back.
    pub fn open(dir: &Path) -> Result<Self, DiskError> {
        fs::create_dir_all(dir).map_err(|source| DiskError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let index_path = dir.join(INDEX_FILE);
        let index = match fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(file) => file.entries,
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "cache index corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(DiskError::Io {
                    path: index_path,
                    source,
                })
            }
        };
        debug!(dir = %dir.display(), entries = index.len(), "disk tier opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn record(&self, key: &str) -> Option<&IndexRecord> {
        self.index.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    pub fn keys_where<F>(&self, mut pred: F) -> Vec<String>
    where
        F: FnMut(&str, &IndexRecord) -> bool,
    {
        self.index
            .iter()
            .filter(|(k, r)| pred(k, r))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.keys_where(|_, r| r.is_expired_at(now))
    }

    pub fn read<V: DeserializeOwned>(&mut self, key: &str) -> DiskRead<V> {
        let Some(record) = self.index.get(key) else {
            return DiskRead::Absent;
        };
        let path = self.dir.join(&record.filename);
        let reason = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheEntry<V>>(&bytes) {
                Ok(mut entry) if entry.key == key => {
                    // Access metadata lives in the index; the blob is only rewritten on put.
                    entry.last_accessed = record.last_accessed;
                    entry.access_count = record.access_count;
                    return DiskRead::Found(entry);
                }
                Ok(entry) => format!("blob holds key {:?}", entry.key),
                Err(e) => format!("undecodable blob: {}", e),
            },
            Err(e) => format!("unreadable blob: {}", e),
        };

        self.index.remove(key);
        if let Err(e) = self.persist_index() {
            warn!(error = %e, "failed to persist index after pruning");
        }
        remove_file_quiet(&path);
        DiskRead::Corrupt(reason)
    }

    /// Write (or overwrite) the blob for `entry` and record it in the index.
    pub fn write<V: Serialize>(&mut self, entry: &CacheEntry<V>) -> Result<(), DiskError> {
        let filename = CacheKey::new(&entry.key).backing_filename();
        let path = self.dir.join(&filename);
        let bytes = serde_json::to_vec(entry).map_err(|source| DiskError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)?;
        self.index
            .insert(entry.key.clone(), IndexRecord::from_entry(entry, filename));
        self.persist_index()
    }

    /// Record a hit on `key`.
    pub fn touch(
        &mut self,
        key: &str,
        last_accessed: DateTime<Utc>,
        access_count: u64,
    ) -> Result<(), DiskError> {
        if let Some(record) = self.index.get_mut(key) {
            record.last_accessed = last_accessed;
            record.access_count = access_count;
            self.persist_index()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, DiskError> {
        let Some(record) = self.index.remove(key) else {
            return Ok(false);
        };
        // Blob first: a stale index record without its blob is pruned on open.
        remove_file_quiet(&self.dir.join(&record.filename));
        self.persist_index()?;
        Ok(true)
    }

    /// Remove several keys with a single index write; returns how many existed.
    pub fn remove_many(&mut self, keys: &[String]) -> Result<usize, DiskError> {
        let mut removed = 0;
        for key in keys {
            if let Some(record) = self.index.remove(key) {
                remove_file_quiet(&self.dir.join(&record.filename));
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist_index()?;
        }
        Ok(removed)
    }

    /// Eviction candidate chosen from at most `sample` index records: oldest
    /// `last_accessed`, then lowest `access_count`.
    pub fn sample_victim(&self, sample: usize) -> Option<String> {
        self.index
            .iter()
            .take(sample.max(1))
            .min_by(|(_, a), (_, b)| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then(a.access_count.cmp(&b.access_count))
            })
            .map(|(k, _)| k.clone())
    }

    /// Drop index records whose blob no longer exists. Returns the pruned keys.
    pub fn prune_missing(&mut self) -> Result<Vec<String>, DiskError> {
        let missing = self.keys_where(|_, r| !self.dir.join(&r.filename).is_file());
        if !missing.is_empty() {
            for key in &missing {
                self.index.remove(key);
            }
            self.persist_index()?;
        }
        Ok(missing)
    }

    pub fn clear(&mut self) -> Result<(), DiskError> {
        for record in self.index.values() {
            remove_file_quiet(&self.dir.join(&record.filename));
        }
        self.index.clear();
        self.persist_index()
    }

    fn persist_index(&self) -> Result<(), DiskError> {
        let path = self.dir.join(INDEX_FILE);
        let file = IndexFileRef {
            version: INDEX_VERSION,
            entries: &self.index,
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| DiskError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
    }
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    version: u32,
    entries: &'a HashMap<String, IndexRecord>,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DiskError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| {
            remove_file_quiet(&tmp);
            DiskError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
}

fn remove_file_quiet(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove cache file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, payload: &str) -> CacheEntry<String> {
        CacheEntry::new(key, payload.to_string(), Duration::ZERO, Utc::now())
    }

    #[test]
    fn test_write_read_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tier = DiskTier::open(dir.path()).unwrap();
            tier.write(&entry("celeste", "great")).unwrap();
            assert_eq!(tier.len(), 1);
        }
        let mut tier = DiskTier::open(dir.path()).unwrap();
        assert!(tier.contains("celeste"));
        match tier.read::<String>("celeste") {
            DiskRead::Found(e) => assert_eq!(e.payload, "great"),
            _ => panic!("expected a stored entry"),
        }
    }

    #[test]
    fn test_missing_blob_prunes_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write(&entry("a", "x")).unwrap();
        let filename = tier.record("a").unwrap().filename.clone();
        fs::remove_file(dir.path().join(filename)).unwrap();

        assert!(matches!(tier.read::<String>("a"), DiskRead::Corrupt(_)));
        assert!(!tier.contains("a"));
        // The pruned index is what gets reloaded.
        assert_eq!(DiskTier::open(dir.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_corrupt_blob_prunes_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write(&entry("a", "x")).unwrap();
        let filename = tier.record("a").unwrap().filename.clone();
        fs::write(dir.path().join(filename), b"{not json").unwrap();

        assert!(matches!(tier.read::<String>("a"), DiskRead::Corrupt(_)));
        assert_eq!(tier.len(), 0);
        assert!(matches!(tier.read::<String>("a"), DiskRead::Absent));
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"garbage").unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn test_sample_victim_prefers_oldest_then_least_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        let now = Utc::now();
        let mut old = CacheEntry::new("old", 1u8, Duration::ZERO, now - chrono::Duration::hours(2));
        old.access_count = 9;
        let mut tie_busy = CacheEntry::new("busy", 1u8, Duration::ZERO, now);
        tie_busy.access_count = 5;
        let tie_idle = CacheEntry::new("idle", 1u8, Duration::ZERO, now);
        tier.write(&old).unwrap();
        tier.write(&tie_busy).unwrap();
        tier.write(&tie_idle).unwrap();

        assert_eq!(tier.sample_victim(16).as_deref(), Some("old"));
        tier.remove("old").unwrap();
        assert_eq!(tier.sample_victim(16).as_deref(), Some("idle"));
    }

    #[test]
    fn test_remove_and_prune_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::open(dir.path()).unwrap();
        tier.write(&entry("a", "1")).unwrap();
        tier.write(&entry("b", "2")).unwrap();
        assert!(tier.remove("a").unwrap());
        assert!(!tier.remove("a").unwrap());

        let filename = tier.record("b").unwrap().filename.clone();
        fs::remove_file(dir.path().join(filename)).unwrap();
        assert_eq!(tier.prune_missing().unwrap(), vec!["b".to_string()]);
        assert_eq!(tier.len(), 0);
    }
}
