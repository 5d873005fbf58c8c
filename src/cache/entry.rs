//! Cache entries shared by both tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One memoized analyzer result.
///
/// The memory tier keeps the value as-is; the disk tier stores this struct as a
/// self-describing JSON record, so it never needs to know the payload's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Zero means the entry never expires.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, payload: V, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expiry(self.created_at, self.ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |at| now >= at)
    }

    /// Access bookkeeping done on every hit.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Expiry instant for an entry created at `created_at`, `None` when it never expires.
pub(crate) fn expiry(created_at: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    // TTLs too large for chrono are treated as "never".
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| created_at.checked_add_signed(d))
}

/// Convert an hour count to a TTL. Non-positive or non-finite values mean "never expires".
pub fn ttl_hours(hours: f64) -> Duration {
    if !hours.is_finite() || hours <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::ZERO)
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
