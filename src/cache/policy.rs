//! Persistence and invalidation policies.

use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the cache knows about an entry when deciding whether to persist it.
#[derive(Debug, Clone, Copy)]
pub struct PersistRequest<'a> {
    pub key: &'a str,
    pub ttl: Duration,
    pub persist_hint: bool,
    pub tag: Option<&'a str>,
}

/// Decides whether a `put` also writes the entry to the disk tier.
pub trait PersistPolicy: Send + Sync {
    fn should_persist(&self, request: &PersistRequest<'_>) -> bool;
}

impl<F> PersistPolicy for F
where
    F: Fn(&PersistRequest<'_>) -> bool + Send + Sync,
{
    fn should_persist(&self, request: &PersistRequest<'_>) -> bool {
        self(request)
    }
}

/// Persist long-lived entries and anything the caller explicitly hints at.
///
/// Never-expiring entries (zero TTL) count as exceeding any threshold.
#[derive(Debug, Clone)]
pub struct TtlThresholdPolicy {
    pub min_ttl: Duration,
}

impl TtlThresholdPolicy {
    pub fn new(min_ttl: Duration) -> Self {
        Self { min_ttl }
    }
}

impl PersistPolicy for TtlThresholdPolicy {
    fn should_persist(&self, request: &PersistRequest<'_>) -> bool {
        request.persist_hint || request.ttl.is_zero() || request.ttl > self.min_ttl
    }
}

type KeyPredicate = dyn Fn(&str, Option<&str>) -> bool + Send + Sync;

/// Selects entries for [`TieredCache::invalidate`](super::TieredCache::invalidate).
#[derive(Clone)]
pub enum Matcher {
    /// One key, normalized the same way lookups are.
    Exact(String),
    /// Keys starting with the (normalized) prefix.
    Prefix(String),
    /// Entries stored with exactly this tag.
    Tag(String),
    /// Regex tested against the key and, when present, the tag.
    Pattern(Regex),
    Predicate(Arc<KeyPredicate>),
}

impl Matcher {
    pub fn exact(key: &str) -> Self {
        Matcher::Exact(CacheKey::normalize(key))
    }

    pub fn prefix(prefix: &str) -> Self {
        // Keep a trailing space meaningful: "hades " should not match "hadestown".
        let trailing = prefix.ends_with(char::is_whitespace) && !prefix.trim().is_empty();
        let mut normalized = CacheKey::normalize(prefix);
        if trailing {
            normalized.push(' ');
        }
        Matcher::Prefix(normalized)
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Matcher::Tag(tag.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern).map(Matcher::Pattern).map_err(|e| {
            Error::validation_with_context(
                format!("invalid invalidation pattern: {}", e),
                ErrorContext::new()
                    .with_details(pattern)
                    .with_source("cache_matcher"),
            )
        })
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str, Option<&str>) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &str, tag: Option<&str>) -> bool {
        match self {
            Matcher::Exact(k) => key == k,
            Matcher::Prefix(p) => key.starts_with(p.as_str()),
            Matcher::Tag(t) => tag == Some(t.as_str()),
            Matcher::Pattern(re) => re.is_match(key) || tag.map_or(false, |t| re.is_match(t)),
            Matcher::Predicate(f) => f(key, tag),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(k) => f.debug_tuple("Exact").field(k).finish(),
            Matcher::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            Matcher::Tag(t) => f.debug_tuple("Tag").field(t).finish(),
            Matcher::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
