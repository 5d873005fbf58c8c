//! 结果缓存模块：内存 LRU 层加磁盘持久层，避免重复的昂贵分析调用。
//!
//! # Result Caching Module
//!
//! Memoizes analyzer results in two tiers so repeated lookups for the same item
//! skip the scrape-and-review pipeline entirely.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TieredCache`] | Memory + disk cache with TTL, LRU eviction, promotion and stats |
//! | [`CacheConfig`] | Capacities, TTL defaults, cache directory and sweep interval |
//! | [`CacheStats`] | Hit/miss/eviction counters and tier sizes |
//! | [`CacheEntry`] | One memoized result plus its access metadata |
//! | [`CacheKey`] | Whitespace- and case-normalized item key |
//! | [`PersistPolicy`] | Decides which entries also go to disk |
//! | [`Matcher`] | Selects entries to invalidate by key, prefix, tag or regex |
//!
//! ## Layout on disk
//!
//! Each persisted entry is one JSON file named after the SHA-256 of its
//! normalized key. `index.json` in the same directory maps keys to those files
//! together with creation time, TTL and access metadata, and is rewritten
//! atomically on every change. Index records whose file is missing or
//! unreadable are pruned.
//!
//! ## Example
//!
//! ```rust
//! use dealscope::cache::{CacheConfig, Matcher, TieredCache};
//! use std::time::Duration;
//!
//! let cache: TieredCache<String> =
//!     TieredCache::open(CacheConfig::new().with_memory_capacity(128)).unwrap();
//!
//! cache.put("Hades II", "8.7".to_string(), Duration::from_secs(3600), false);
//! assert_eq!(cache.get("hades ii").as_deref(), Some("8.7"));
//!
//! assert_eq!(cache.invalidate(&Matcher::prefix("hades")), 1);
//! assert!(cache.get("hades ii").is_none());
//! ```

mod disk;
mod entry;
mod key;
mod manager;
mod memory;
mod policy;

pub use entry::{ttl_hours, CacheEntry};
pub use key::CacheKey;
pub use manager::{CacheConfig, CacheStats, TieredCache, WarmReport};
pub use policy::{Matcher, PersistPolicy, PersistRequest, TtlThresholdPolicy};
