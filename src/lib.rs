//! # dealscope
//!
//! 游戏折扣分析的批量调度器与分层结果缓存。
//!
//! Batch analysis scheduler and tiered result cache for the dealscope game-deals
//! pipeline.
//!
//! ## Overview
//!
//! Analyzing a deal (scraping the listing, then running the review pipeline over
//! it) is slow and rate-limited upstream. This crate runs those analyses in
//! batches with bounded concurrency and memoizes the results so repeated items
//! are answered from memory or disk.
//!
//! ## Key Features
//!
//! - **Batching**: [`batch::BatchManager`] creates, starts, cancels and reports on sessions
//! - **Rate limiting**: rolling-window start limiter via [`resilience`]
//! - **Caching**: memory + disk [`cache::TieredCache`] with TTL, LRU eviction and warming
//! - **Configuration**: YAML plus environment overrides via [`config`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dealscope::analyzer::{AnalyzerError, FnAnalyzer};
//! use dealscope::batch::{BatchManager, Scheduler};
//! use dealscope::cache::TieredCache;
//! use dealscope::config::DealscopeConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dealscope::Result<()> {
//!     let config = DealscopeConfig::load(None)?;
//!     let cache = Arc::new(TieredCache::<String>::open(config.cache.clone())?);
//!     let _sweeper = cache.spawn_sweeper();
//!
//!     let analyzer = FnAnalyzer::new(|key: String| async move {
//!         Ok::<_, AnalyzerError>(format!("review of {}", key))
//!     });
//!     let manager = BatchManager::new(Scheduler::new(Arc::new(analyzer)).with_cache(cache.clone()))
//!         .with_defaults(config.batch.clone());
//!
//!     let id = manager.create_batch(vec!["hades".into(), "celeste".into()], None, None)?;
//!     manager.start(&id)?;
//!     manager.wait(&id).await?;
//!     println!("{:?}", manager.get_results(&id)?.summary);
//!
//!     cache.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`analyzer`] | The analysis collaborator trait |
//! | [`batch`] | Sessions, scheduler and batch manager |
//! | [`cache`] | Tiered result cache |
//! | [`config`] | Configuration loading |
//! | [`resilience`] | Rate limiting |

pub mod analyzer;
pub mod batch;
pub mod cache;
pub mod config;
pub mod resilience;

pub use analyzer::{Analyzer, AnalyzerError, FnAnalyzer};
pub use batch::{BatchManager, BatchOptions, Scheduler};
pub use cache::{CacheConfig, TieredCache};
pub use config::DealscopeConfig;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
