//! 批量分析模块：有界并发的任务调度、限流与会话管理。
//!
//! # Batch Analysis Module
//!
//! Runs an analyzer over a list of item keys with bounded concurrency, a shared
//! rate limit per session, and cache lookups in front of every call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchManager`] | Session table: create, start, cancel, status, results |
//! | [`Scheduler`] | Fixed worker pool that executes a session's tasks |
//! | [`BatchSession`] | Tasks of one batch plus their derived status |
//! | [`BatchOptions`] | Concurrency, rate limit, cache TTL and progress callback |
//! | [`Task`] | One item and its forward-only status |
//!
//! ## Example
//!
//! ```rust
//! use dealscope::analyzer::{AnalyzerError, FnAnalyzer};
//! use dealscope::batch::{BatchManager, BatchOptions, Scheduler};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> dealscope::Result<()> {
//! let analyzer = FnAnalyzer::new(|key: String| async move {
//!     if key.is_empty() {
//!         return Err(AnalyzerError::new("empty key"));
//!     }
//!     Ok(format!("review of {}", key))
//! });
//! let manager = BatchManager::new(Scheduler::new(Arc::new(analyzer)));
//!
//! let options = BatchOptions::new().with_max_concurrency(2).with_rate_limit(0.0);
//! let results = manager
//!     .run(vec!["hades".into(), "".into(), "celeste".into()], options)
//!     .await?;
//! assert_eq!(results.summary.failed, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure reporting
//!
//! A session finishes `Completed` even when some of its items failed; the failures
//! are visible per item (`results[].error`) and in the summary counters.

mod manager;
mod scheduler;
mod session;
mod task;

pub use manager::BatchManager;
pub use scheduler::Scheduler;
pub use session::{
    BatchOptions, BatchResults, BatchSession, BatchStatusReport, ItemResult, ProgressCallback,
    ResultSummary, SessionSnapshot, SessionStatus,
};
pub use task::{Task, TaskStatus};
