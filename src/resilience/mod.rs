//! 弹性模块：为昂贵且受限流约束的分析调用提供吞吐控制。
//!
//! # Resilience Primitives Module
//!
//! Throughput control for calls into the expensive, rate-limited analyzer.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Rolling-window limiter on operation starts |
//!
//! ## Rate Limiter
//!
//! The limiter bounds how many operations may *start* inside a rolling window.
//! Callers never see an error, only a delay:
//!
//! ```rust
//! use dealscope::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # async fn demo() {
//! let config = RateLimiterConfig::from_rps(2.0).expect("finite, non-negative rate");
//! let limiter = RateLimiter::new(config);
//!
//! // Waits when two starts already happened in the last second
//! limiter.allow().await;
//! # }
//! ```

pub mod rate_limiter;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot, MAX_WINDOW};
