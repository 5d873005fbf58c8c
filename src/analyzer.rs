//! The external analysis collaborator.
//!
//! Scraping a deal page and running the review pipeline over it lives outside this
//! crate. The scheduler and cache warmer only see it through [`Analyzer`].

use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// Failure reported by an analyzer for a single item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AnalyzerError {
    pub message: String,
    pub retryable: bool,
}

impl AnalyzerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl From<String> for AnalyzerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for AnalyzerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for AnalyzerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

/// Turns an item key into an analysis result.
///
/// Implementations must be safe to call concurrently and are responsible for
/// bounding their own call time; the scheduler never interrupts a running call.
#[async_trait]
pub trait Analyzer: Send + Sync {
    type Output: Send;

    async fn analyze(&self, key: &str) -> Result<Self::Output, AnalyzerError>;
}

/// Adapter that turns an async closure into an [`Analyzer`].
///
/// ```rust
/// use dealscope::analyzer::{Analyzer, AnalyzerError, FnAnalyzer};
///
/// # async fn demo() {
/// let analyzer = FnAnalyzer::new(|key: String| async move {
///     Ok::<_, AnalyzerError>(key.len())
/// });
/// assert_eq!(analyzer.analyze("hades").await, Ok(5));
/// # }
/// ```
pub struct FnAnalyzer<F> {
    f: F,
}

impl<F> FnAnalyzer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> Analyzer for FnAnalyzer<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AnalyzerError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn analyze(&self, key: &str) -> Result<T, AnalyzerError> {
        (self.f)(key.to_string()).await
    }
}
