//! Batch scheduler.

use super::session::{BatchSession, ProgressCallback};
use crate::analyzer::Analyzer;
use crate::cache::TieredCache;
use crate::resilience::{RateLimiter, RateLimiterConfig};
use crate::{Error, ErrorContext, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

pub(crate) type SharedSession<V> = Arc<RwLock<BatchSession<V>>>;

pub(crate) fn read<V>(s: &SharedSession<V>) -> RwLockReadGuard<'_, BatchSession<V>> {
    s.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<V>(s: &SharedSession<V>) -> RwLockWriteGuard<'_, BatchSession<V>> {
    s.write().unwrap_or_else(PoisonError::into_inner)
}

enum Outcome<V> {
    Success { value: V, cached: bool },
    Failure(String),
}

/// Runs a session's tasks on a fixed pool of worker loops.
///
/// Each worker claims the next pending task, waits for the session's rate limiter,
/// consults the cache, and calls the analyzer on a miss. Successful results are
/// written back to the cache. Analyzer errors and panics become task errors and
/// never stop the worker.
pub struct Scheduler<V> {
    analyzer: Arc<dyn Analyzer<Output = V>>,
    cache: Option<Arc<TieredCache<V>>>,
}

impl<V> Clone for Scheduler<V> {
    fn clone(&self) -> Self {
        Self {
            analyzer: Arc::clone(&self.analyzer),
            cache: self.cache.clone(),
        }
    }
}

impl<V> Scheduler<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(analyzer: Arc<dyn Analyzer<Output = V>>) -> Self {
        Self {
            analyzer,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache<V>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<TieredCache<V>>> {
        self.cache.as_ref()
    }

    /// Mark the session started and spawn its worker pool, returning at once.
    /// `done` flips to `true` once every worker has exited.
    ///
    /// Everything that can fail is checked before the session is marked started, so
    /// an error leaves it untouched and startable again.
    pub(crate) fn spawn(&self, session: SharedSession<V>, done: Arc<watch::Sender<bool>>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                format!("batch start requires a tokio runtime: {}", e),
                ErrorContext::new().with_source("batch_scheduler"),
            )
        })?;

        let options = read(&session).options().clone();
        let limiter = RateLimiterConfig::from_rps(options.rate_limit).ok_or_else(|| {
            Error::validation_with_context(
                format!("rate_limit {} cannot be turned into a limiter window", options.rate_limit),
                ErrorContext::new()
                    .with_field_path("batch.rate_limit")
                    .with_source("batch_scheduler"),
            )
        })?;

        let (id, pending) = {
            let mut s = write(&session);
            if s.is_started() || s.status().is_terminal() {
                return Err(Error::InvalidState {
                    id: s.id().to_string(),
                    state: s.status().to_string(),
                    operation: "start",
                });
            }
            s.mark_started(Utc::now());
            (s.id().to_string(), s.pending_count())
        };
        let ctx = WorkerContext {
            session: Arc::clone(&session),
            analyzer: Arc::clone(&self.analyzer),
            cache: self.cache.clone(),
            limiter: Arc::new(RateLimiter::new(limiter)),
            progress: options.progress.clone(),
            cache_ttl: options.cache_ttl,
        };

        let workers = options.max_concurrency.min(pending);
        info!(batch = %id, tasks = pending, workers, rate_limit = options.rate_limit, "batch started");

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn_on(ctx.clone().run(worker), &runtime);
        }
        runtime.spawn(async move {
            while let Some(joined) = pool.join_next().await {
                if let Err(e) = joined {
                    warn!(batch = %id, error = %e, "batch worker exited abnormally");
                }
            }
            let report = {
                let mut s = write(&session);
                let abandoned = s.abandon_unfinished("worker stopped before the task finished", Utc::now());
                if abandoned > 0 {
                    warn!(batch = %id, abandoned, "tasks left unfinished by dead workers closed out");
                }
                s.status_report()
            };
            info!(
                batch = %id,
                status = %report.status,
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "batch finished"
            );
            done.send_replace(true);
        });
        Ok(())
    }
}

struct WorkerContext<V> {
    session: SharedSession<V>,
    analyzer: Arc<dyn Analyzer<Output = V>>,
    cache: Option<Arc<TieredCache<V>>>,
    limiter: Arc<RateLimiter>,
    progress: Option<ProgressCallback>,
    cache_ttl: Duration,
}

impl<V> Clone for WorkerContext<V> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            analyzer: Arc::clone(&self.analyzer),
            cache: self.cache.clone(),
            limiter: Arc::clone(&self.limiter),
            progress: self.progress.clone(),
            cache_ttl: self.cache_ttl,
        }
    }
}

impl<V> WorkerContext<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn run(self, worker: usize) {
        loop {
            let claimed = write(&self.session).claim_next(Utc::now());
            let Some((index, key)) = claimed else {
                break;
            };
            self.limiter.allow().await;
            debug!(worker, key = %key, "task started");

            let outcome = self.execute(&key).await;
            let snapshot = {
                let mut s = write(&self.session);
                match outcome {
                    Outcome::Success { value, cached } => s.complete_task(index, value, cached, Utc::now()),
                    Outcome::Failure(error) => {
                        warn!(batch = %s.id(), key = %key, %error, "task failed");
                        s.fail_task(index, error, Utc::now());
                    }
                }
                s.snapshot(Some(key))
            };
            if let Some(progress) = &self.progress {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| progress(&snapshot))) {
                    warn!(
                        batch = %snapshot.id,
                        key = ?snapshot.last_key,
                        panic = %panic_message(payload),
                        "progress callback panicked"
                    );
                }
            }
        }
        debug!(worker, "worker idle, exiting");
    }

    async fn execute(&self, key: &str) -> Outcome<V> {
        if let Some(value) = self.cache.as_ref().and_then(|c| c.get(key)) {
            return Outcome::Success { value, cached: true };
        }

        let analyzer = Arc::clone(&self.analyzer);
        let owned = key.to_string();
        // A separate task so a panicking analyzer surfaces as a JoinError.
        match tokio::spawn(async move { analyzer.analyze(&owned).await }).await {
            Ok(Ok(value)) => {
                if let Some(cache) = &self.cache {
                    cache.put(key, value.clone(), self.cache_ttl, false);
                }
                Outcome::Success { value, cached: false }
            }
            Ok(Err(e)) => Outcome::Failure(e.to_string()),
            Err(e) => Outcome::Failure(join_failure(e)),
        }
    }
}

fn join_failure(e: JoinError) -> String {
    if e.is_panic() {
        format!("analyzer panicked: {}", panic_message(e.into_panic()))
    } else {
        format!("analyzer task aborted: {}", e)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
