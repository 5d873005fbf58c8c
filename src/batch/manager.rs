//! Batch manager.

use super::scheduler::{read, write, Scheduler, SharedSession};
use super::session::{BatchOptions, BatchResults, BatchSession, BatchStatusReport, SessionStatus};
use crate::config::BatchDefaults;
use crate::{Error, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

struct SessionEntry<V> {
    session: SharedSession<V>,
    done: Arc<watch::Sender<bool>>,
}

impl<V> Clone for SessionEntry<V> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            done: Arc::clone(&self.done),
        }
    }
}

/// Owns every session of a process and exposes create/start/status/results/cancel.
///
/// The session table lock is only held for lookups; all per-session work happens
/// under that session's own lock, and never while the table is locked.
pub struct BatchManager<V> {
    scheduler: Scheduler<V>,
    defaults: BatchDefaults,
    sessions: Mutex<HashMap<String, SessionEntry<V>>>,
}

impl<V> BatchManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(scheduler: Scheduler<V>) -> Self {
        Self {
            scheduler,
            defaults: BatchDefaults::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(mut self, defaults: BatchDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &BatchDefaults {
        &self.defaults
    }

    pub fn scheduler(&self) -> &Scheduler<V> {
        &self.scheduler
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, SessionEntry<V>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: &str) -> Result<SessionEntry<V>> {
        self.table()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::batch_not_found(id))
    }

    /// Create a session from the manager defaults, overriding concurrency and rate limit.
    pub fn create_batch(
        &self,
        items: Vec<String>,
        concurrency: Option<usize>,
        rate_limit: Option<f64>,
    ) -> Result<String> {
        let mut options = BatchOptions::from(&self.defaults);
        if let Some(c) = concurrency {
            options.max_concurrency = c;
        }
        if let Some(r) = rate_limit {
            options.rate_limit = r;
        }
        self.create_with_options(items, options)
    }

    pub fn create_named_batch(
        &self,
        name: impl Into<String>,
        items: Vec<String>,
        options: BatchOptions,
    ) -> Result<String> {
        self.create_with_options(items, options.with_name(name))
    }

    pub fn create_with_options(&self, items: Vec<String>, options: BatchOptions) -> Result<String> {
        options.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let total = items.len();
        let session = BatchSession::new(id.clone(), items, options);
        info!(batch = %id, name = session.name(), total, "batch created");

        let (done, _) = watch::channel(false);
        self.table().insert(
            id.clone(),
            SessionEntry {
                session: Arc::new(RwLock::new(session)),
                done: Arc::new(done),
            },
        );
        Ok(id)
    }

    /// Begin processing and return immediately; poll [`get_status`](Self::get_status)
    /// or await [`wait`](Self::wait) to follow progress.
    ///
    /// A start that fails leaves the session pending, so it can be started again or
    /// cancelled.
    pub fn start(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        self.scheduler.spawn(entry.session, entry.done)
    }

    /// Cancel pending tasks. Running tasks finish normally.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let (cancelled, status) = {
            let mut s = write(&entry.session);
            let status = s.status();
            if status.is_terminal() {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: status.to_string(),
                    operation: "cancel",
                });
            }
            let cancelled = s.cancel(Utc::now());
            (cancelled, s.status())
        };
        if status.is_terminal() {
            entry.done.send_replace(true);
        }
        info!(batch = %id, cancelled, status = %status, "batch cancelled");
        Ok(())
    }

    pub fn get_status(&self, id: &str) -> Result<BatchStatusReport> {
        let entry = self.entry(id)?;
        let report = read(&entry.session).status_report();
        Ok(report)
    }

    pub fn get_results(&self, id: &str) -> Result<BatchResults<V>> {
        let entry = self.entry(id)?;
        let results = read(&entry.session).results();
        Ok(results)
    }

    /// Wait until the session is terminal.
    pub async fn wait(&self, id: &str) -> Result<BatchStatusReport> {
        let entry = self.entry(id)?;
        let mut done = entry.done.subscribe();
        {
            let s = read(&entry.session);
            let status = s.status();
            if status == SessionStatus::Pending {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: status.to_string(),
                    operation: "wait for",
                });
            }
        }
        // The sender lives in `entry`, so the channel cannot close while we wait.
        let _ = done.wait_for(|finished| *finished).await;
        let report = read(&entry.session).status_report();
        if !report.status.is_terminal() {
            warn!(batch = %id, status = %report.status, "batch signalled done while not terminal");
            debug_assert!(report.status.is_terminal(), "batch {} finished as {}", id, report.status);
        }
        Ok(report)
    }

    /// Create, start and wait for a session in one call.
    pub async fn run(&self, items: Vec<String>, options: BatchOptions) -> Result<BatchResults<V>> {
        let id = self.create_with_options(items, options)?;
        self.start(&id)?;
        self.wait(&id).await?;
        self.get_results(&id)
    }

    /// Status of every known session, oldest first.
    pub fn list_batches(&self) -> Vec<BatchStatusReport> {
        let entries: Vec<SessionEntry<V>> = self.table().values().cloned().collect();
        let mut reports: Vec<BatchStatusReport> = entries
            .iter()
            .map(|e| read(&e.session).status_report())
            .collect();
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        reports
    }

    /// Remove a terminal session, returning its final results.
    pub fn archive(&self, id: &str) -> Result<BatchResults<V>> {
        let entry = self.entry(id)?;
        let results = {
            let s = read(&entry.session);
            let status = s.status();
            if !status.is_terminal() {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: status.to_string(),
                    operation: "archive",
                });
            }
            s.results()
        };
        self.table().remove(id);
        info!(batch = %id, "batch archived");
        Ok(results)
    }

    /// Drop terminal sessions that ended more than `max_age` ago. Returns how many.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let entries: Vec<(String, SessionEntry<V>)> = self
            .table()
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        let stale: Vec<String> = entries
            .into_iter()
            .filter(|(_, e)| {
                let s = read(&e.session);
                s.status().is_terminal() && s.ended_at().map_or(false, |t| t <= cutoff)
            })
            .map(|(id, _)| id)
            .collect();

        let mut table = self.table();
        for id in &stale {
            table.remove(id);
        }
        if !stale.is_empty() {
            info!(pruned = stale.len(), "pruned finished batches");
        }
        stale.len()
    }
}
