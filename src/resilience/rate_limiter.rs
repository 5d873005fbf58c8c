use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub max_starts: usize,
    pub window_ms: u64,
    /// Starts recorded inside the current window.
    pub in_window: usize,
    /// Estimated wait time until a slot frees up (ms), if currently saturated.
    pub estimated_wait_ms: Option<u64>,
}

/// Longest window a fractional rate may stretch to (one start per day).
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Operation starts allowed per window. Zero disables limiting.
    pub max_starts: usize,
    /// Length of the rolling window.
    pub window: Duration,
}

impl RateLimiterConfig {
    /// Build a window that admits `rps` starts per second.
    ///
    /// Whole rates map to `rps` starts per 1s window. Fractional rates keep the same
    /// average by stretching the window, e.g. 0.5/s becomes 1 start per 2s and 2.5/s
    /// becomes 2 starts per 800ms. A rate of zero means unlimited. Rates whose window
    /// would exceed [`MAX_WINDOW`] are rejected.
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        if rps == 0.0 {
            return Some(Self::unlimited());
        }
        let max_starts = rps.floor().max(1.0);
        let window = Duration::try_from_secs_f64(max_starts / rps)
            .ok()
            .filter(|w| *w <= MAX_WINDOW)?;
        Some(Self {
            max_starts: max_starts as usize,
            window,
        })
    }

    pub fn unlimited() -> Self {
        Self {
            max_starts: 0,
            window: Duration::from_secs(1),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_starts == 0
    }
}

#[derive(Debug)]
struct State {
    starts: VecDeque<Instant>,
}

/// Rolling-window limiter on operation *starts*.
///
/// - Shared by every worker of a session
/// - Never fails, only delays
/// - Waiters are not queued fairly; whoever re-checks first after a slot frees wins
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let capacity = cfg.max_starts;
        Self {
            cfg,
            state: Mutex::new(State {
                starts: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn prune_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        while let Some(oldest) = st.starts.front() {
            if now.duration_since(*oldest) >= cfg.window {
                st.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wait for a free slot, then record this start.
    pub async fn allow(&self) {
        if self.cfg.is_unlimited() {
            return;
        }

        loop {
            let wait_duration = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                Self::prune_locked(&self.cfg, &mut st, now);

                if st.starts.len() < self.cfg.max_starts {
                    st.starts.push_back(now);
                    return;
                }

                // Saturated: sleep until the oldest start leaves the window.
                match st.starts.front() {
                    Some(oldest) => (*oldest + self.cfg.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            if !wait_duration.is_zero() {
                tokio::time::sleep(wait_duration).await;
            }
        }
    }

    /// Record a start only if a slot is free right now.
    pub async fn try_allow(&self) -> bool {
        if self.cfg.is_unlimited() {
            return true;
        }
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::prune_locked(&self.cfg, &mut st, now);
        if st.starts.len() < self.cfg.max_starts {
            st.starts.push_back(now);
            true
        } else {
            false
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::prune_locked(&self.cfg, &mut st, now);

        let estimated_wait_ms = if !self.cfg.is_unlimited() && st.starts.len() >= self.cfg.max_starts
        {
            st.starts.front().map(|oldest| {
                (*oldest + self.cfg.window)
                    .saturating_duration_since(now)
                    .as_millis() as u64
            })
        } else {
            None
        };

        RateLimiterSnapshot {
            max_starts: self.cfg.max_starts,
            window_ms: self.cfg.window.as_millis() as u64,
            in_window: st.starts.len(),
            estimated_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rate_limiter_config_from_rps() {
        let config = RateLimiterConfig::from_rps(10.0).unwrap();
        assert_eq!(config.max_starts, 10);
        assert_eq!(config.window, Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limiter_config_fractional() {
        let config = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(config.max_starts, 1);
        assert_eq!(config.window, Duration::from_secs(2));

        let config = RateLimiterConfig::from_rps(2.5).unwrap();
        assert_eq!(config.max_starts, 2);
        assert_eq!(config.window, Duration::from_millis(800));
    }

    #[test]
    fn test_rate_limiter_config_from_rps_invalid() {
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
        assert!(RateLimiterConfig::from_rps(f64::INFINITY).is_none());
    }

    #[test]
    fn test_rate_limiter_config_rejects_unbounded_window() {
        assert!(RateLimiterConfig::from_rps(1e-20).is_none());
        assert!(RateLimiterConfig::from_rps(f64::MIN_POSITIVE).is_none());
        assert!(RateLimiterConfig::from_rps(1.0 / 100_000.0).is_none());

        let slowest = RateLimiterConfig::from_rps(1.0 / 86_400.0).unwrap();
        assert_eq!(slowest.max_starts, 1);
        assert!(slowest.window <= MAX_WINDOW);
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_rps() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rps(0.0).unwrap());
        let start = Instant::now();
        for _ in 0..100 {
            limiter.allow().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(limiter.snapshot().await.estimated_wait_ms.is_none());
    }

    #[tokio::test]
    async fn test_rate_limiter_try_allow() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_starts: 3,
            window: Duration::from_secs(60),
        });

        assert!(limiter.try_allow().await);
        assert!(limiter.try_allow().await);
        assert!(limiter.try_allow().await);
        assert!(!limiter.try_allow().await);

        let snapshot = limiter.snapshot().await;
        assert_eq!(snapshot.in_window, 3);
        assert!(snapshot.estimated_wait_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_window_ages_out() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_starts: 2,
            window: Duration::from_millis(50),
        });
        assert!(limiter.try_allow().await);
        assert!(limiter.try_allow().await);
        assert!(!limiter.try_allow().await);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(limiter.try_allow().await);
    }

    #[tokio::test]
    async fn test_rate_limiter_allow_blocks_until_slot_frees() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_starts: 2,
            window: Duration::from_millis(100),
        });
        let start = Instant::now();
        for _ in 0..5 {
            limiter.allow().await;
        }
        // Starts land at ~0, 0, 100, 100, 200 ms.
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_limiter_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            max_starts: 4,
            window: Duration::from_millis(100),
        }));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { l.allow().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(95));
        assert_eq!(limiter.snapshot().await.in_window, 4);
    }
}
