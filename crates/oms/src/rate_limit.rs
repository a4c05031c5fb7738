//! Per-source sliding-window rate limiter.
//!
//! Tracks recent request timestamps per source and rejects a request once
//! the window already holds `max_requests`. Occupancy is recomputed from the
//! recorded timestamps on every check; there is no separate counter to keep
//! in sync.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{OmsError, OmsResult};

/// Shared across request paths. Each source has its own deque behind a
/// `parking_lot::Mutex`, held only to prune, count and push.
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    sources: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            sources: DashMap::new(),
        }
    }

    /// Admit one request from `source` or fail with `RateLimited`.
    pub fn try_acquire(&self, source: &str) -> OmsResult<()> {
        self.try_acquire_at(source, Instant::now())
    }

    /// Admit at a specific instant (for testing).
    pub fn try_acquire_at(&self, source: &str, now: Instant) -> OmsResult<()> {
        let entry = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut recent = entry.lock();
        self.prune(&mut recent, now);

        if recent.len() >= self.max_requests {
            tracing::debug!(source, current = recent.len(), limit = self.max_requests, "rate limited");
            return Err(OmsError::RateLimited {
                source_name: source.to_string(),
                current: recent.len(),
                limit: self.max_requests,
            });
        }
        recent.push_back(now);
        Ok(())
    }

    /// Requests from `source` still inside the window.
    pub fn occupancy(&self, source: &str) -> usize {
        self.occupancy_at(source, Instant::now())
    }

    pub fn occupancy_at(&self, source: &str, now: Instant) -> usize {
        match self.sources.get(source) {
            Some(entry) => {
                let mut recent = entry.lock();
                self.prune(&mut recent, now);
                recent.len()
            }
            None => 0,
        }
    }

    fn prune(&self, recent: &mut VecDeque<Instant>, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(&front) = recent.front() {
            if front <= cutoff {
                recent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limit() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.try_acquire_at("binance", now).is_ok());
        }
        assert_eq!(limiter.occupancy_at("binance", now), 3);
    }

    #[test]
    fn test_exceeds_limit() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        for _ in 0..3 {
            limiter.try_acquire_at("binance", now).unwrap();
        }
        let err = limiter.try_acquire_at("binance", now).unwrap_err();
        assert!(matches!(err, OmsError::RateLimited { current: 3, limit: 3, .. }));
        assert_eq!(err.code(), "rate_limited");
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        limiter.try_acquire_at("binance", now).unwrap();
        assert!(limiter.try_acquire_at("bybit", now).is_ok());
        assert!(limiter.try_acquire_at("binance", now).is_err());
    }

    #[test]
    fn test_old_requests_slide_out() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 2);
        let start = Instant::now();
        limiter.try_acquire_at("binance", start).unwrap();
        limiter
            .try_acquire_at("binance", start + Duration::from_secs(30))
            .unwrap();
        assert!(limiter
            .try_acquire_at("binance", start + Duration::from_secs(59))
            .is_err());
        // The first request leaves the window at exactly +60s.
        assert!(limiter
            .try_acquire_at("binance", start + Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_rejected_requests_do_not_count() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1), 1);
        let now = Instant::now();
        limiter.try_acquire_at("s", now).unwrap();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at("s", now).is_err());
        }
        assert_eq!(limiter.occupancy_at("s", now), 1);
        assert_eq!(limiter.occupancy_at("unknown", now), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        use std::sync::Arc;

        let limiter = Arc::new(SlidingWindowLimiter::new(Duration::from_secs(60), 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.try_acquire("shared").is_ok()).count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
