//! Sliding-window rate limiter for provider request throttling.
//!
//! Keeps the admission timestamps of the last 60 seconds. A request is
//! admitted only while the window holds fewer than `max_requests_per_minute`
//! entries, so no rolling 60-second interval ever sees more than the limit.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Length of the admission window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Slack added to computed waits so the oldest entry has left the window.
const WAIT_SLACK: Duration = Duration::from_millis(100);

// ============================================================================
// Clock
// ============================================================================

/// Time source for the limiter.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + offset
    }
}

// ============================================================================
// Rate Stats
// ============================================================================

/// Point-in-time limiter utilization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    /// Admissions in the current window
    pub current_rate: u32,
    pub max_rate: u32,
    /// current_rate / max_rate
    pub utilization: f64,
}

// ============================================================================
// Rate Limiter
// ============================================================================

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
    /// Name for logging
    name: String,
}

impl RateLimiter {
    /// Create a limiter backed by the system clock.
    ///
    /// A limit of zero is treated as one request per minute.
    pub fn new(name: impl Into<String>, max_requests_per_minute: u32) -> Self {
        Self::with_clock(name, max_requests_per_minute, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        max_requests_per_minute: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_requests = max_requests_per_minute.max(1);
        Self {
            max_requests,
            window: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
            clock,
            name: name.into(),
        }
    }

    /// Wait until a slot is free, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(
                        limiter = %self.name,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, waiting for window slot"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take a slot without waiting.
    ///
    /// On saturation returns how long until the oldest admission leaves the
    /// window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut window = self.lock_window();
        Self::evict(&mut window, now);

        if window.len() < self.max_requests as usize {
            window.push_back(now);
            return Ok(());
        }

        let oldest = window.front().copied().unwrap_or(now);
        let age = now.saturating_duration_since(oldest);
        Err(WINDOW.saturating_sub(age) + WAIT_SLACK)
    }

    pub fn current_rate(&self) -> u32 {
        let now = self.clock.now();
        let mut window = self.lock_window();
        Self::evict(&mut window, now);
        window.len() as u32
    }

    pub fn max_rate(&self) -> u32 {
        self.max_requests
    }

    pub fn utilization(&self) -> f64 {
        self.current_rate() as f64 / self.max_requests as f64
    }

    pub fn stats(&self) -> RateStats {
        let current_rate = self.current_rate();
        RateStats {
            current_rate,
            max_rate: self.max_requests,
            utilization: current_rate as f64 / self.max_requests as f64,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // The window holds plain timestamps; a poisoned lock still has a
        // consistent deque.
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = window.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared rate limiter that can be cloned.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Create a shared rate limiter.
pub fn shared_limiter(name: impl Into<String>, max_requests_per_minute: u32) -> SharedRateLimiter {
    Arc::new(RateLimiter::new(name, max_requests_per_minute))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manual(max: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock("test", max, clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_admits_up_to_limit() {
        let (_, limiter) = manual(3);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
        assert_eq!(limiter.current_rate(), 3);
    }

    #[test]
    fn test_wait_time_tracks_oldest_entry() {
        let (clock, limiter) = manual(2);
        limiter.try_acquire().unwrap();
        clock.advance(Duration::from_secs(20));
        limiter.try_acquire().unwrap();
        clock.advance(Duration::from_secs(10));

        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(30) + WAIT_SLACK);
    }

    #[test]
    fn test_slot_frees_after_window() {
        let (clock, limiter) = manual(1);
        limiter.try_acquire().unwrap();
        clock.advance(Duration::from_millis(59_999));
        assert!(limiter.try_acquire().is_err());
        clock.advance(Duration::from_millis(1));
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn test_stats() {
        let (_, limiter) = manual(4);
        limiter.try_acquire().unwrap();
        let stats = limiter.stats();
        assert_eq!(stats.current_rate, 1);
        assert_eq!(stats.max_rate, 4);
        assert!((stats.utilization - 0.25).abs() < 1e-9);
        assert!((limiter.utilization() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_zero_limit_becomes_one() {
        let limiter = RateLimiter::new("zero", 0);
        assert_eq!(limiter.max_rate(), 1);
    }

    #[tokio::test]
    async fn test_acquire_returns_when_slot_free() {
        let limiter = shared_limiter("fast", 10);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.current_rate(), 10);
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn test_concurrent_readers() {
        let limiter = Arc::new(RateLimiter::new("shared", 1_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _ = l.try_acquire();
                        let _ = l.utilization();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.current_rate(), 400);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_limit_in_any_window(
            max in 1u32..20,
            steps in proptest::collection::vec(0u64..5_000, 1..300),
        ) {
            let (clock, limiter) = manual(max);
            let mut elapsed_ms = 0u64;
            let mut admitted: Vec<u64> = Vec::new();

            for step in steps {
                clock.advance(Duration::from_millis(step));
                elapsed_ms += step;
                if limiter.try_acquire().is_ok() {
                    admitted.push(elapsed_ms);
                }
            }

            for (i, start) in admitted.iter().enumerate() {
                let in_window = admitted[i..]
                    .iter()
                    .take_while(|t| **t < start + 60_000)
                    .count();
                prop_assert!(in_window <= max as usize);
            }
        }
    }
}
