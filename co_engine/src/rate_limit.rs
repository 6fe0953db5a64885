//! ABOUTME: Sliding-window rate counters shared by a channel's workers
//! ABOUTME: The defer decision is taken on the same locked snapshot as the slots

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sliding-window counter: at most `capacity` events per `window`.
///
/// `try_acquire` either takes all requested slots or none, returning how
/// long to wait before the window frees up.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity as usize,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Per-minute convenience constructor
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Take `n` slots, or report the time until the window frees up.
    ///
    /// All-or-nothing: a batch larger than the remaining capacity defers
    /// in full.
    pub fn try_acquire(&self, n: usize) -> Result<(), Duration> {
        let now = Instant::now();
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(e) => {
                warn!("Rate limit window lock poisoned: {}", e);
                e.into_inner()
            }
        };

        while let Some(front) = events.front() {
            if now.duration_since(*front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if n > self.capacity {
            // Larger than the whole window; admit capacity-sized chunks
            return Err(self.window);
        }

        if events.len() + n <= self.capacity {
            for _ in 0..n {
                events.push_back(now);
            }
            Ok(())
        } else {
            let retry_after = events
                .front()
                .map(|front| self.window.saturating_sub(now.duration_since(*front)))
                .unwrap_or(self.window);
            Err(retry_after)
        }
    }

    /// Slots currently taken in the window
    pub fn in_use(&self) -> usize {
        let now = Instant::now();
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(e) => e.into_inner(),
        };
        while let Some(front) = events.front() {
            if now.duration_since(*front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len()
    }
}

/// Per-user sliding windows (in-app channel)
#[derive(Debug)]
pub struct UserRateLimiter {
    capacity: u32,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl UserRateLimiter {
    pub fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            window: Duration::from_secs(60),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, user_id: &str, n: usize) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(e) => e.into_inner(),
        };

        // Opportunistic cleanup of fully-expired windows
        windows.retain(|_, events| {
            events
                .back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });

        let events = windows.entry(user_id.to_string()).or_default();
        while let Some(front) = events.front() {
            if now.duration_since(*front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() + n <= self.capacity as usize {
            for _ in 0..n {
                events.push_back(now);
            }
            Ok(())
        } else {
            let retry_after = events
                .front()
                .map(|front| self.window.saturating_sub(now.duration_since(*front)))
                .unwrap_or(self.window);
            Err(retry_after)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_capacity() {
        let window = SlidingWindow::new(3, Duration::from_secs(60));
        assert!(window.try_acquire(2).is_ok());
        assert!(window.try_acquire(1).is_ok());
        assert!(window.try_acquire(1).is_err());
        assert_eq!(window.in_use(), 3);
    }

    #[test]
    fn test_all_or_nothing() {
        let window = SlidingWindow::new(3, Duration::from_secs(60));
        assert!(window.try_acquire(2).is_ok());
        // Two slots requested, one free: nothing is taken
        assert!(window.try_acquire(2).is_err());
        assert_eq!(window.in_use(), 2);
        assert!(window.try_acquire(1).is_ok());
    }

    #[test]
    fn test_retry_after_bounded_by_window() {
        let window = SlidingWindow::new(1, Duration::from_secs(60));
        window.try_acquire(1).unwrap();
        let retry_after = window.try_acquire(1).unwrap_err();
        assert!(retry_after <= Duration::from_secs(60));
        assert!(retry_after > Duration::from_secs(59));
    }

    #[test]
    fn test_window_slides() {
        let window = SlidingWindow::new(1, Duration::from_millis(20));
        window.try_acquire(1).unwrap();
        assert!(window.try_acquire(1).is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(window.try_acquire(1).is_ok());
    }

    #[test]
    fn test_oversized_batch_defers_for_full_window() {
        let window = SlidingWindow::new(2, Duration::from_secs(60));
        let retry_after = window.try_acquire(5).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(60));
    }

    #[test]
    fn test_user_windows_are_independent() {
        let limiter = UserRateLimiter::per_minute(1);
        assert!(limiter.try_acquire("u1", 1).is_ok());
        assert!(limiter.try_acquire("u2", 1).is_ok());
        assert!(limiter.try_acquire("u1", 1).is_err());
    }
}
