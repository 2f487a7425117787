//! Sliding-window rate limiters for chat egress.
//!
//! Each limiter tracks a pruned timestamp list plus a pause deadline set on
//! 429 responses. `wait_time` is the larger of the pause remainder and the
//! window remainder when the window is full; `acquire` sleeps it off.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    timestamps: VecDeque<Instant>,
    paused_until: Option<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(LimiterState {
                timestamps: VecDeque::new(),
                paused_until: None,
            }),
        }
    }

    /// Per-channel default: 5 requests / 5 s.
    pub fn per_channel() -> Self {
        Self::new(5, Duration::from_secs(5))
    }

    /// Global default: 50 requests / s.
    pub fn global() -> Self {
        Self::new(50, Duration::from_secs(1))
    }

    /// How long a caller must wait before the next request may proceed.
    pub fn wait_time(&self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    fn wait_time_at(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();

        let pause_wait = match state.paused_until {
            Some(until) if until > now => until - now,
            _ => {
                state.paused_until = None;
                Duration::ZERO
            }
        };

        while let Some(oldest) = state.timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }
        let window_wait = if state.timestamps.len() >= self.max_requests as usize {
            let oldest = *state.timestamps.front().expect("non-empty when full");
            self.window.saturating_sub(now.duration_since(oldest))
        } else {
            Duration::ZERO
        };

        pause_wait.max(window_wait)
    }

    /// Sleep until a slot is available.
    pub async fn acquire(&self) {
        loop {
            let wait = self.wait_time();
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Record one request at the current instant.
    pub fn record(&self) {
        self.state.lock().timestamps.push_back(Instant::now());
    }

    /// Back off for the given duration (429 handling).
    pub fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        state.paused_until = Some(match state.paused_until {
            Some(existing) if existing > deadline => existing,
            _ => deadline,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn under_limit_has_no_wait() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(5));
        limiter.record();
        limiter.record();
        assert!(limiter.wait_time().is_zero());
    }

    #[tokio::test]
    async fn full_window_forces_wait() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(5));
        limiter.record();
        limiter.record();
        let wait = limiter.wait_time();
        assert!(wait > Duration::from_secs(4), "got {wait:?}");
        assert!(wait <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn pause_dominates_when_longer() {
        let limiter = SlidingWindowLimiter::new(100, Duration::from_millis(10));
        limiter.pause(Duration::from_secs(30));
        let wait = limiter.wait_time();
        assert!(wait > Duration::from_secs(29));
    }

    #[tokio::test]
    async fn pause_never_shortens_an_existing_pause() {
        let limiter = SlidingWindowLimiter::new(100, Duration::from_millis(10));
        limiter.pause(Duration::from_secs(30));
        limiter.pause(Duration::from_secs(1));
        assert!(limiter.wait_time() > Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_through_window() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(100));
        limiter.record();
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn old_timestamps_expire_after_window() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(50));
        limiter.record();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.wait_time().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_expires() {
        let limiter = SlidingWindowLimiter::new(10, Duration::from_millis(50));
        limiter.pause(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.wait_time().is_zero());
    }
}
