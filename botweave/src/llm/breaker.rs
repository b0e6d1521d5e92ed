//! Per-bot circuit breaker.
//!
//! closed → (5 consecutive failures) → open → (30 s cooldown) → half-open →
//! (2 consecutive successes) → closed; any half-open failure reopens and the
//! cooldown restarts. Half-open admits one probe at a time. State is
//! process-local: the breaker protects this process's resources only.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub const FAILURE_THRESHOLD: u32 = 5;
pub const SUCCESS_THRESHOLD: u32 = 2;
pub const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_cooldown(COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Admission decision for one request. Returns the transition performed,
    /// if any (open → half-open happens here, when the cooldown elapses).
    pub fn admit(&self) -> (Admission, Option<BreakerState>) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => (Admission::Allow, None),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    (Admission::Allow, Some(BreakerState::HalfOpen))
                } else {
                    (Admission::Reject, None)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    (Admission::Reject, None)
                } else {
                    inner.probe_in_flight = true;
                    (Admission::Allow, None)
                }
            }
        }
    }

    pub fn record_success(&self) -> Option<BreakerState> {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= SUCCESS_THRESHOLD {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    Some(BreakerState::Closed)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn record_failure(&self) -> Option<BreakerState> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = FAILURE_THRESHOLD;
                Some(BreakerState::Open)
            }
            BreakerState::Open => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_times(b: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            assert_eq!(b.admit().0, Admission::Allow);
            b.record_failure();
        }
    }

    #[tokio::test]
    async fn opens_after_exactly_five_consecutive_failures() {
        let b = CircuitBreaker::new();
        fail_times(&b, 4);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.admit().0, Admission::Allow);
        let transition = b.record_failure();
        assert_eq!(transition, Some(BreakerState::Open));
        // sixth call is rejected immediately
        assert_eq!(b.admit().0, Admission::Reject);
    }

    #[tokio::test]
    async fn intervening_success_resets_the_count() {
        let b = CircuitBreaker::new();
        fail_times(&b, 4);
        b.record_success();
        fail_times(&b, 4);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_then_two_probe_successes_close() {
        let b = CircuitBreaker::new();
        fail_times(&b, 5);
        assert_eq!(b.admit().0, Admission::Reject);

        tokio::time::advance(COOLDOWN).await;
        let (admission, transition) = b.admit();
        assert_eq!(admission, Admission::Allow);
        assert_eq!(transition, Some(BreakerState::HalfOpen));
        assert_eq!(b.record_success(), None);
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert_eq!(b.admit().0, Admission::Allow);
        assert_eq!(b.record_success(), Some(BreakerState::Closed));
        assert_eq!(b.admit().0, Admission::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_cooldown() {
        let b = CircuitBreaker::new();
        fail_times(&b, 5);
        tokio::time::advance(COOLDOWN).await;
        assert_eq!(b.admit().0, Admission::Allow);
        assert_eq!(b.record_failure(), Some(BreakerState::Open));
        assert_eq!(b.admit().0, Admission::Reject);

        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(b.admit().0, Admission::Reject);
        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(b.admit().0, Admission::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_probe_at_a_time() {
        let b = CircuitBreaker::new();
        fail_times(&b, 5);
        tokio::time::advance(COOLDOWN).await;
        assert_eq!(b.admit().0, Admission::Allow);
        // probe in flight: concurrent request rejected
        assert_eq!(b.admit().0, Admission::Reject);
        b.record_success();
        assert_eq!(b.admit().0, Admission::Allow);
    }
}
