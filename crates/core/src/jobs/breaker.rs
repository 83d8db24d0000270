//! Sliding-window, ratio-based circuit breaker guarding the handler a
//! [`crate::jobs::executor::ReliableProcessor`] invokes per job (§4.6,
//! §8 property 8: never more than one in-flight job while OPEN, exactly
//! one while HALF_OPEN).
//!
//! State lives in the worker process, not in the durable queue store — a
//! restart resets the breaker to CLOSED rather than replaying history from
//! Redis. That's a deliberate simplification over a cache-backed breaker:
//! see the grounding ledger for the tradeoff.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the window that trips the breaker from CLOSED to OPEN.
    pub failure_threshold: f64,
    /// Minimum samples in the window before the ratio is evaluated at all.
    pub min_samples: usize,
    /// Number of most recent outcomes retained for the ratio calculation.
    pub window_size: usize,
    /// How long the breaker stays OPEN before allowing a single HALF_OPEN probe.
    pub open_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 10,
            window_size: 20,
            open_cooldown: Duration::from_millis(30_000),
        }
    }
}

impl From<&crate::config::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(config: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            min_samples: config.min_samples,
            window_size: config.window_size,
            open_cooldown: Duration::from_millis(config.open_cooldown_ms),
        }
    }
}

/// A permit handed out by [`CircuitBreaker::try_acquire`]. Callers must
/// report the outcome exactly once via [`CircuitBreaker::record_success`]
/// or [`CircuitBreaker::record_failure`].
pub struct Permit {
    was_probe: bool,
}

struct Inner {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Requests permission to dispatch a job. CLOSED always permits. OPEN
    /// rejects until `open_cooldown` has elapsed, at which point it
    /// transitions to HALF_OPEN and allows exactly one probe through; any
    /// further `try_acquire` calls while that probe is outstanding are
    /// rejected even though the state reads HALF_OPEN.
    pub fn try_acquire(&self) -> Result<Permit> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(Permit { was_probe: false }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(Permit { was_probe: true })
                } else {
                    Err(Error::circuit_open("circuit breaker is open"))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::circuit_open("circuit breaker half-open probe already in flight"))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Permit { was_probe: true })
                }
            }
        }
    }

    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.inner.lock().unwrap();
        if permit.was_probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.window.clear();
            inner.opened_at = None;
            return;
        }
        push_outcome(&mut inner.window, self.config.window_size, true);
    }

    pub fn record_failure(&self, permit: Permit) {
        let mut inner = self.inner.lock().unwrap();
        if permit.was_probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen {
            trip(&mut inner);
            return;
        }

        push_outcome(&mut inner.window, self.config.window_size, false);

        if inner.window.len() >= self.config.min_samples {
            let failures = inner.window.iter().filter(|success| !**success).count();
            let ratio = failures as f64 / inner.window.len() as f64;
            if ratio >= self.config.failure_threshold {
                trip(&mut inner);
            }
        }
    }
}

fn trip(inner: &mut Inner) {
    inner.state = CircuitState::Open;
    inner.opened_at = Some(Instant::now());
    inner.window.clear();
    inner.probe_in_flight = false;
}

fn push_outcome(window: &mut VecDeque<bool>, capacity: usize, success: bool) {
    if window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(success);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0.5,
            min_samples: 4,
            window_size: 10,
            open_cooldown: Duration::from_millis(20),
        })
    }

    #[test]
    fn trips_open_once_failure_ratio_crosses_threshold() {
        let cb = breaker();
        for _ in 0..3 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let permit = cb.try_acquire().unwrap();
        cb.record_failure(permit);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_while_open_until_cooldown_elapses() {
        let cb = breaker();
        for _ in 0..4 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn half_open_probe_success_closes_breaker() {
        let cb = breaker();
        for _ in 0..4 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        std::thread::sleep(Duration::from_millis(25));

        let probe = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(probe);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn only_one_probe_permitted_while_half_open() {
        let cb = breaker();
        for _ in 0..4 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        std::thread::sleep(Duration::from_millis(25));

        let _probe = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn half_open_probe_failure_reopens_breaker() {
        let cb = breaker();
        for _ in 0..4 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        std::thread::sleep(Duration::from_millis(25));

        let probe = cb.try_acquire().unwrap();
        cb.record_failure(probe);
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
