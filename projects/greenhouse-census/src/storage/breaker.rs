use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failure fraction over the window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Calls recorded before the failure rate is trusted.
    pub minimum_calls: usize,
    pub window_size: usize,
    pub recovery_timeout_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 5,
            window_size: 20,
            recovery_timeout_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Rolling-window circuit breaker.
///
/// Closed: calls pass and outcomes are recorded. Open: calls are refused
/// until the recovery timeout elapses. Half-open: one trial call passes;
/// its outcome closes or re-opens the breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.recovery_timeout_secs.max(0.0))
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may proceed now.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout() {
                    tracing::info!("Circuit '{}' half-open, allowing a trial call", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::info!("Circuit '{}' closed after successful trial", self.name);
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            BreakerState::Closed => self.push(&mut inner, true),
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!("Circuit '{}' re-opened: trial call failed", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            BreakerState::Closed => {
                self.push(&mut inner, false);
                let calls = inner.window.len();
                let failures = inner.window.iter().filter(|ok| !**ok).count();
                let rate = failures as f64 / calls as f64;
                if calls >= self.config.minimum_calls && rate >= self.config.failure_rate_threshold {
                    tracing::warn!(
                        "Circuit '{}' opened: {} of {} recent calls failed",
                        self.name,
                        failures,
                        calls
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.window.clear();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn push(&self, inner: &mut Inner, ok: bool) {
        inner.window.push_back(ok);
        while inner.window.len() > self.config.window_size.max(1) {
            inner.window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(recovery: f64) -> BreakerConfig {
        BreakerConfig {
            recovery_timeout_secs: recovery,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let breaker = CircuitBreaker::new("s", quick(30.0));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_failure_rate_over_window() {
        let breaker = CircuitBreaker::new("s", quick(30.0));
        for _ in 0..10 {
            breaker.record_success();
        }
        for _ in 0..9 {
            breaker.record_failure();
        }
        // 9 of 19 failed
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_trial_closes_or_reopens() {
        let breaker = CircuitBreaker::new("s", quick(0.02));
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one trial at a time.
        assert!(!breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }
}
