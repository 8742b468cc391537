use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Returned by [`CircuitBreaker::acquire`] when the breaker refuses the
/// call without attempting the upstream. The retry loop treats it as
/// terminal for the current request.
#[derive(Debug, Error)]
#[error("circuit breaker is open")]
pub struct BreakerOpen;

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Counts are cleared at this cadence while closed.
    pub window: Duration,
    /// How long the breaker stays open before probing.
    pub cooldown: Duration,
    /// Minimum observed requests in the window before tripping.
    pub min_requests: u64,
    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
    /// Concurrent trial requests admitted while half-open.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            min_requests: 10,
            failure_ratio: 0.6,
            half_open_max: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    window_start: Instant,
    requests: u64,
    failures: u64,
    opened_at: Instant,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// Global circuit breaker wrapping upstream calls.
///
/// Closed: requests flow, counts accumulate per window, the breaker
/// trips when `requests >= min_requests` and the failure ratio reaches
/// `failure_ratio`. Open: calls fail fast for `cooldown`. Half-open: up
/// to `half_open_max` concurrent probes; one failure re-opens,
/// `half_open_max` successes close.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window_start: now,
                requests: 0,
                failures: 0,
                opened_at: now,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Admits one upstream attempt. The returned permit must be resolved
    /// with [`BreakerPermit::record`]; a permit dropped unresolved (the
    /// caller went away mid-flight) counts as a failure.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, BreakerOpen> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(BreakerOpen);
        };
        match inner.state {
            State::Closed => {
                if inner.window_start.elapsed() >= self.config.window {
                    inner.window_start = Instant::now();
                    inner.requests = 0;
                    inner.failures = 0;
                }
                inner.requests += 1;
                Ok(BreakerPermit::new(self))
            }
            State::Open => {
                if inner.opened_at.elapsed() < self.config.cooldown {
                    return Err(BreakerOpen);
                }
                inner.state = State::HalfOpen;
                inner.half_open_in_flight = 1;
                inner.half_open_successes = 0;
                Ok(BreakerPermit::new(self))
            }
            State::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max {
                    return Err(BreakerOpen);
                }
                inner.half_open_in_flight += 1;
                Ok(BreakerPermit::new(self))
            }
        }
    }

    fn resolve(&self, ok: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            State::Closed => {
                if !ok {
                    inner.failures += 1;
                    let ratio = inner.failures as f64 / inner.requests.max(1) as f64;
                    if inner.requests >= self.config.min_requests
                        && ratio >= self.config.failure_ratio
                    {
                        inner.state = State::Open;
                        inner.opened_at = Instant::now();
                    }
                }
            }
            State::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if ok {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max {
                        inner.state = State::Closed;
                        inner.window_start = Instant::now();
                        inner.requests = 0;
                        inner.failures = 0;
                    }
                } else {
                    inner.state = State::Open;
                    inner.opened_at = Instant::now();
                }
            }
            // A probe resolving after a sibling already re-opened.
            State::Open => {}
        }
    }
}

pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            resolved: false,
        }
    }

    pub fn record(mut self, ok: bool) {
        self.resolved = true;
        self.breaker.resolve(ok);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.resolve(false);
        }
    }
}
