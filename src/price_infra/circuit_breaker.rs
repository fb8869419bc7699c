use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use serde::Serialize;
use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::MetricsCollector;
use crate::utils::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_attempts: u32,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_attempts: u32,
    half_open_epoch: u64,
}

/// Probe slot held while a half-open call is in flight. Dropping it
/// unsettled (the call future was abandoned) hands the slot back.
struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    settled: bool,
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe(self.epoch);
        }
    }
}

/// Generic guard around an async dependency.
///
/// The breaker never holds its lock across the guarded future, so one
/// instance can be shared by any number of tasks.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_probes: u32,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_max_probes: config.half_open_max_probes.max(1),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_attempts: 0,
                half_open_epoch: 0,
            }),
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` unless the circuit rejects it. Errors from the
    /// operation are returned unchanged after being counted.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.try_acquire()?.map(|epoch| ProbePermit {
            breaker: self,
            epoch,
            settled: false,
        });

        let result = operation().await;
        if let Some(permit) = permit.as_mut() {
            permit.settled = true;
        }

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let now = self.clock.now();
        let guard = self.state.lock();
        let retry_after_ms = match guard.state {
            CircuitState::Open => Some(self.remaining(&guard, now).as_millis() as u64),
            _ => None,
        };
        BreakerStats {
            name: self.name.clone(),
            state: guard.state,
            failure_count: guard.failure_count,
            half_open_attempts: guard.half_open_attempts,
            retry_after_ms,
        }
    }

    /// Operator override: close the circuit and forget past failures.
    pub fn reset(&self) {
        let mut guard = self.state.lock();
        guard.failure_count = 0;
        guard.half_open_attempts = 0;
        guard.last_failure = None;
        self.transition(&mut guard, CircuitState::Closed);
    }

    /// Returns the half-open epoch when the call is admitted as a probe.
    fn try_acquire(&self) -> Result<Option<u64>> {
        let now = self.clock.now();
        let mut guard = self.state.lock();

        if guard.state == CircuitState::Open {
            let remaining = self.remaining(&guard, now);
            if !remaining.is_zero() {
                return Err(self.open_error(remaining));
            }
            guard.half_open_attempts = 0;
            guard.half_open_epoch = guard.half_open_epoch.wrapping_add(1);
            self.transition(&mut guard, CircuitState::HalfOpen);
        }

        if guard.state == CircuitState::HalfOpen {
            if guard.half_open_attempts >= self.half_open_max_probes {
                return Err(self.open_error(self.recovery_timeout));
            }
            guard.half_open_attempts += 1;
            tracing::debug!(
                "Circuit breaker '{}' admitting probe {}/{}",
                self.name, guard.half_open_attempts, self.half_open_max_probes
            );
            return Ok(Some(guard.half_open_epoch));
        }

        Ok(None)
    }

    fn release_probe(&self, epoch: u64) {
        let mut guard = self.state.lock();
        if guard.state == CircuitState::HalfOpen && guard.half_open_epoch == epoch {
            guard.half_open_attempts = guard.half_open_attempts.saturating_sub(1);
            tracing::debug!("Circuit breaker '{}' probe abandoned, slot released", self.name);
        }
    }

    fn on_success(&self) {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::HalfOpen => {
                guard.failure_count = 0;
                guard.half_open_attempts = 0;
                self.transition(&mut guard, CircuitState::Closed);
            }
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            // A probe finishing after a sibling probe already reopened the circuit
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        guard.failure_count = guard.failure_count.saturating_add(1);
        guard.last_failure = Some(now);

        match guard.state {
            CircuitState::HalfOpen => {
                guard.half_open_attempts = 0;
                self.transition(&mut guard, CircuitState::Open);
            }
            CircuitState::Closed if guard.failure_count >= self.failure_threshold => {
                self.transition(&mut guard, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn remaining(&self, guard: &BreakerState, now: Instant) -> Duration {
        match guard.last_failure {
            Some(at) => self.recovery_timeout.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        if guard.state == to {
            return;
        }
        let from = guard.state;
        guard.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                "Circuit breaker '{}' {} -> {} after {} failures, retry in {:?}",
                self.name, from.as_str(), to.as_str(), guard.failure_count, self.recovery_timeout
            ),
            _ => tracing::info!(
                "Circuit breaker '{}' {} -> {}",
                self.name, from.as_str(), to.as_str()
            ),
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(&self.name, to.as_str());
        }
    }
}
