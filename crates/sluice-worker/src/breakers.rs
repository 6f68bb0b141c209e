use chrono::{DateTime, Utc};
use sluice_core::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-process set of circuit breakers, one per handler name. Breaker
/// state is deliberately local to the worker process; temporary
/// imbalance across a partially-open fleet is absorbed by the retry and
/// reaper layers.
pub struct BreakerSet {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow_call(&self, handler: &str, now: DateTime<Utc>) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        breakers
            .entry(handler.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .allow_call(now)
    }

    pub fn record_success(&self, handler: &str) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        if let Some(breaker) = breakers.get_mut(handler) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, handler: &str, now: DateTime<Utc>) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        breakers
            .entry(handler.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .record_failure(now);
    }

    pub fn state(&self, handler: &str) -> Option<BreakerState> {
        let breakers = self.breakers.lock().expect("breaker mutex poisoned");
        breakers.get(handler).map(CircuitBreaker::state)
    }
}
