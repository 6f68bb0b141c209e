use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with bounded uniform jitter:
/// `min(base * 2^retry_count, cap) + jitter`, `jitter in [0, jitter_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

pub fn base_backoff_delay(retry_count: u32, policy: &RetryPolicy) -> Duration {
    let exp = 2.0_f64.powi(retry_count.min(63) as i32);
    let raw = (policy.base_ms as f64) * exp;
    let bounded = raw.min(policy.cap_ms as f64).max(0.0);
    Duration::from_millis(bounded.round() as u64)
}

pub fn backoff_delay(retry_count: u32, policy: &RetryPolicy) -> Duration {
    let mut rng = rand::thread_rng();
    backoff_delay_with_rng(retry_count, policy, &mut rng)
}

pub fn backoff_delay_with_rng<R: Rng + ?Sized>(
    retry_count: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> Duration {
    let base = base_backoff_delay(retry_count, policy);
    let jitter_ms = if policy.jitter_ms == 0 {
        0
    } else {
        rng.gen_range(0..policy.jitter_ms)
    };
    base + Duration::from_millis(jitter_ms)
}
