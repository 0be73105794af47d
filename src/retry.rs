use std::time::Duration;

/// Bounded exponential backoff, used for the job pull loop and for polling
/// instance deletion operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub initial_interval_ms: i64,
    pub max_interval_ms: i64,
    pub backoff_factor: f64,
    pub randomize_interval: bool,
}

impl BackoffPolicy {
    /// A single attempt and no sleeping.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_interval_ms: 0,
            max_interval_ms: 0,
            backoff_factor: 1.0,
            randomize_interval: false,
        }
    }

    /// Deletion polling waits `base * 2^(n+1)` before poll `n + 1`, with
    /// `max_retries` waits before giving up.
    pub fn deletion_poll(max_retries: u32, base_ms: i64) -> Self {
        Self {
            max_attempts: max_retries + 1,
            initial_interval_ms: base_ms.saturating_mul(2),
            max_interval_ms: i64::MAX,
            backoff_factor: 2.0,
            randomize_interval: false,
        }
    }

    /// Delay to sleep after attempt `attempt` (0-based) failed, or `None` when
    /// that was the last attempt allowed. `seed` only matters when
    /// `randomize_interval` is set.
    pub fn delay_after(&self, attempt: u32, seed: i64) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }
        let ms = backoff_delay_ms(attempt, seed, self);
        Some(Duration::from_millis(ms.max(0) as u64))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            backoff_factor: 2.0,
            randomize_interval: false,
        }
    }
}

/// delay_n = initial * factor^n, optionally stretched by a deterministic
/// multiplier in [1, 2), capped at `max_interval_ms`.
pub fn backoff_delay_ms(attempt: u32, seed: i64, policy: &BackoffPolicy) -> i64 {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let mut delay =
        (policy.initial_interval_ms as f64 * policy.backoff_factor.powi(exponent)).round();
    if policy.randomize_interval {
        let mut state = (seed as u64) ^ ((attempt as u64) << 32);
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let frac = ((state >> 32) as f64) / (u32::MAX as f64);
        delay = (delay * (1.0 + frac)).round();
    }
    if delay >= policy.max_interval_ms as f64 {
        return policy.max_interval_ms;
    }
    delay as i64
}
