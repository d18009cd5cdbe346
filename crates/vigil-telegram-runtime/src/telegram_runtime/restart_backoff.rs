use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_RESTART_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RESTART_MAX_DELAY_MS: u64 = 15_000;
pub const DEFAULT_RESTART_GROWTH_FACTOR: f64 = 1.5;
pub const DEFAULT_RESTART_JITTER_RATIO: f64 = 0.25;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Delay schedule for supervisor-level session restarts.
///
/// This governs restarts of a whole polling session and caps out quickly;
/// the much coarser retry window that rides out sleep/wake cycles lives
/// inside the transport client and must not be confused with this one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartBackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
    pub jitter_ratio: f64,
}

impl Default for RestartBackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RESTART_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RESTART_MAX_DELAY_MS,
            growth_factor: DEFAULT_RESTART_GROWTH_FACTOR,
            jitter_ratio: DEFAULT_RESTART_JITTER_RATIO,
        }
    }
}

impl RestartBackoffPolicy {
    /// Deterministic pre-jitter delay for `attempt` (numbering starts at 1).
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = (self.initial_delay_ms as f64) * self.growth_factor.powi(exponent);
        scaled.min(self.max_delay_ms as f64).round() as u64
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(apply_jitter(self.base_delay_ms(attempt), self.jitter_ratio))
    }
}

// Bounded jitter in [1 - ratio, 1 + ratio] of the deterministic delay.
fn apply_jitter(base_ms: u64, ratio: f64) -> u64 {
    if base_ms == 0 || ratio <= 0.0 {
        return base_ms;
    }
    let half_span = ((base_ms as f64) * ratio).round() as u64;
    if half_span == 0 {
        return base_ms;
    }
    let low = base_ms.saturating_sub(half_span);
    let span = half_span.saturating_mul(2);
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    low.saturating_add(mixed % span.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::{apply_jitter, RestartBackoffPolicy};

    #[test]
    fn base_delay_grows_per_attempt_and_caps() {
        let policy = RestartBackoffPolicy::default();
        assert_eq!(policy.base_delay_ms(1), 1_000);
        assert_eq!(policy.base_delay_ms(2), 1_500);
        assert_eq!(policy.base_delay_ms(3), 2_250);
        assert_eq!(policy.base_delay_ms(20), 15_000);
        assert_eq!(policy.base_delay_ms(63), 15_000);
    }

    #[test]
    fn unit_base_delay_is_monotonically_non_decreasing() {
        let policy = RestartBackoffPolicy::default();
        let mut previous = 0;
        for attempt in 1..=32 {
            let delay = policy.base_delay_ms(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            previous = delay;
        }
    }

    #[test]
    fn unit_first_attempt_delay_stays_within_jitter_bounds() {
        let policy = RestartBackoffPolicy::default();
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(1).as_millis() as u64;
            assert!(delay >= 750, "expected {delay} >= 750");
            assert!(delay <= 1_250, "expected {delay} <= 1250");
        }
    }

    #[test]
    fn unit_jittered_delay_never_exceeds_cap_plus_jitter() {
        let policy = RestartBackoffPolicy::default();
        for attempt in 1..=64 {
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            assert!(delay <= 18_750, "attempt {attempt}: {delay} > 18750");
        }
    }

    #[test]
    fn unit_zero_jitter_ratio_returns_the_base_delay() {
        assert_eq!(apply_jitter(4_000, 0.0), 4_000);
        let policy = RestartBackoffPolicy {
            jitter_ratio: 0.0,
            ..RestartBackoffPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 1_500);
    }
}
