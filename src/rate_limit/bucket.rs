use super::config::BucketConfig;
use super::Decision;

/// Token bucket state machine.
///
/// Holds `tokens` in `[0, capacity]` and the timestamp of the last refill.
/// Carries no lock and no clock; callers pass both the config and "now" in,
/// and must serialize access themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    /// A full bucket as of `now_nanos`.
    pub fn full(config: &BucketConfig, now_nanos: u64) -> Self {
        Self { tokens: f64::from(config.capacity()), last_refill: now_nanos }
    }

    /// Currently stored tokens (fractional), as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> u64 {
        self.last_refill
    }

    /// Credit tokens for the time since the last refill.
    ///
    /// A reading earlier than `last_refill` counts as zero elapsed time, and
    /// `last_refill` never moves backwards, so a clock that steps back cannot
    /// make the same interval count twice.
    pub fn refill(&mut self, config: &BucketConfig, now_nanos: u64) {
        let elapsed = now_nanos.saturating_sub(self.last_refill);
        let capacity = f64::from(config.capacity());
        self.tokens = (self.tokens + config.refill_amount(elapsed)).min(capacity);
        self.last_refill = self.last_refill.max(now_nanos);
    }

    /// Refill, then take one whole token if available.
    pub fn try_acquire(&mut self, config: &BucketConfig, now_nanos: u64) -> Decision {
        self.refill(config, now_nanos);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::Allowed { remaining: self.tokens.floor() as u32 }
        } else {
            Decision::Denied { retry_after: config.time_to_restore(1.0 - self.tokens) }
        }
    }

    /// Tokens that would be available at `now_nanos`, without mutating state.
    pub fn available(&self, config: &BucketConfig, now_nanos: u64) -> f64 {
        let mut probe = self.clone();
        probe.refill(config, now_nanos);
        probe.tokens
    }

    /// True once a refill at `now_nanos` would top the bucket off. Dropping such
    /// a bucket and recreating it full later is indistinguishable from keeping it.
    pub fn is_saturated(&self, config: &BucketConfig, now_nanos: u64) -> bool {
        self.available(config, now_nanos) >= f64::from(config.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn burst_then_reject() {
        let cfg = BucketConfig::per_minute(20, 10.0).unwrap();
        let mut bucket = TokenBucket::full(&cfg, 0);
        for n in (0..20).rev() {
            assert_eq!(bucket.try_acquire(&cfg, 0), Decision::Allowed { remaining: n });
        }
        assert_eq!(
            bucket.try_acquire(&cfg, 0),
            Decision::Denied { retry_after: Duration::from_secs(6) }
        );
    }

    #[test]
    fn fractional_tokens_do_not_admit() {
        let cfg = BucketConfig::per_second(1, 1.0).unwrap();
        let mut bucket = TokenBucket::full(&cfg, 0);
        assert!(bucket.try_acquire(&cfg, 0).is_allowed());
        let half = SEC / 2;
        match bucket.try_acquire(&cfg, half) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_millis(500)),
            other => panic!("expected denial, got {:?}", other),
        }
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);
        assert!(bucket.try_acquire(&cfg, SEC).is_allowed());
    }

    #[test]
    fn long_idle_never_exceeds_capacity() {
        let cfg = BucketConfig::per_second(3, 100.0).unwrap();
        let mut bucket = TokenBucket::full(&cfg, 0);
        bucket.refill(&cfg, 3_600 * SEC);
        assert_eq!(bucket.tokens(), 3.0);
        assert!(bucket.is_saturated(&cfg, 3_600 * SEC));
    }

    #[test]
    fn clock_stepping_back_is_clamped() {
        let cfg = BucketConfig::per_second(2, 1.0).unwrap();
        let mut bucket = TokenBucket::full(&cfg, 10 * SEC);
        assert!(bucket.try_acquire(&cfg, 10 * SEC).is_allowed());
        assert!(bucket.try_acquire(&cfg, 10 * SEC).is_allowed());

        // Earlier reading: no credit and the refill mark stays put.
        assert!(bucket.try_acquire(&cfg, 5 * SEC).is_denied());
        assert_eq!(bucket.last_refill(), 10 * SEC);
        assert_eq!(bucket.tokens(), 0.0);

        assert!(bucket.try_acquire(&cfg, 11 * SEC).is_allowed());
        assert!(bucket.try_acquire(&cfg, 11 * SEC).is_denied());
    }

    #[test]
    fn shrinking_capacity_clamps_on_next_refill() {
        let big = BucketConfig::per_second(10, 1.0).unwrap();
        let small = BucketConfig::per_second(2, 1.0).unwrap();
        let mut bucket = TokenBucket::full(&big, 0);
        bucket.refill(&small, 0);
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[test]
    fn available_does_not_mutate() {
        let cfg = BucketConfig::per_second(4, 1.0).unwrap();
        let mut bucket = TokenBucket::full(&cfg, 0);
        for _ in 0..4 {
            assert!(bucket.try_acquire(&cfg, 0).is_allowed());
        }
        assert_eq!(bucket.available(&cfg, 2 * SEC), 2.0);
        assert_eq!(bucket.tokens(), 0.0);
        assert!(!bucket.is_saturated(&cfg, 2 * SEC));
    }
}
