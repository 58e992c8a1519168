//! Node-wide pacing of messages to the FM

use parking_lot::Mutex;
use ra_core::{FailoverConfig, Timestamp};
use std::time::Duration;

/// Admission policy for one FM retry pass
pub trait Throttle: Send + Sync {
    /// How many entities may be sent at `now`
    fn count(&self, now: Timestamp) -> usize;

    /// Charge `sent` entities against the budget
    fn update(&self, sent: usize, now: Timestamp);
}

/// Constant budget per pass
#[derive(Debug, Clone, Copy)]
pub struct FixedThrottle(pub usize);

impl Throttle for FixedThrottle {
    fn count(&self, _now: Timestamp) -> usize {
        self.0
    }

    fn update(&self, _sent: usize, _now: Timestamp) {}
}

/// Token bucket refilled one token per interval, capped at the burst size
///
/// A zero interval disables pacing; the burst is then available on every pass.
#[derive(Debug)]
pub struct TokenBucketThrottle {
    capacity: u32,
    refill_interval: Duration,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Timestamp,
}

impl TokenBucketThrottle {
    /// Full bucket of `capacity` tokens
    pub fn new(capacity: u32, refill_interval: Duration, now: Timestamp) -> Self {
        Self {
            capacity,
            refill_interval,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Bucket sized by the FM throttle settings
    pub fn from_config(config: &FailoverConfig, now: Timestamp) -> Self {
        Self::new(
            config.fm_message_throttle_burst,
            config.per_node_minimum_interval_between_message_to_fm(),
            now,
        )
    }

    /// Tokens left after refilling up to `now`
    pub fn available_tokens(&self, now: Timestamp) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Timestamp) {
        if self.refill_interval.is_zero() {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
            return;
        }
        let interval_ms = u64::try_from(self.refill_interval.as_millis()).unwrap_or(u64::MAX);
        let elapsed_ms = now.saturating_since(bucket.last_refill).as_millis();
        let earned = u64::try_from(elapsed_ms).unwrap_or(u64::MAX) / interval_ms;
        if earned == 0 {
            return;
        }
        let earned_tokens = u32::try_from(earned).unwrap_or(u32::MAX);
        bucket.tokens = bucket.tokens.saturating_add(earned_tokens).min(self.capacity);
        // Keep the remainder so slow passes do not lose partial refills.
        bucket.last_refill = bucket.last_refill + Duration::from_millis(earned * interval_ms);
        if bucket.tokens == self.capacity {
            bucket.last_refill = now;
        }
    }
}

impl Throttle for TokenBucketThrottle {
    fn count(&self, now: Timestamp) -> usize {
        self.available_tokens(now) as usize
    }

    fn update(&self, sent: usize, now: Timestamp) {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        let cost = u32::try_from(sent).unwrap_or(u32::MAX);
        bucket.tokens = bucket.tokens.saturating_sub(cost);
    }
}
