//! Controllable time for deterministic tests

use async_trait::async_trait;
use parking_lot::Mutex;
use ra_core::{Clock, Timestamp};
use std::time::Duration;

/// Clock that starts at a fixed time and only moves on [`advance`](Self::advance),
/// [`set`](Self::set) or a [`sleep`](Clock::sleep)
///
/// Sleeping advances the clock by the requested duration and yields once, so a poll loop
/// reaches its deadline without real time passing.
#[derive(Debug)]
pub struct ControllableClock {
    current: Mutex<Timestamp>,
}

impl ControllableClock {
    /// Create a clock reading `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self {
            current: Mutex::new(Timestamp(start_ms)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current = *current + by;
    }

    /// Set the absolute time
    pub fn set(&self, to: Timestamp) {
        *self.current.lock() = to;
    }
}

#[async_trait]
impl Clock for ControllableClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_set() {
        let clock = ControllableClock::new(1_000);
        assert_eq!(clock.now(), Timestamp(1_000));
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), Timestamp(3_000));
        clock.set(Timestamp(10));
        assert_eq!(clock.now(), Timestamp(10));
    }

    #[tokio::test]
    async fn test_sleep_advances_instead_of_waiting() {
        let clock = ControllableClock::new(0);
        clock.sleep(Duration::from_secs(3_600)).await;
        assert_eq!(clock.now(), Timestamp(3_600_000));
    }
}
