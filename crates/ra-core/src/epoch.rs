//! Configuration epochs
//!
//! An epoch names one configuration generation of a partition. It is a pair of a data loss
//! number and a configuration number. The data loss number is bumped by the failover manager
//! when a quorum is lost and dominates the ordering; the configuration number carries the
//! primary change counter in its upper 32 bits and a minor change counter in the lower 32.
//!
//! Every inbound protocol message carries an epoch. A message whose epoch is strictly older
//! than the failover unit's current configuration epoch is stale.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const PRIMARY_MASK: i64 = !0xFFFF_FFFF;

/// Configuration generation of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    /// Incremented when the failover manager declares data loss
    pub data_loss_number: i64,
    /// Primary change counter (upper 32 bits) and minor counter (lower 32 bits)
    pub configuration_number: i64,
}

impl Epoch {
    /// Create an epoch from its raw parts
    pub const fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }

    /// Create an epoch from a data loss number, primary change counter and minor counter
    pub const fn from_parts(data_loss_number: i64, primary: i64, minor: i64) -> Self {
        Self::new(data_loss_number, (primary << 32) | (minor & 0xFFFF_FFFF))
    }

    /// The invalid sentinel epoch
    pub const fn invalid() -> Self {
        Self::new(0, 0)
    }

    /// Whether this is the invalid sentinel
    pub fn is_invalid(&self) -> bool {
        *self == Self::invalid()
    }

    /// Whether this is a real epoch
    pub fn is_valid(&self) -> bool {
        !self.is_invalid()
    }

    /// The epoch with the minor configuration counter cleared
    ///
    /// Two epochs with equal primary epochs describe the same primary.
    pub fn to_primary_epoch(&self) -> Self {
        Self::new(
            self.data_loss_number,
            self.configuration_number & PRIMARY_MASK,
        )
    }

    /// Whether both epochs belong to the same primary
    pub fn is_primary_epoch_equal(&self, other: &Epoch) -> bool {
        self.to_primary_epoch() == other.to_primary_epoch()
    }

    /// Whether an incoming epoch is strictly older than this one
    pub fn is_stale(&self, incoming: &Epoch) -> bool {
        incoming < self
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data_loss_number
            .cmp(&other.data_loss_number)
            .then(self.configuration_number.cmp(&other.configuration_number))
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.data_loss_number,
            self.configuration_number >> 32,
            self.configuration_number & 0xFFFF_FFFF
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_invalid_sentinel() {
        assert!(Epoch::invalid().is_invalid());
        assert!(Epoch::default().is_invalid());
        assert!(Epoch::from_parts(4, 1, 1).is_valid());
    }

    #[test]
    fn test_data_loss_dominates() {
        let before = Epoch::from_parts(1, 9, 9);
        let after = Epoch::from_parts(2, 1, 1);
        assert!(before < after);
        assert!(after.is_stale(&before));
        assert!(!before.is_stale(&after));
    }

    #[test]
    fn test_primary_epoch() {
        let a = Epoch::from_parts(4, 3, 1);
        let b = Epoch::from_parts(4, 3, 7);
        let c = Epoch::from_parts(4, 4, 0);
        assert!(a.is_primary_epoch_equal(&b));
        assert!(!a.is_primary_epoch_equal(&c));
        assert_eq!(b.to_primary_epoch(), Epoch::from_parts(4, 3, 0));
    }

    #[test]
    fn test_equal_epoch_is_not_stale() {
        let e = Epoch::from_parts(4, 3, 3);
        assert!(!e.is_stale(&e));
    }

    proptest! {
        #[test]
        fn prop_order_is_total_and_antisymmetric(
            a in (0i64..8, 0i64..8, 0i64..8),
            b in (0i64..8, 0i64..8, 0i64..8),
        ) {
            let x = Epoch::from_parts(a.0, a.1, a.2);
            let y = Epoch::from_parts(b.0, b.1, b.2);
            let forward = x.cmp(&y);
            prop_assert_eq!(forward.reverse(), y.cmp(&x));
            prop_assert_eq!(forward == Ordering::Equal, x == y);
            prop_assert_eq!(x.is_stale(&y), forward == Ordering::Greater);
        }
    }
}
