//! Endpoint configuration cache.
//!
//! Endpoints sharing the same selection key share one configuration record
//! and carry only a small index. The table is append-only and bounded: the
//! index is encoded into 8-bit endpoint fields, so exceeding the bound is a
//! programming error, not a recoverable condition.

use std::sync::Mutex;

use crate::caps::RscIndex;

/// Endpoint selection key: lane roles, the resource chosen for each role
/// and the thresholds the selection was made with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpConfigKey {
    /// Resource carrying active messages.
    pub am_lane: Option<RscIndex>,
    /// Resources carrying one-sided put/get, in preference order.
    pub rma_lanes: Vec<RscIndex>,
    /// Resources carrying atomic operations.
    pub amo_lanes: Vec<RscIndex>,
    /// Resource carrying the wire-up handshake.
    pub wireup_lane: Option<RscIndex>,
    /// Payload size above which zero-copy is preferred.
    pub zcopy_thresh: usize,
}

/// Derived per-key state populated by the per-configuration initializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpConfigDerived {
    /// Largest payload sent as a short AM on the am lane.
    pub max_am_short: usize,
    /// Largest payload sent as a buffered-copy AM on the am lane.
    pub max_am_bcopy: usize,
    /// Payload size above which sends switch from short to bcopy.
    pub bcopy_thresh: usize,
}

/// One cached configuration.
#[derive(Debug, Clone)]
pub struct EpConfig {
    /// The key this entry was created for.
    pub key: EpConfigKey,
    /// Derived sizes.
    pub derived: EpConfigDerived,
}

/// Bounded append-only configuration table. Entries never move or change
/// once inserted, so an index stays valid for the table's life; lookups
/// take a short internal lock.
pub(crate) struct EpConfigTable {
    entries: Mutex<Vec<EpConfig>>,
    max: usize,
}

impl EpConfigTable {
    pub(crate) fn new(max: usize) -> Self {
        debug_assert!(max <= u8::MAX as usize + 1);
        Self {
            entries: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Index of the entry equal to `key`, inserting (and running `init`)
    /// when absent. A returned index stays valid, and keeps comparing equal
    /// to `key`, for the life of the table.
    ///
    /// # Panics
    /// When the table is full. The bound is sized so that legitimate
    /// workloads cannot reach it; hitting it indicates a bug.
    pub(crate) fn get_or_insert<F>(&self, key: &EpConfigKey, init: F) -> u8
    where
        F: FnOnce(&EpConfigKey) -> EpConfigDerived,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = entries.iter().position(|e| e.key == *key) {
            return index as u8;
        }

        if entries.len() >= self.max {
            panic!("too many ep configurations: {}", entries.len());
        }

        let derived = init(key);
        entries.push(EpConfig {
            key: key.clone(),
            derived,
        });
        (entries.len() - 1) as u8
    }

    /// Entry for a previously returned index.
    pub(crate) fn get(&self, index: u8) -> EpConfig {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())[index as usize].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(am: RscIndex, thresh: usize) -> EpConfigKey {
        EpConfigKey {
            am_lane: Some(am),
            zcopy_thresh: thresh,
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_keys_share_index() {
        let table = EpConfigTable::new(8);
        let a = table.get_or_insert(&key(0, 100), |_| EpConfigDerived::default());
        let b = table.get_or_insert(&key(1, 100), |_| EpConfigDerived::default());
        let a2 = table.get_or_insert(&key(0, 100), |_| EpConfigDerived::default());

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).key, key(0, 100));
    }

    #[test]
    fn test_initializer_runs_once_per_key() {
        let table = EpConfigTable::new(8);
        let mut runs = 0;
        for _ in 0..3 {
            table.get_or_insert(&key(2, 0), |_| {
                runs += 1;
                EpConfigDerived {
                    max_am_short: 64,
                    ..Default::default()
                }
            });
        }
        assert_eq!(runs, 1);
        let idx = table.get_or_insert(&key(2, 0), |_| unreachable!());
        assert_eq!(table.get(idx).derived.max_am_short, 64);
    }

    #[test]
    #[should_panic(expected = "too many ep configurations")]
    fn test_overflow_is_fatal() {
        let table = EpConfigTable::new(2);
        for i in 0..3 {
            table.get_or_insert(&key(i, 0), |_| EpConfigDerived::default());
        }
    }
}
