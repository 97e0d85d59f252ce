//! Worker-local statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a worker accumulates over its life. Plain atomics so both
/// application threads and transport-owned threads can bump them.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Calls to `progress`.
    pub progress_calls: AtomicU64,
    /// Active messages dispatched to protocol handlers.
    pub am_rx: AtomicU64,
    /// Dispatches whose handler retained the descriptor.
    pub am_retained: AtomicU64,
    /// Frames dropped by the teardown drop handler.
    pub am_dropped: AtomicU64,
    /// Signals written to the self-pipe.
    pub signals: AtomicU64,
    /// Successful arm cycles.
    pub armed: AtomicU64,
    /// Events posted by transport threads through the async handle.
    pub async_events: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
