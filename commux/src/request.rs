//! Worker-local request memory pool.
//!
//! Fixed-size elements (request header plus the context-configured
//! trailer), cache-line aligned, allocated in chunks of 128 and never
//! returned to the allocator. The pool is unbounded: an allocation failure
//! is heap exhaustion, a process invariant violation, and aborts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::endpoint::Endpoint;

/// Elements added per pool growth.
const CHUNK_ELEMS: usize = 128;

bitflags! {
    /// Request state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// The operation this request tracks has completed.
        const COMPLETED = 1 << 0;
        /// Ownership was handed back to the pool.
        const RELEASED = 1 << 1;
    }
}

/// Pooled element: header fields plus the opaque trailer protocols use.
#[repr(align(64))]
struct RequestSlot {
    flags: RequestFlags,
    reply_ep: Option<Endpoint>,
    trailer: Box<[u8]>,
}

struct PoolInner {
    free: Mutex<Vec<Box<RequestSlot>>>,
    trailer_len: usize,
    total: AtomicUsize,
}

impl PoolInner {
    fn grow(&self) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..CHUNK_ELEMS {
            free.push(Box::new(RequestSlot {
                flags: RequestFlags::empty(),
                reply_ep: None,
                trailer: vec![0u8; self.trailer_len].into_boxed_slice(),
            }));
        }
        self.total.fetch_add(CHUNK_ELEMS, Ordering::Relaxed);
    }
}

/// The pool. Allocation paths run under the worker lock; release may come
/// from whichever thread drops the request last.
pub(crate) struct RequestPool {
    inner: Arc<PoolInner>,
}

impl RequestPool {
    /// Create the pool with one chunk eagerly allocated.
    pub(crate) fn new(trailer_len: usize) -> Self {
        let inner = Arc::new(PoolInner {
            free: Mutex::new(Vec::new()),
            trailer_len,
            total: AtomicUsize::new(0),
        });
        inner.grow();
        Self { inner }
    }

    /// Take a request from the pool, growing when empty. Never fails: the
    /// pool is unbounded, so the only failure mode is heap exhaustion,
    /// which aborts the process.
    pub(crate) fn alloc(&self) -> Request {
        let slot = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let mut slot = slot.unwrap_or_else(|| {
            self.inner.grow();
            self.inner
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop()
                .expect("pool grew by a full chunk")
        });
        slot.flags = RequestFlags::empty();
        slot.reply_ep = None;
        Request {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Elements currently free.
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.inner.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Elements ever created.
    #[cfg(test)]
    pub(crate) fn total(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }
}

/// One in-flight request. Returns to the pool on drop.
pub struct Request {
    slot: Option<Box<RequestSlot>>,
    pool: Arc<PoolInner>,
}

impl Request {
    /// Current state flags.
    pub fn flags(&self) -> RequestFlags {
        self.slot.as_ref().expect("live request").flags
    }

    /// Mark the tracked operation complete.
    pub fn set_completed(&mut self) {
        self.slot.as_mut().expect("live request").flags |= RequestFlags::COMPLETED;
    }

    /// Endpoint replies travel on, when bound.
    pub fn reply_ep(&self) -> Option<&Endpoint> {
        self.slot.as_ref().expect("live request").reply_ep.as_ref()
    }

    pub(crate) fn set_reply_ep(&mut self, ep: Endpoint) {
        self.slot.as_mut().expect("live request").reply_ep = Some(ep);
    }

    /// Protocol-private trailer bytes.
    pub fn trailer_mut(&mut self) -> &mut [u8] {
        &mut self.slot.as_mut().expect("live request").trailer
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.flags = RequestFlags::RELEASED;
            slot.reply_ep = None;
            self.pool
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_chunk_and_growth() {
        let pool = RequestPool::new(32);
        assert_eq!(pool.total(), CHUNK_ELEMS);
        assert_eq!(pool.available(), CHUNK_ELEMS);

        let held: Vec<_> = (0..CHUNK_ELEMS + 1).map(|_| pool.alloc()).collect();
        assert_eq!(pool.total(), 2 * CHUNK_ELEMS);
        drop(held);
        assert_eq!(pool.available(), 2 * CHUNK_ELEMS);
    }

    #[test]
    fn test_trailer_sized_by_config() {
        let pool = RequestPool::new(48);
        let mut req = pool.alloc();
        assert_eq!(req.trailer_mut().len(), 48);
        req.trailer_mut()[47] = 0xff;
    }

    #[test]
    fn test_flags_reset_on_reuse() {
        let pool = RequestPool::new(0);
        let mut req = pool.alloc();
        req.set_completed();
        drop(req);

        let req = pool.alloc();
        assert_eq!(req.flags(), RequestFlags::empty());
    }
}
