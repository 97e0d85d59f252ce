//! Worker endpoints.
//!
//! An endpoint starts life either *wired* (bound to a connected transport
//! endpoint) or as a *stub* created for replying to a peer the wire-up
//! handshake has not reached yet. Stubs queue outgoing operations; the
//! wire-up protocol hands over the connected transport endpoint, possibly
//! from a transport-owned thread, and the switch happens on the main
//! thread during worker progress. Wired endpoints also queue when the
//! transport reports back-pressure, and the queue drains on the next
//! progress pump, so transport back-pressure never surfaces to callers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::am::AmId;
use crate::caps::RscIndex;
use crate::error::{Error, Result};
use crate::transport::TlEndpoint;
use crate::worker::WorkerCore;

enum PendingOp {
    AmShort { id: AmId, hdr: u64, data: Vec<u8> },
    AmBcopy { id: AmId, frame: Vec<u8> },
}

struct WiredState {
    rsc_index: RscIndex,
    tl_ep: Box<dyn TlEndpoint>,
}

enum EpState {
    /// Placeholder awaiting wire-up; `ready` is filled by the handshake and
    /// consumed on the main thread.
    Stub { ready: Option<WiredState> },
    Wired(WiredState),
}

pub(crate) struct EndpointInner {
    worker: Weak<WorkerCore>,
    dest_uuid: u64,
    config_index: AtomicU8,
    state: Mutex<EpState>,
    pending: Mutex<VecDeque<PendingOp>>,
}

/// Handle to one endpoint. Cheap to clone; all clones are the same
/// endpoint. Sendable so the wire-up protocol can promote from its own
/// thread.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn new_stub(worker: Weak<WorkerCore>, dest_uuid: u64) -> Self {
        debug!(dest_uuid, "created stub endpoint");
        Self {
            inner: Arc::new(EndpointInner {
                worker,
                dest_uuid,
                config_index: AtomicU8::new(0),
                state: Mutex::new(EpState::Stub { ready: None }),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub(crate) fn new_wired(
        worker: Weak<WorkerCore>,
        dest_uuid: u64,
        rsc_index: RscIndex,
        tl_ep: Box<dyn TlEndpoint>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                worker,
                dest_uuid,
                config_index: AtomicU8::new(0),
                state: Mutex::new(EpState::Wired(WiredState { rsc_index, tl_ep })),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Unique id of the remote worker this endpoint targets.
    pub fn dest_uuid(&self) -> u64 {
        self.inner.dest_uuid
    }

    /// True while the endpoint still queues for wire-up.
    pub fn is_stub(&self) -> bool {
        matches!(*self.state(), EpState::Stub { .. })
    }

    /// Index into the worker's endpoint-configuration table.
    pub fn config_index(&self) -> u8 {
        self.inner.config_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_config_index(&self, index: u8) {
        self.inner.config_index.store(index, Ordering::Relaxed);
    }

    /// Resource the endpoint sends on, once wired.
    pub fn rsc_index(&self) -> Option<RscIndex> {
        match &*self.state() {
            EpState::Wired(wired) => Some(wired.rsc_index),
            EpState::Stub { .. } => None,
        }
    }

    /// Operations queued for wire-up or back-pressure retry.
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Send a short active message: 8-byte header plus payload.
    ///
    /// Queues while the endpoint is a stub, while earlier operations are
    /// queued (per-endpoint order is preserved) or when the transport
    /// reports back-pressure; queued operations retry on the next worker
    /// progress pump.
    pub fn am_short(&self, id: AmId, hdr: u64, data: &[u8]) -> Result<()> {
        self.submit(PendingOp::AmShort {
            id,
            hdr,
            data: data.to_vec(),
        })
    }

    /// Send a buffered-copy active message.
    pub fn am_bcopy(&self, id: AmId, data: &[u8]) -> Result<()> {
        self.submit(PendingOp::AmBcopy {
            id,
            frame: data.to_vec(),
        })
    }

    /// Complete outstanding operations. [`Error::Busy`] while operations
    /// are still queued locally; progress the worker and retry.
    pub fn flush(&self) -> Result<()> {
        if !self.pending().is_empty() {
            return Err(Error::Busy);
        }
        match &*self.state() {
            EpState::Wired(wired) => wired.tl_ep.flush(),
            EpState::Stub { .. } => Err(Error::Busy),
        }
    }

    /// Hand over the connected transport endpoint for a stub.
    ///
    /// Called by the wire-up protocol from whichever thread completed the
    /// handshake; the actual switch and queue drain run on the main thread
    /// during worker progress.
    pub fn promote(&self, rsc_index: RscIndex, tl_ep: Box<dyn TlEndpoint>) -> Result<()> {
        match &mut *self.state() {
            EpState::Stub { ready } => {
                if ready.is_some() {
                    return Err(Error::InvalidParam("endpoint already promoted"));
                }
                *ready = Some(WiredState { rsc_index, tl_ep });
            }
            EpState::Wired(_) => return Err(Error::InvalidParam("endpoint already wired")),
        }
        self.track();
        Ok(())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EpState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingOp>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, op: PendingOp) -> Result<()> {
        // Anything already queued forces queueing to preserve order.
        if !self.pending().is_empty() || self.is_stub() {
            self.enqueue(op);
            return Ok(());
        }

        match self.try_send(&op) {
            Ok(()) => Ok(()),
            Err(Error::NoResource) => {
                self.enqueue(op);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(&self, op: PendingOp) {
        self.pending().push_back(op);
        self.track();
    }

    fn try_send(&self, op: &PendingOp) -> Result<()> {
        let state = self.state();
        let wired = match &*state {
            EpState::Wired(wired) => wired,
            EpState::Stub { .. } => return Err(Error::NoResource),
        };
        match op {
            PendingOp::AmShort { id, hdr, data } => wired.tl_ep.am_short(*id, *hdr, data),
            PendingOp::AmBcopy { id, frame } => {
                let len = frame.len();
                wired
                    .tl_ep
                    .am_bcopy(*id, &mut |buf: &mut [u8]| {
                        buf[..len].copy_from_slice(frame);
                        len
                    })
                    .map(|_| ())
            }
        }
    }

    /// Register with the worker's pending-endpoint list so the next
    /// progress pump reaches [`Endpoint::progress`].
    fn track(&self) {
        if let Some(worker) = self.inner.worker.upgrade() {
            worker.stub_ep_add(self.clone());
        }
    }

    /// Main-thread progression: apply a pending promotion, then drain the
    /// queue in order. Returns true when nothing is left to do.
    pub(crate) fn progress(&self) -> bool {
        // Promotion first, so drained operations use the new transport.
        {
            let mut state = self.state();
            if let EpState::Stub { ready } = &mut *state {
                if let Some(wired) = ready.take() {
                    trace!(dest_uuid = self.inner.dest_uuid, "promoting stub endpoint");
                    *state = EpState::Wired(wired);
                }
            }
        }

        if self.is_stub() {
            return false;
        }

        loop {
            let op = match self.pending().pop_front() {
                Some(op) => op,
                None => return true,
            };
            match self.try_send(&op) {
                Ok(()) => {}
                Err(Error::NoResource) => {
                    self.pending().push_front(op);
                    return false;
                }
                Err(e) => {
                    // Nothing upstream can handle a failed queued send;
                    // drop the operation and keep the endpoint usable.
                    debug!(dest_uuid = self.inner.dest_uuid, error = %e, "queued send failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("dest_uuid", &self.inner.dest_uuid)
            .field("stub", &self.is_stub())
            .field("pending", &self.pending_len())
            .finish()
    }
}
