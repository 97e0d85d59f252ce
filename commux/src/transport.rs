//! Transport-driver contract.
//!
//! A driver exposes its devices through [`Transport`], opens [`Iface`]
//! instances on them, and hands received active messages to the worker as
//! owned [`AmDesc`] descriptors. Drivers may own threads: every contract
//! type is `Send + Sync`, and an interface opened with an
//! [`crate::worker::AsyncHandle`] in its [`OpenParams`] can deliver events
//! from those threads under the worker lock. The core never interprets
//! driver address bytes; interface and endpoint addresses travel as
//! length-prefixed opaque blobs (see [`crate::address`]).

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::am::{AmId, AmTraceType};
use crate::caps::{IfaceAttr, MdAttr, WakeupEvents};
use crate::error::{Error, Result};
use crate::worker::AsyncHandle;

/// One device a transport can open an interface on.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    /// Device name, unique within the transport.
    pub name: String,
    /// Index into the transport's memory-domain list.
    pub md_index: usize,
}

/// Parameters for opening an interface.
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    /// Bytes of private headroom preceding every delivered payload.
    pub rx_headroom: usize,
    /// CPU affinity for transport-owned progress threads, empty for none.
    pub cpu_mask: Vec<core_affinity::CoreId>,
    /// Entry point for transport-owned threads into the opening worker:
    /// events posted here run under the worker lock or are deferred to the
    /// next progress pump. `None` when the embedder opens interfaces
    /// directly, outside a worker.
    pub async_handle: Option<AsyncHandle>,
}

/// Remote-memory key in unpacked form.
///
/// The packed wire representation is transport-specific; only pack/unpack
/// round-tripping is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKey {
    /// Memory-domain index the key belongs to.
    pub md_index: usize,
    /// Base address of the registered region.
    pub base: u64,
    /// Domain-specific access key.
    pub key: u64,
}

/// A transport driver: a factory for interfaces on its devices.
pub trait Transport: Send + Sync {
    /// Transport name used by the resource registry and the `COMMUX_TLS`
    /// selector.
    fn name(&self) -> &str;

    /// Memory domains owned by this transport.
    fn mds(&self) -> Vec<MdAttr>;

    /// Devices an interface can be opened on.
    fn devices(&self) -> Vec<DeviceDesc>;

    /// Open an interface bound to `dev_name`.
    fn open_iface(&self, dev_name: &str, params: &OpenParams) -> Result<Box<dyn Iface>>;

    /// Pack a remote key into an opaque blob.
    fn rkey_pack(&self, rkey: &RemoteKey) -> Vec<u8>;

    /// Unpack a blob produced by [`Transport::rkey_pack`].
    fn rkey_unpack(&self, buf: &[u8]) -> Result<RemoteKey>;
}

/// Callback invoked by a driver for each received active message.
///
/// Installed per AM id by the worker; the descriptor is owned by the
/// callback from the moment of the call.
pub type AmRecvCb = Arc<dyn Fn(AmDesc) + Send + Sync>;

/// Callback rendering a one-line trace of an AM frame into `out`.
pub type AmTracerCb = Arc<dyn Fn(AmTraceType, AmId, &[u8], &mut String) + Send + Sync>;

/// One opened transport interface, owned exclusively by a worker.
pub trait Iface: Send + Sync {
    /// Capability record. Stable for the life of the interface.
    fn query(&self) -> IfaceAttr;

    /// Install the receive callback for one AM id, replacing any previous
    /// one. At most one callback per (interface, id) exists at any time.
    fn set_am_handler(&self, id: AmId, cb: AmRecvCb) -> Result<()>;

    /// Install the frame tracer, replacing any previous one.
    fn set_am_tracer(&self, cb: AmTracerCb) -> Result<()>;

    /// Open the wakeup handle. Only valid if the capability record carries
    /// `WAKEUP`.
    fn wakeup_open(&self, events: WakeupEvents) -> Result<Box<dyn IfaceWakeup>>;

    /// Create an unconnected endpoint on this interface.
    fn ep_create(&self) -> Result<Box<dyn TlEndpoint>>;

    /// Opaque interface address other processes connect to.
    fn iface_addr(&self) -> Vec<u8>;

    /// Drain pending events, invoking installed callbacks synchronously.
    /// Returns the number of events processed.
    fn progress(&self) -> usize;

    /// Complete all outstanding operations on this interface.
    fn flush(&self) -> Result<()>;

    /// Free receive-descriptor slots, when the transport exposes its pool.
    fn rx_pool_avail(&self) -> Option<usize> {
        None
    }
}

/// Per-interface wakeup handle.
pub trait IfaceWakeup: Send + Sync {
    /// OS descriptor that becomes readable when armed events fire.
    fn efd(&self) -> RawFd;

    /// Arm for the given event classes. Returns [`Error::Busy`] when events
    /// are already pending; the caller must re-progress instead of waiting.
    fn arm(&self, events: WakeupEvents) -> Result<()>;
}

/// One transport-level endpoint.
pub trait TlEndpoint: Send + Sync {
    /// Connect to a remote interface address.
    fn connect(&mut self, remote: &[u8]) -> Result<()>;

    /// Opaque endpoint address, for connect-to-ep transports.
    fn ep_addr(&self) -> Vec<u8>;

    /// Send a short active message: 8-byte header plus a tiny payload.
    fn am_short(&self, id: AmId, hdr: u64, data: &[u8]) -> Result<()>;

    /// Send a buffered-copy active message. `pack` writes the frame into
    /// the transport buffer and returns the packed length.
    fn am_bcopy(&self, id: AmId, pack: &mut dyn FnMut(&mut [u8]) -> usize) -> Result<usize>;

    /// Complete all outstanding operations on this endpoint.
    fn flush(&self) -> Result<()>;
}

/// Pool of receive-descriptor buffers shared by a driver's interface.
///
/// Each slot is `headroom + max_payload` bytes; the headroom is the
/// protocol's private scratch space preceding the payload. A slot leaves
/// the pool when wrapped into an [`AmDesc`] and returns when the descriptor
/// is released.
pub struct RxPool {
    free: Mutex<Vec<Box<[u8]>>>,
    headroom: usize,
    capacity: usize,
}

impl RxPool {
    /// Create a pool of `capacity` slots.
    pub fn new(capacity: usize, headroom: usize, max_payload: usize) -> Arc<Self> {
        let slot_size = headroom + max_payload;
        let free = (0..capacity)
            .map(|_| vec![0u8; slot_size].into_boxed_slice())
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            headroom,
            capacity,
        })
    }

    /// Slots currently in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total slots, in the pool or held by descriptors.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a slot, copy `payload` past the headroom and wrap it into a
    /// descriptor. `None` when the pool is empty (receive back-pressure).
    pub fn alloc_desc(self: &Arc<Self>, id: AmId, payload: &[u8]) -> Option<AmDesc> {
        let mut buf = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop()?;
        debug_assert!(self.headroom + payload.len() <= buf.len());
        buf[self.headroom..self.headroom + payload.len()].copy_from_slice(payload);
        Some(AmDesc {
            buf: Some(buf),
            headroom: self.headroom,
            len: payload.len(),
            id,
            pool: Arc::clone(self),
        })
    }

    fn put(&self, buf: Box<[u8]>) {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).push(buf);
    }
}

/// Owned receive descriptor handed to an AM handler.
///
/// The underlying slot stays out of the transport's receive pool until the
/// descriptor is released, by [`AmDesc::release`] or by drop.
pub struct AmDesc {
    buf: Option<Box<[u8]>>,
    headroom: usize,
    len: usize,
    id: AmId,
    pool: Arc<RxPool>,
}

impl AmDesc {
    /// AM id this frame was delivered for.
    pub fn am_id(&self) -> AmId {
        self.id
    }

    /// Received payload.
    pub fn data(&self) -> &[u8] {
        let buf = self.buf.as_ref().expect("released descriptor");
        &buf[self.headroom..self.headroom + self.len]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Protocol-private scratch bytes preceding the payload. Writing here
    /// never affects [`AmDesc::data`].
    pub fn headroom_mut(&mut self) -> &mut [u8] {
        let headroom = self.headroom;
        let buf = self.buf.as_mut().expect("released descriptor");
        &mut buf[..headroom]
    }

    /// Read-only view of the headroom.
    pub fn headroom(&self) -> &[u8] {
        let buf = self.buf.as_ref().expect("released descriptor");
        &buf[..self.headroom]
    }

    /// Return the slot to the transport's receive pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl Drop for AmDesc {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for AmDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmDesc")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("headroom", &self.headroom)
            .finish()
    }
}

/// Length-prefix a blob, the only framing the core applies to driver bytes.
pub fn pack_blob(out: &mut Vec<u8>, blob: &[u8]) {
    out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    out.extend_from_slice(blob);
}

/// Split one length-prefixed blob off the front of `buf`.
pub fn unpack_blob<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    if buf.len() < 4 {
        return Err(Error::InvalidParam("truncated address blob"));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Err(Error::InvalidParam("truncated address blob"));
    }
    let blob = &buf[4..4 + len];
    *buf = &buf[4 + len..];
    Ok(blob)
}
