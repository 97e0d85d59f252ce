//! looptl - In-process loopback transport for the commux runtime.
//!
//! Interfaces exchange frames through process-global bounded FIFOs, so any
//! two workers in one process can talk regardless of which threads they
//! live on. Delivery is in arrival order per endpoint; a full peer queue
//! surfaces as transport back-pressure. Each interface owns a
//! receive-descriptor pool with headroom and a pipe-backed wakeup handle,
//! which makes the full worker wakeup pipeline (`get_efd`/`arm`/`wait`/
//! `signal`) exercisable without hardware. The driver itself runs no
//! threads: delivery is synchronous on the progressing thread, so the
//! async handle offered at open time goes unused.
//!
//! Devices are declared by the embedder with full control over the
//! advertised capability record, so resource-selection logic can be driven
//! through every branch.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, read, write};
use tracing::{debug, trace};

use commux::am::AM_ID_LAST;
use commux::{
    AmCaps, AmDesc, AmId, AmRecvCb, AmTraceType, AmTracerCb, DeviceDesc, Error, Iface, IfaceAttr,
    IfaceFlags, IfaceWakeup, MdAttr, OpenParams, RemoteKey, Result, RxPool, TlEndpoint, Transport,
    WakeupEvents,
};

/// Default receive-queue bound, frames.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Default receive-descriptor pool size, slots.
pub const DEFAULT_RX_POOL: usize = 512;

/// Default short-AM payload ceiling.
pub const DEFAULT_MAX_SHORT: usize = 256;

/// Default bcopy-AM payload ceiling.
pub const DEFAULT_MAX_BCOPY: usize = 64 * 1024;

/// One declared loopback device.
#[derive(Debug, Clone)]
pub struct LoopDevice {
    /// Device name, unique within the transport.
    pub name: String,
    /// Memory-domain index within the transport.
    pub md_index: usize,
    /// Advertised capability record.
    pub attr: IfaceAttr,
    /// Receive-queue bound.
    pub queue_depth: usize,
    /// Receive-descriptor pool size.
    pub rx_pool_size: usize,
}

impl LoopDevice {
    /// A device with the default loopback capabilities: short and bcopy
    /// active messages with sync callbacks, wakeup, connect-to-iface and
    /// CPU atomics.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            md_index: 0,
            attr: IfaceAttr {
                flags: IfaceFlags::AM_SHORT
                    | IfaceFlags::AM_BCOPY
                    | IfaceFlags::AM_CB_SYNC
                    | IfaceFlags::WAKEUP
                    | IfaceFlags::CONNECT_TO_IFACE
                    | IfaceFlags::ATOMIC_CPU
                    | IfaceFlags::ATOMIC_ADD32
                    | IfaceFlags::ATOMIC_ADD64
                    | IfaceFlags::ATOMIC_FADD32
                    | IfaceFlags::ATOMIC_FADD64
                    | IfaceFlags::ATOMIC_SWAP32
                    | IfaceFlags::ATOMIC_SWAP64
                    | IfaceFlags::ATOMIC_CSWAP32
                    | IfaceFlags::ATOMIC_CSWAP64,
                am: AmCaps {
                    max_short: DEFAULT_MAX_SHORT,
                    max_bcopy: DEFAULT_MAX_BCOPY,
                    max_zcopy: 0,
                    max_iov: 1,
                    max_hdr: 64,
                },
                min_zcopy: 0,
                priority: 10,
                overhead: 10e-9,
                bandwidth: 12e9,
                latency: 80e-9,
                ..Default::default()
            },
            queue_depth: DEFAULT_QUEUE_DEPTH,
            rx_pool_size: DEFAULT_RX_POOL,
        }
    }

    /// Replace the advertised flags.
    pub fn with_flags(mut self, flags: IfaceFlags) -> Self {
        self.attr.flags = flags;
        self
    }

    /// Set the selection priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.attr.priority = priority;
        self
    }

    /// Set the memory-domain index.
    pub fn with_md_index(mut self, md_index: usize) -> Self {
        self.md_index = md_index;
        self
    }

    /// Replace the whole capability record.
    pub fn with_attr(mut self, attr: IfaceAttr) -> Self {
        self.attr = attr;
        self
    }
}

/// One queued frame.
struct Frame {
    id: AmId,
    data: Vec<u8>,
}

/// Receiver side shared with senders through the process-global registry.
struct RxShared {
    queue: Mutex<VecDeque<Frame>>,
    depth: usize,
    /// Wakeup pipe: senders write, the receiving interface drains.
    pipe_r: OwnedFd,
    pipe_w: OwnedFd,
}

impl RxShared {
    /// Enqueue a frame, ringing the wakeup pipe. A full queue is
    /// back-pressure.
    fn push(&self, frame: Frame) -> Result<()> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.depth {
                return Err(Error::NoResource);
            }
            queue.push_back(frame);
        }
        match write(&self.pipe_w, &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn pop(&self) -> Option<Frame> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

fn registry() -> &'static Mutex<HashMap<u64, Arc<RxShared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<RxShared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_IFACE_KEY: AtomicU64 = AtomicU64::new(1);

/// The loopback transport driver.
pub struct LoopTransport {
    name: String,
    devices: Vec<LoopDevice>,
}

impl LoopTransport {
    /// Build a driver over the given devices.
    pub fn new(devices: Vec<LoopDevice>) -> Self {
        Self {
            name: "loop".to_string(),
            devices,
        }
    }

    /// Override the transport name (for selector tests and multi-instance
    /// setups).
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

impl Transport for LoopTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn mds(&self) -> Vec<MdAttr> {
        let count = self
            .devices
            .iter()
            .map(|d| d.md_index + 1)
            .max()
            .unwrap_or(1);
        vec![
            MdAttr {
                supports_reg: true,
                rkey_packed_size: 20,
            };
            count
        ]
    }

    fn devices(&self) -> Vec<DeviceDesc> {
        self.devices
            .iter()
            .map(|d| DeviceDesc {
                name: d.name.clone(),
                md_index: d.md_index,
            })
            .collect()
    }

    fn open_iface(&self, dev_name: &str, params: &OpenParams) -> Result<Box<dyn Iface>> {
        let device = self
            .devices
            .iter()
            .find(|d| d.name == dev_name)
            .ok_or(Error::NoDevice)?;

        let (pipe_r, pipe_w) = pipe2(OFlag::O_NONBLOCK)?;
        let shared = Arc::new(RxShared {
            queue: Mutex::new(VecDeque::new()),
            depth: device.queue_depth,
            pipe_r,
            pipe_w,
        });

        let key = NEXT_IFACE_KEY.fetch_add(1, Ordering::Relaxed);
        registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&shared));

        let max_payload = device.attr.am.max_bcopy.max(8 + device.attr.am.max_short);
        debug!(dev = dev_name, key, headroom = params.rx_headroom, "opened loop iface");
        if !params.cpu_mask.is_empty() {
            trace!(cores = params.cpu_mask.len(), "cpu mask noted; loopback runs no threads");
        }
        if params.async_handle.is_some() {
            trace!("async handle noted; loopback delivers synchronously");
        }

        Ok(Box::new(LoopIface {
            attr: device.attr.clone(),
            key,
            shared,
            handlers: Mutex::new((0..AM_ID_LAST).map(|_| None).collect()),
            tracer: Mutex::new(None),
            pool: RxPool::new(device.rx_pool_size, params.rx_headroom, max_payload),
        }))
    }

    fn rkey_pack(&self, rkey: &RemoteKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.extend_from_slice(&(rkey.md_index as u32).to_le_bytes());
        out.extend_from_slice(&rkey.base.to_le_bytes());
        out.extend_from_slice(&rkey.key.to_le_bytes());
        out
    }

    fn rkey_unpack(&self, buf: &[u8]) -> Result<RemoteKey> {
        if buf.len() != 20 {
            return Err(Error::InvalidParam("bad remote key length"));
        }
        Ok(RemoteKey {
            md_index: u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize,
            base: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            key: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// One opened loopback interface.
struct LoopIface {
    attr: IfaceAttr,
    key: u64,
    shared: Arc<RxShared>,
    handlers: Mutex<Vec<Option<AmRecvCb>>>,
    tracer: Mutex<Option<AmTracerCb>>,
    pool: Arc<RxPool>,
}

impl Iface for LoopIface {
    fn query(&self) -> IfaceAttr {
        self.attr.clone()
    }

    fn set_am_handler(&self, id: AmId, cb: AmRecvCb) -> Result<()> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let slot = handlers
            .get_mut(id as usize)
            .ok_or(Error::InvalidParam("AM id out of range"))?;
        *slot = Some(cb);
        Ok(())
    }

    fn set_am_tracer(&self, cb: AmTracerCb) -> Result<()> {
        *self.tracer.lock().unwrap_or_else(|e| e.into_inner()) = Some(cb);
        Ok(())
    }

    fn wakeup_open(&self, events: WakeupEvents) -> Result<Box<dyn IfaceWakeup>> {
        if !self.attr.flags.contains(IfaceFlags::WAKEUP) {
            return Err(Error::Unsupported("interface has no wakeup"));
        }
        trace!(key = self.key, ?events, "opened iface wakeup");
        Ok(Box::new(LoopWakeup {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn ep_create(&self) -> Result<Box<dyn TlEndpoint>> {
        Ok(Box::new(LoopEp {
            target: None,
            max_short: self.attr.am.max_short,
            max_bcopy: self.attr.am.max_bcopy,
        }))
    }

    fn iface_addr(&self) -> Vec<u8> {
        self.key.to_le_bytes().to_vec()
    }

    fn progress(&self) -> usize {
        let mut count = 0;
        loop {
            // Receive back-pressure: leave frames queued while every
            // descriptor slot is out with a handler.
            if self.pool.available() == 0 {
                break;
            }
            let Some(frame) = self.shared.pop() else { break };

            if tracing::enabled!(tracing::Level::TRACE) {
                if let Some(tracer) = self
                    .tracer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                {
                    let mut line = String::new();
                    tracer(AmTraceType::Recv, frame.id, &frame.data, &mut line);
                    if !line.is_empty() {
                        trace!(id = frame.id, "{}", line);
                    }
                }
            }

            let desc = self
                .pool
                .alloc_desc(frame.id, &frame.data)
                .expect("slot checked above");
            let handler = self
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(frame.id as usize)
                .and_then(|h| h.clone());
            match handler {
                Some(cb) => cb(desc),
                // No handler installed for this id: drop the frame.
                None => drop(desc),
            }
            count += 1;
        }
        count
    }

    fn flush(&self) -> Result<()> {
        // Sends complete synchronously at enqueue time.
        Ok(())
    }

    fn rx_pool_avail(&self) -> Option<usize> {
        Some(self.pool.available())
    }
}

impl Drop for LoopIface {
    fn drop(&mut self) {
        registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Pipe-backed wakeup handle.
struct LoopWakeup {
    shared: Arc<RxShared>,
}

impl IfaceWakeup for LoopWakeup {
    fn efd(&self) -> RawFd {
        self.shared.pipe_r.as_raw_fd()
    }

    fn arm(&self, _events: WakeupEvents) -> Result<()> {
        // Drain first, then report pending frames: a frame enqueued after
        // the check rings the freshly-drained pipe, so nothing is lost.
        let mut buf = [0u8; 32];
        loop {
            match read(self.shared.pipe_r.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => return Err(Error::from(e)),
            }
        }
        if self.shared.is_empty() {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }
}

/// One loopback endpoint: a connected handle on a peer's receive queue.
struct LoopEp {
    target: Option<Arc<RxShared>>,
    max_short: usize,
    max_bcopy: usize,
}

impl LoopEp {
    fn target(&self) -> Result<&Arc<RxShared>> {
        self.target
            .as_ref()
            .ok_or(Error::InvalidParam("endpoint not connected"))
    }
}

impl TlEndpoint for LoopEp {
    fn connect(&mut self, remote: &[u8]) -> Result<()> {
        if remote.len() != 8 {
            return Err(Error::InvalidParam("bad loop iface address"));
        }
        let key = u64::from_le_bytes(remote.try_into().unwrap());
        let shared = registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or(Error::InvalidParam("unknown loop iface address"))?;
        self.target = Some(shared);
        Ok(())
    }

    fn ep_addr(&self) -> Vec<u8> {
        Vec::new()
    }

    fn am_short(&self, id: AmId, hdr: u64, data: &[u8]) -> Result<()> {
        if data.len() > self.max_short {
            return Err(Error::InvalidParam("short AM payload too large"));
        }
        let mut frame = Vec::with_capacity(8 + data.len());
        frame.extend_from_slice(&hdr.to_le_bytes());
        frame.extend_from_slice(data);
        self.target()?.push(Frame { id, data: frame })
    }

    fn am_bcopy(&self, id: AmId, pack: &mut dyn FnMut(&mut [u8]) -> usize) -> Result<usize> {
        let mut buf = vec![0u8; self.max_bcopy];
        let len = pack(&mut buf);
        if len > self.max_bcopy {
            return Err(Error::InvalidParam("bcopy AM payload too large"));
        }
        buf.truncate(len);
        self.target()?.push(Frame { id, data: buf })?;
        Ok(len)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
