//! Capability records and flag sets describing transport resources.
//!
//! Every opened interface reports an [`IfaceAttr`] once at open time; the
//! worker caches these records in a dense array indexed by resource and
//! consults them for handler installation, wakeup aggregation and atomic
//! resource selection.

use bitflags::bitflags;

/// Dense index naming a (transport, device) pair within a context.
pub type RscIndex = u8;

/// Sentinel for "no resource selected".
pub const NULL_RESOURCE: RscIndex = RscIndex::MAX;

bitflags! {
    /// Interface capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfaceFlags: u64 {
        /// Short (inline, header + tiny payload) active messages.
        const AM_SHORT = 1 << 0;
        /// Buffered-copy active messages.
        const AM_BCOPY = 1 << 1;
        /// Zero-copy active messages.
        const AM_ZCOPY = 1 << 2;
        /// Active-message callbacks may run synchronously from `progress`.
        const AM_CB_SYNC = 1 << 3;
        /// Active-message callbacks may run from a transport-owned thread.
        const AM_CB_ASYNC = 1 << 4;
        /// Short one-sided put.
        const PUT_SHORT = 1 << 5;
        /// Buffered-copy put.
        const PUT_BCOPY = 1 << 6;
        /// Zero-copy put.
        const PUT_ZCOPY = 1 << 7;
        /// Buffered-copy get.
        const GET_BCOPY = 1 << 8;
        /// Zero-copy get.
        const GET_ZCOPY = 1 << 9;
        /// 32-bit atomic add.
        const ATOMIC_ADD32 = 1 << 10;
        /// 64-bit atomic add.
        const ATOMIC_ADD64 = 1 << 11;
        /// 32-bit atomic fetch-and-add.
        const ATOMIC_FADD32 = 1 << 12;
        /// 64-bit atomic fetch-and-add.
        const ATOMIC_FADD64 = 1 << 13;
        /// 32-bit atomic swap.
        const ATOMIC_SWAP32 = 1 << 14;
        /// 64-bit atomic swap.
        const ATOMIC_SWAP64 = 1 << 15;
        /// 32-bit atomic compare-and-swap.
        const ATOMIC_CSWAP32 = 1 << 16;
        /// 64-bit atomic compare-and-swap.
        const ATOMIC_CSWAP64 = 1 << 17;
        /// Atomics execute on the host CPU.
        const ATOMIC_CPU = 1 << 18;
        /// Atomics execute on the device.
        const ATOMIC_DEVICE = 1 << 19;
        /// Interface exposes a wakeup event descriptor.
        const WAKEUP = 1 << 20;
        /// Endpoints connect to a remote interface address.
        const CONNECT_TO_IFACE = 1 << 21;
        /// Endpoints connect to a remote endpoint address.
        const CONNECT_TO_EP = 1 << 22;
    }
}

bitflags! {
    /// Features an application enables on a context.
    ///
    /// An AM id is active on a worker iff its handler record's feature mask
    /// intersects the context feature set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Active messages.
        const AM = 1 << 0;
        /// One-sided remote memory access.
        const RMA = 1 << 1;
        /// 32-bit atomic operations.
        const AMO32 = 1 << 2;
        /// 64-bit atomic operations.
        const AMO64 = 1 << 3;
        /// Event-driven blocking (get_efd / arm / wait / signal).
        const WAKEUP = 1 << 4;
    }
}

bitflags! {
    /// Event classes a wakeup handle can be armed for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeupEvents: u32 {
        /// Send completions.
        const TX_COMPLETION = 1 << 0;
        /// Active-message arrival.
        const RX_AM = 1 << 1;
        /// Signaled (urgent) active-message arrival.
        const RX_SIGNALED_AM = 1 << 2;
    }
}

/// Whether an AM handler runs on the progressing thread or a transport thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmCbFlags {
    /// Handler runs on the thread calling `Worker::progress`.
    Sync,
    /// Handler may run on a transport-owned thread.
    Async,
}

/// Size ceilings for one active-message operation class.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmCaps {
    /// Maximum payload of a short send (excluding the 8-byte header).
    pub max_short: usize,
    /// Maximum payload of a buffered-copy send.
    pub max_bcopy: usize,
    /// Maximum payload of a zero-copy send.
    pub max_zcopy: usize,
    /// Maximum scatter-gather entries for zero-copy.
    pub max_iov: usize,
    /// Maximum user header accompanying an active message.
    pub max_hdr: usize,
}

/// Size ceilings for one-sided operation classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmaCaps {
    /// Maximum short operation size.
    pub max_short: usize,
    /// Maximum buffered-copy operation size.
    pub max_bcopy: usize,
    /// Maximum zero-copy operation size.
    pub max_zcopy: usize,
}

/// Capability record of one opened interface.
#[derive(Debug, Clone)]
pub struct IfaceAttr {
    /// Supported operations.
    pub flags: IfaceFlags,
    /// Active-message limits.
    pub am: AmCaps,
    /// Put limits.
    pub put: RmaCaps,
    /// Get limits.
    pub get: RmaCaps,
    /// Below this size zero-copy is not worthwhile.
    pub min_zcopy: usize,
    /// Selection priority; higher wins ties.
    pub priority: u8,
    /// Fixed per-operation overhead, seconds.
    pub overhead: f64,
    /// Declared bandwidth, bytes per second.
    pub bandwidth: f64,
    /// One-way latency, seconds.
    pub latency: f64,
}

impl Default for IfaceAttr {
    fn default() -> Self {
        Self {
            flags: IfaceFlags::empty(),
            am: AmCaps::default(),
            put: RmaCaps::default(),
            get: RmaCaps::default(),
            min_zcopy: 0,
            priority: 0,
            overhead: 0.0,
            bandwidth: 0.0,
            latency: 0.0,
        }
    }
}

/// Immutable descriptor of one (transport, device) resource.
#[derive(Debug, Clone)]
pub struct TlResource {
    /// Transport name.
    pub tl_name: String,
    /// Device name within the transport.
    pub dev_name: String,
    /// Index of the owning memory domain in the context's domain list.
    pub md_index: usize,
}

impl std::fmt::Display for TlResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tl_name, self.dev_name)
    }
}

/// Memory-domain capability record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdAttr {
    /// The domain can register application memory for remote access.
    pub supports_reg: bool,
    /// Size of a packed remote key produced by this domain.
    pub rkey_packed_size: usize,
}

/// Policy for choosing which transports carry one-sided atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicMode {
    /// Enable every interface with host-side atomics.
    Cpu,
    /// Pick the best device-atomic interface and its device siblings.
    Device,
    /// `Device` if any interface has device atomics, else `Cpu`.
    Guess,
}

impl IfaceFlags {
    /// Flags required of a device-atomics candidate for the given features.
    pub fn atomic_set_for(features: Features) -> IfaceFlags {
        let mut flags = IfaceFlags::empty();
        if features.contains(Features::AMO32) {
            flags |= IfaceFlags::ATOMIC_ADD32
                | IfaceFlags::ATOMIC_FADD32
                | IfaceFlags::ATOMIC_SWAP32
                | IfaceFlags::ATOMIC_CSWAP32;
        }
        if features.contains(Features::AMO64) {
            flags |= IfaceFlags::ATOMIC_ADD64
                | IfaceFlags::ATOMIC_FADD64
                | IfaceFlags::ATOMIC_SWAP64
                | IfaceFlags::ATOMIC_CSWAP64;
        }
        flags
    }
}
