//! The worker: one progress/scheduling domain multiplexing every selected
//! transport resource behind a single dispatch, wakeup and endpoint plane.
//!
//! A `Worker` handle is `Send + Sync`: in multi-threaded mode the
//! conditional lock serializes application threads against each other, and
//! transport-owned threads join the same discipline through the worker's
//! [`AsyncHandle`].

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use slab::Slab;
use tracing::{debug, trace};

use crate::am::{AmDisposition, AmId};
use crate::atomic::{select_atomic_tls, AtomicSelectInput};
use crate::caps::{AmCbFlags, Features, IfaceAttr, IfaceFlags, RscIndex};
use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::epconf::{EpConfigDerived, EpConfigKey, EpConfigTable};
use crate::error::Result;
use crate::request::{Request, RequestPool};
use crate::stats::WorkerStats;
use crate::transport::{AmRecvCb, AmTracerCb, Iface, OpenParams};
use crate::wakeup::{SignalHandle, WakeupState, ARM_EVENTS};

/// Private bytes preceding every delivered AM payload, reserved for the
/// receiving protocol.
pub const RX_HEADROOM: usize = 64;

/// Worker thread-safety mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// All worker calls originate from one thread; no lock.
    Single,
    /// Public worker operations are serialized by a lock.
    Multi,
}

/// Options accepted by [`Worker::create`]. Unset fields use the documented
/// defaults: single-threaded, empty CPU mask.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    /// Thread-safety mode.
    pub thread_mode: ThreadMode,
    /// CPU affinity for transport-owned callback threads.
    pub cpu_mask: Vec<core_affinity::CoreId>,
}

impl Default for WorkerParams {
    fn default() -> Self {
        Self {
            thread_mode: ThreadMode::Single,
            cpu_mask: Vec::new(),
        }
    }
}

/// Conditional lock guarding public worker operations. Shared with
/// transport threads through [`AsyncHandle`], so contention is real in
/// multi-threaded mode.
enum MtLock {
    None,
    Mutex(Mutex<()>),
    Spin(AtomicBool),
}

impl MtLock {
    fn new(mode: ThreadMode, use_mt_mutex: bool) -> Self {
        match mode {
            ThreadMode::Single => MtLock::None,
            ThreadMode::Multi if use_mt_mutex => MtLock::Mutex(Mutex::new(())),
            ThreadMode::Multi => MtLock::Spin(AtomicBool::new(false)),
        }
    }

    fn required(&self) -> bool {
        !matches!(self, MtLock::None)
    }

    fn lock(&self) -> MtGuard<'_> {
        match self {
            MtLock::None => MtGuard::None,
            MtLock::Mutex(mutex) => {
                MtGuard::Mutex(mutex.lock().unwrap_or_else(|e| e.into_inner()))
            }
            MtLock::Spin(flag) => {
                while flag
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
                MtGuard::Spin(flag)
            }
        }
    }

    /// Non-blocking acquisition for transport threads. `None` mode always
    /// fails: without a lock there is no way to exclude the owning thread,
    /// so async work must defer to the progress pump.
    fn try_lock(&self) -> Option<MtGuard<'_>> {
        match self {
            MtLock::None => None,
            MtLock::Mutex(mutex) => match mutex.try_lock() {
                Ok(guard) => Some(MtGuard::Mutex(guard)),
                Err(TryLockError::Poisoned(e)) => Some(MtGuard::Mutex(e.into_inner())),
                Err(TryLockError::WouldBlock) => None,
            },
            MtLock::Spin(flag) => flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
                .then(|| MtGuard::Spin(flag)),
        }
    }
}

enum MtGuard<'a> {
    None,
    Mutex(MutexGuard<'a, ()>),
    Spin(&'a AtomicBool),
}

impl Drop for MtGuard<'_> {
    fn drop(&mut self) {
        if let MtGuard::Spin(flag) = self {
            flag.store(false, Ordering::Release);
        }
    }
}

type MissedCb = Box<dyn FnOnce() + Send>;

/// Asynchronous-progress context, thread mode: transport threads deliver
/// events through it and the main thread observes whatever they could not
/// run inline during `progress`.
pub(crate) struct AsyncContext {
    block_count: AtomicU32,
    missed: Arc<Mutex<Vec<MissedCb>>>,
}

impl AsyncContext {
    fn new() -> Self {
        Self {
            block_count: AtomicU32::new(0),
            missed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn block(&self) -> AsyncBlockGuard<'_> {
        self.block_count.fetch_add(1, Ordering::AcqRel);
        AsyncBlockGuard { ctx: self }
    }

    fn queue(&self) -> Arc<Mutex<Vec<MissedCb>>> {
        Arc::clone(&self.missed)
    }

    /// Run work that arrived outside the progress path, unless a block
    /// guard is held.
    fn check_miss(&self) {
        if self.block_count.load(Ordering::Acquire) > 0 {
            return;
        }
        let cbs: Vec<MissedCb> =
            std::mem::take(&mut *self.missed.lock().unwrap_or_else(|e| e.into_inner()));
        for cb in cbs {
            cb();
        }
    }
}

pub(crate) struct AsyncBlockGuard<'a> {
    ctx: &'a AsyncContext,
}

impl Drop for AsyncBlockGuard<'_> {
    fn drop(&mut self) {
        self.ctx.block_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Entry point for transport-owned threads into a worker.
///
/// Cloneable and sendable; a driver receives it in
/// [`OpenParams`](crate::transport::OpenParams) and uses it from its
/// threads. Posted work contends on the same conditional lock as the
/// application threads: it runs inline when the lock is free, otherwise it
/// lands on the missed-event queue, a blocked waiter is signaled, and the
/// next `progress` pump runs it on the progressing thread.
#[derive(Clone)]
pub struct AsyncHandle {
    lock: Arc<MtLock>,
    missed: Arc<Mutex<Vec<MissedCb>>>,
    signal: SignalHandle,
    stats: Arc<WorkerStats>,
}

impl AsyncHandle {
    /// Deliver an event from a transport thread. Runs `f` immediately
    /// under the worker lock when it can be taken, else defers it.
    pub fn run_or_defer(&self, f: MissedCb) {
        WorkerStats::bump(&self.stats.async_events);
        match self.lock.try_lock() {
            Some(_guard) => f(),
            None => self.defer_inner(f),
        }
    }

    /// Queue an event for the next progress pump unconditionally and wake
    /// a blocked waiter.
    pub fn defer(&self, f: MissedCb) {
        WorkerStats::bump(&self.stats.async_events);
        self.defer_inner(f);
    }

    fn defer_inner(&self, f: MissedCb) {
        self.missed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(f);
        // A worker torn down with live handles has no pipe reader left;
        // the queued event is dropped with the worker either way.
        let _ = self.signal.signal();
    }
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("locked", &self.lock.required())
            .finish()
    }
}

/// Transport-level progress worker: a registry of progress callbacks run
/// on every pump.
struct TlWorker {
    callbacks: Mutex<Slab<Arc<dyn Fn() + Send + Sync>>>,
}

impl TlWorker {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Slab::new()),
        }
    }

    fn register(&self, cb: Arc<dyn Fn() + Send + Sync>) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cb)
    }

    fn unregister(&self, id: usize) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn dispatch(&self) {
        // Snapshot so callbacks may unregister themselves while running.
        let cbs: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in cbs {
            cb();
        }
    }
}

/// Monotonic part of worker uuid generation.
static UUID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn generate_uuid(seed: u64) -> u64 {
    let counter = UUID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = nix::unistd::getpid().as_raw() as u64;
    // splitmix64 over the combined seed.
    let mut z = seed ^ counter.rotate_left(32) ^ (pid << 16);
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Worker state. Fields are declared in teardown order: after the explicit
/// teardown steps in `Drop`, the remaining members fall in declaration
/// order.
pub(crate) struct WorkerCore {
    weak_self: Weak<WorkerCore>,
    context: Context,
    uuid: u64,
    name: String,
    mt_lock: Arc<MtLock>,
    inprogress: AtomicU32,
    destroyed: AtomicBool,

    reply_eps: Mutex<HashMap<u64, Endpoint>>,
    stub_eps: Mutex<Vec<Endpoint>>,
    stub_progress_id: Mutex<Option<usize>>,

    ifaces: Mutex<Vec<Option<Arc<dyn Iface>>>>,
    iface_attrs: Mutex<Vec<IfaceAttr>>,
    /// Per-interface bitmask of installed AM ids.
    am_installed: Mutex<Vec<u64>>,
    atomic_tls: AtomicU64,
    ep_config: EpConfigTable,

    req_pool: RequestPool,
    tl_worker: TlWorker,
    async_ctx: AsyncContext,
    wakeup: WakeupState,
    stats: Arc<WorkerStats>,
}

/// A worker handle. Cheap to clone and sendable; the worker is destroyed
/// when the last handle drops (or explicitly via [`Worker::destroy`]).
#[derive(Clone)]
pub struct Worker {
    core: Arc<WorkerCore>,
}

impl Worker {
    /// Create a worker over every resource of `context`.
    ///
    /// Construction follows a fixed order; any failure unwinds the steps
    /// completed so far in reverse.
    pub fn create(context: &Context, params: WorkerParams) -> Result<Worker> {
        let num_tls = context.num_tls();

        // Bound for the embedded configuration table: the index must fit
        // into 8-bit endpoint fields.
        let config_count = ((num_tls + 1) * (num_tls + 1) * num_tls).min(u8::MAX as usize);

        let mt_lock = Arc::new(MtLock::new(
            params.thread_mode,
            context.config().use_mt_mutex,
        ));

        let name = worker_name();
        let wakeup = WakeupState::new(num_tls)?;

        let core = Arc::new_cyclic(|weak: &Weak<WorkerCore>| WorkerCore {
            weak_self: weak.clone(),
            context: context.clone(),
            uuid: generate_uuid(Weak::as_ptr(weak) as usize as u64),
            name,
            mt_lock,
            inprogress: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            reply_eps: Mutex::new(HashMap::new()),
            stub_eps: Mutex::new(Vec::new()),
            stub_progress_id: Mutex::new(None),
            ifaces: Mutex::new((0..num_tls).map(|_| None).collect()),
            iface_attrs: Mutex::new(vec![IfaceAttr::default(); num_tls]),
            am_installed: Mutex::new(vec![0u64; num_tls]),
            atomic_tls: AtomicU64::new(0),
            ep_config: EpConfigTable::new(config_count),
            req_pool: RequestPool::new(context.config().request_trailer),
            tl_worker: TlWorker::new(),
            async_ctx: AsyncContext::new(),
            wakeup,
            stats: Arc::new(WorkerStats::default()),
        });

        // Open one interface per resource. On failure close what opened;
        // everything else unwinds through Drop.
        for rsc_index in 0..num_tls {
            if let Err(e) = core.add_iface(rsc_index as RscIndex, &params.cpu_mask) {
                core.close_ifaces();
                return Err(e);
            }
        }

        core.init_atomic_tls();

        debug!(uuid = core.uuid, name = %core.name, num_tls, "created worker");
        Ok(Worker { core })
    }

    /// Tear the worker down now. Equivalent to dropping the last handle.
    pub fn destroy(self) {
        drop(self);
    }

    /// Effective thread mode.
    pub fn query(&self) -> ThreadMode {
        if self.core.mt_lock.required() {
            ThreadMode::Multi
        } else {
            ThreadMode::Single
        }
    }

    /// Worker unique id.
    pub fn uuid(&self) -> u64 {
        self.core.uuid
    }

    /// Worker name, `host:pid`.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Number of transport resources, fixed at create.
    pub fn num_tls(&self) -> usize {
        self.core.lock_ifaces().len()
    }

    /// Resources selected to carry atomics, as a bitmask over `rsc_index`.
    pub fn atomic_tls(&self) -> u64 {
        self.core.atomic_tls.load(Ordering::Relaxed)
    }

    /// Statistics counters.
    pub fn stats(&self) -> &WorkerStats {
        &self.core.stats
    }

    /// Entry point transport threads use to post events into this worker;
    /// the same handle every interface received at open time.
    pub fn async_handle(&self) -> AsyncHandle {
        self.core.async_handle()
    }

    /// Capability record cached for one resource.
    pub fn iface_attr(&self, rsc_index: RscIndex) -> IfaceAttr {
        self.core.lock_attrs()[rsc_index as usize].clone()
    }

    /// True iff the interface advertised wakeup capability and its wakeup
    /// handle is open. The wakeup array is dense over `num_tls`.
    pub fn iface_has_wakeup(&self, rsc_index: RscIndex) -> bool {
        self.core.wakeup.has_iface_wakeup(rsc_index as usize)
    }

    /// Free receive-descriptor slots of one interface, when its transport
    /// exposes the pool.
    pub fn iface_rx_pool_avail(&self, rsc_index: RscIndex) -> Option<usize> {
        let iface = self.core.lock_ifaces()[rsc_index as usize].clone();
        iface.and_then(|iface| iface.rx_pool_avail())
    }

    /// Drain transport event queues, dispatching sync AM handlers and
    /// completion callbacks, then observe progress made on transport
    /// threads. Non-reentrant. Returns the number of events processed.
    pub fn progress(&self) -> usize {
        let _guard = self.core.mt_lock.lock();
        let core = &*self.core;

        assert_eq!(
            core.inprogress.swap(1, Ordering::AcqRel),
            0,
            "progress is not reentrant"
        );
        WorkerStats::bump(&core.stats.progress_calls);

        let mut count = 0;
        let ifaces: Vec<Arc<dyn Iface>> =
            core.lock_ifaces().iter().flatten().cloned().collect();
        for iface in &ifaces {
            count += iface.progress();
        }
        core.tl_worker.dispatch();
        core.async_ctx.check_miss();

        assert_eq!(
            core.inprogress.swap(0, Ordering::AcqRel),
            1,
            "progress is not reentrant"
        );
        count
    }

    /// The aggregating event descriptor, created on first call and stable
    /// afterwards.
    pub fn get_efd(&self) -> Result<RawFd> {
        let _guard = self.core.mt_lock.lock();
        self.core.wakeup.get_efd()
    }

    /// Arm every interface wakeup for `{tx-completion, rx-am,
    /// rx-signaled-am}` and drain the self-pipe. [`crate::Error::Busy`]
    /// means events are already pending: skip the wait and re-progress.
    pub fn arm(&self) -> Result<()> {
        let _guard = self.core.mt_lock.lock();
        self.core.wakeup.arm()?;
        WorkerStats::bump(&self.core.stats.armed);
        Ok(())
    }

    /// Block until at least one event is ready. A busy arm returns
    /// immediately with success.
    pub fn wait(&self) -> Result<()> {
        let _guard = self.core.mt_lock.lock();
        let num_tls = self.core.lock_ifaces().len();
        self.core.wakeup.wait(num_tls)
    }

    /// Wake a blocked [`Worker::wait`] from any thread.
    pub fn signal(&self) -> Result<()> {
        WorkerStats::bump(&self.core.stats.signals);
        self.core.wakeup.signal()
    }

    /// Sendable handle performing the same wake-up as [`Worker::signal`].
    pub fn signal_handle(&self) -> SignalHandle {
        self.core.wakeup.signal_handle()
    }

    /// Publish this worker's address: uuid, name and one opaque segment
    /// per open interface.
    pub fn get_address(&self) -> crate::address::WorkerAddress {
        let _guard = self.core.mt_lock.lock();
        let snapshot: Vec<(usize, Arc<dyn Iface>)> = self
            .core
            .lock_ifaces()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|iface| (i, Arc::clone(iface))))
            .collect();

        let mut segments = Vec::new();
        for (rsc_index, iface) in snapshot {
            let rsc = self.core.context.tl_rsc(rsc_index as RscIndex);
            segments.push(crate::address::AddressSegment {
                tl_name: rsc.tl_name.clone(),
                dev_name: rsc.dev_name.clone(),
                iface_addr: iface.iface_addr(),
            });
        }
        crate::address::WorkerAddress {
            uuid: self.core.uuid,
            name: self.core.name.clone(),
            segments,
        }
    }

    /// Release a published address. Addresses are owned values; this is
    /// the explicit counterpart of dropping one.
    pub fn release_address(&self, address: crate::address::WorkerAddress) {
        drop(address);
    }

    /// Connect to a published worker address.
    ///
    /// At most one endpoint exists per peer: an existing wired endpoint is
    /// returned as-is, and an existing stub (created by
    /// [`Worker::get_reply_ep`] before the handshake) is promoted in place,
    /// with the switch and queue drain happening on the next progress pump.
    /// Callable from whichever thread completes the handshake.
    pub fn connect(&self, address: &crate::address::WorkerAddress) -> Result<Endpoint> {
        let _async = self.core.async_ctx.block();

        let existing = self
            .core
            .lock_reply_eps()
            .get(&address.uuid)
            .cloned();
        if let Some(ep) = &existing {
            if !ep.is_stub() {
                debug!(dest_uuid = address.uuid, "found existing endpoint");
                return Ok(ep.clone());
            }
        }

        let (rsc_index, remote_addr) = self.core.select_am_lane(address)?;
        let iface = self.core.lock_ifaces()[rsc_index as usize]
            .clone()
            .expect("selected lane is open");
        let mut tl_ep = iface.ep_create()?;
        tl_ep.connect(&remote_addr)?;

        let ep = match existing {
            Some(stub) => {
                // A handshake already in flight keeps its endpoint; the
                // extra transport endpoint is simply discarded.
                if let Err(e) = stub.promote(rsc_index, tl_ep) {
                    debug!(dest_uuid = address.uuid, error = %e, "promotion already in flight");
                } else {
                    debug!(dest_uuid = address.uuid, rsc_index, "promoting stub endpoint");
                }
                stub
            }
            None => {
                let ep = Endpoint::new_wired(
                    self.core.weak_self.clone(),
                    address.uuid,
                    rsc_index,
                    tl_ep,
                );
                // Another thread may have connected to the same peer while
                // the transport endpoint was being built; the first entry
                // wins so the map stays one-endpoint-per-peer.
                let mut map = self.core.lock_reply_eps();
                match map.entry(address.uuid) {
                    std::collections::hash_map::Entry::Occupied(existing) => {
                        existing.get().clone()
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(ep.clone());
                        debug!(dest_uuid = address.uuid, rsc_index, "connected endpoint");
                        ep
                    }
                }
            }
        };
        ep.set_config_index(self.core.ep_config_for_lane(rsc_index));
        Ok(ep)
    }

    /// Endpoint for replying to `dest_uuid`, creating a stub when the
    /// wire-up handshake has not produced a connected endpoint yet. At most
    /// one endpoint per peer, whichever thread asks first.
    pub fn get_reply_ep(&self, dest_uuid: u64) -> Endpoint {
        let _async = self.core.async_ctx.block();

        let ep = {
            let mut map = self.core.lock_reply_eps();
            match map.entry(dest_uuid) {
                std::collections::hash_map::Entry::Occupied(existing) => {
                    debug!(dest_uuid, "found reply endpoint");
                    return existing.get().clone();
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    let ep = Endpoint::new_stub(self.core.weak_self.clone(), dest_uuid);
                    slot.insert(ep.clone());
                    ep
                }
            }
        };
        self.core.stub_ep_add(ep.clone());
        ep
    }

    /// Take a request from the pool and bind it to the reply endpoint for
    /// `dest_uuid`. Infallible: the pool is unbounded, its exhaustion is a
    /// process invariant violation and aborts.
    pub fn allocate_reply(&self, dest_uuid: u64) -> Request {
        let mut req = self.core.req_pool.alloc();
        req.set_reply_ep(self.get_reply_ep(dest_uuid));
        req
    }

    /// Index of the configuration entry equal to `key`, inserting it when
    /// new. Panics when the bounded table is full.
    pub fn get_ep_config(&self, key: &EpConfigKey) -> u8 {
        let core = &*self.core;
        core.ep_config.get_or_insert(key, |key| core.ep_config_init(key))
    }

    /// Configuration entries created so far.
    pub fn ep_config_count(&self) -> usize {
        self.core.ep_config.len()
    }

    /// Print a human-readable summary: name, packed address size and the
    /// atomics selection when atomic features are on.
    pub fn print_info(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let address = self.get_address();
        let _guard = self.core.mt_lock.lock();

        writeln!(out, "#")?;
        writeln!(out, "# commux worker '{}'", self.core.name)?;
        writeln!(out, "#")?;
        writeln!(out, "#                 address: {} bytes", address.pack().len())?;

        let features = self.core.context.config().features;
        if features.intersects(Features::AMO32 | Features::AMO64) {
            write!(out, "#                 atomics: ")?;
            let mut first = true;
            let atomic_tls = self.core.atomic_tls.load(Ordering::Relaxed);
            for rsc_index in 0..self.core.lock_ifaces().len() {
                if atomic_tls & (1u64 << rsc_index) != 0 {
                    if !first {
                        write!(out, ", ")?;
                    }
                    write!(
                        out,
                        "{}:{}",
                        rsc_index,
                        self.core.context.tl_rsc(rsc_index as RscIndex)
                    )?;
                    first = false;
                }
            }
            writeln!(out)?;
        }
        writeln!(out, "#")?;
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("uuid", &self.core.uuid)
            .field("name", &self.core.name)
            .field("num_tls", &self.core.lock_ifaces().len())
            .finish()
    }
}

impl WorkerCore {
    fn lock_ifaces(&self) -> MutexGuard<'_, Vec<Option<Arc<dyn Iface>>>> {
        self.ifaces.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_attrs(&self) -> MutexGuard<'_, Vec<IfaceAttr>> {
        self.iface_attrs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reply_eps(&self) -> MutexGuard<'_, HashMap<u64, Endpoint>> {
        self.reply_eps.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn async_handle(&self) -> AsyncHandle {
        AsyncHandle {
            lock: Arc::clone(&self.mt_lock),
            missed: self.async_ctx.queue(),
            signal: self.wakeup.signal_handle(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Open the interface for one resource: query its capabilities,
    /// install the active AM handlers and the tracer, and open the wakeup
    /// handle when supported.
    fn add_iface(&self, rsc_index: RscIndex, cpu_mask: &[core_affinity::CoreId]) -> Result<()> {
        let params = OpenParams {
            rx_headroom: RX_HEADROOM,
            cpu_mask: cpu_mask.to_vec(),
            async_handle: Some(self.async_handle()),
        };
        let iface: Arc<dyn Iface> = Arc::from(self.context.open_iface(rsc_index, &params)?);
        let attr = iface.query();

        if attr
            .flags
            .intersects(IfaceFlags::AM_SHORT | IfaceFlags::AM_BCOPY | IfaceFlags::AM_ZCOPY)
        {
            self.set_am_handlers(rsc_index, &*iface, &attr)?;
            self.set_am_tracer(&*iface)?;
        }

        if attr.flags.contains(IfaceFlags::WAKEUP) {
            let wakeup = iface.wakeup_open(ARM_EVENTS)?;
            self.wakeup.set_iface_wakeup(rsc_index as usize, wakeup);
        }

        debug!(
            rsc_index,
            rsc = %self.context.tl_rsc(rsc_index),
            "created interface"
        );

        self.lock_attrs()[rsc_index as usize] = attr;
        self.lock_ifaces()[rsc_index as usize] = Some(iface);
        Ok(())
    }

    /// Install every AM id whose feature mask intersects the context
    /// features and whose flags fit the interface. A sync handler is never
    /// installed on an interface without sync-callback support; the lane
    /// selection must not route such protocols there.
    fn set_am_handlers(
        &self,
        rsc_index: RscIndex,
        iface: &dyn Iface,
        attr: &IfaceAttr,
    ) -> Result<()> {
        let table = self.context.am_table();
        let features = self.context.config().features;

        for id in table.ids() {
            let entry = *table.get(id).expect("listed id");
            if !features.intersects(entry.features) {
                continue;
            }
            if entry.flags == AmCbFlags::Sync && !attr.flags.contains(IfaceFlags::AM_CB_SYNC) {
                continue;
            }

            let weak = self.weak_self.clone();
            let cb: AmRecvCb = Arc::new(move |desc| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let worker = Worker { core };
                WorkerStats::bump(&worker.core.stats.am_rx);
                match (entry.cb)(&worker, desc) {
                    AmDisposition::Consumed(desc) => desc.release(),
                    AmDisposition::Retained => {
                        WorkerStats::bump(&worker.core.stats.am_retained)
                    }
                }
            });
            iface.set_am_handler(id, cb)?;
            self.am_installed.lock().unwrap_or_else(|e| e.into_inner())[rsc_index as usize] |=
                1u64 << id;
        }
        Ok(())
    }

    /// Forwarding tracer: consults the per-id tracer, if any.
    fn set_am_tracer(&self, iface: &dyn Iface) -> Result<()> {
        let table = self.context.am_table();
        let weak = self.weak_self.clone();
        let cb: AmTracerCb = Arc::new(move |trace_type, id, data, out| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            if let Some(tracer) = table.get(id).and_then(|e| e.tracer) {
                let worker = Worker { core };
                tracer(&worker, trace_type, id, data, out);
            }
        });
        iface.set_am_tracer(cb)
    }

    /// Replace every installed handler with a dropping no-op, breaking the
    /// callback edges before any interface closes.
    fn remove_am_handlers(&self) {
        debug!(uuid = self.uuid, "remove active message handlers");
        let snapshot: Vec<(usize, Arc<dyn Iface>)> = self
            .lock_ifaces()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|iface| (i, Arc::clone(iface))))
            .collect();

        for (rsc_index, iface) in snapshot {
            let installed = self.am_installed.lock().unwrap_or_else(|e| e.into_inner())[rsc_index];
            for id in 0..crate::am::AM_ID_LAST as AmId {
                if installed & (1u64 << id) == 0 {
                    continue;
                }
                let weak = self.weak_self.clone();
                let drop_cb: AmRecvCb = Arc::new(move |desc| {
                    trace!("drop message");
                    if let Some(core) = weak.upgrade() {
                        WorkerStats::bump(&core.stats.am_dropped);
                    }
                    desc.release();
                });
                let _ = iface.set_am_handler(id, drop_cb);
            }
        }
    }

    fn close_ifaces(&self) {
        let closed: Vec<Arc<dyn Iface>> = {
            let mut ifaces = self.lock_ifaces();
            let mut closed = Vec::new();
            for (rsc_index, slot) in ifaces.iter_mut().enumerate() {
                if let Some(iface) = slot.take() {
                    self.wakeup.clear_iface_wakeup(rsc_index);
                    closed.push(iface);
                }
            }
            closed
        };
        drop(closed);
    }

    /// Run the atomic resource selector over the cached capability
    /// records.
    fn init_atomic_tls(&self) {
        let num_tls = self.lock_ifaces().len();
        let rscs: Vec<_> = (0..num_tls)
            .map(|i| self.context.tl_rsc(i as RscIndex).clone())
            .collect();
        let mds: Vec<_> = rscs
            .iter()
            .map(|r| *self.context.md_attr(r.md_index))
            .collect();
        // Remap the dense copy so md indices stay aligned.
        let rscs_local: Vec<_> = rscs
            .iter()
            .enumerate()
            .map(|(i, r)| crate::caps::TlResource {
                tl_name: r.tl_name.clone(),
                dev_name: r.dev_name.clone(),
                md_index: i,
            })
            .collect();

        let attrs = self.lock_attrs();
        let input = AtomicSelectInput {
            features: self.context.config().features,
            mode: self.context.config().atomic_mode,
            rscs: &rscs_local,
            mds: &mds,
            attrs: &attrs,
        };
        self.atomic_tls
            .store(select_atomic_tls(&input), Ordering::Relaxed);
    }

    /// Pick the resource carrying active messages to a peer: the best
    /// (priority, bandwidth) interface whose transport also appears in the
    /// peer's address.
    fn select_am_lane(
        &self,
        address: &crate::address::WorkerAddress,
    ) -> Result<(RscIndex, Vec<u8>)> {
        let attrs = self.lock_attrs();
        let mut best: Option<(RscIndex, Vec<u8>, u8, f64)> = None;

        for (rsc_index, attr) in attrs.iter().enumerate() {
            if !attr
                .flags
                .contains(IfaceFlags::AM_BCOPY | IfaceFlags::CONNECT_TO_IFACE)
            {
                continue;
            }
            let rsc = self.context.tl_rsc(rsc_index as RscIndex);
            let Some(segment) = address.segment_for(&rsc.tl_name) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, _, priority, bandwidth)) => {
                    attr.priority > *priority
                        || (attr.priority == *priority && attr.bandwidth > *bandwidth)
                }
            };
            if better {
                best = Some((
                    rsc_index as RscIndex,
                    segment.iface_addr.clone(),
                    attr.priority,
                    attr.bandwidth,
                ));
            }
        }

        best.map(|(rsc, addr, _, _)| (rsc, addr))
            .ok_or(crate::error::Error::Unsupported(
                "no common transport with peer",
            ))
    }

    /// Build and intern the configuration for an endpoint on `rsc_index`.
    fn ep_config_for_lane(&self, rsc_index: RscIndex) -> u8 {
        let atomic_tls = self.atomic_tls.load(Ordering::Relaxed);
        let num_tls = self.lock_ifaces().len();
        let amo_lanes: Vec<RscIndex> = (0..num_tls)
            .filter(|i| atomic_tls & (1u64 << i) != 0)
            .map(|i| i as RscIndex)
            .collect();
        let min_zcopy = self.lock_attrs()[rsc_index as usize].min_zcopy;
        let key = EpConfigKey {
            am_lane: Some(rsc_index),
            rma_lanes: Vec::new(),
            amo_lanes,
            wireup_lane: Some(rsc_index),
            zcopy_thresh: min_zcopy,
        };
        self.ep_config.get_or_insert(&key, |key| self.ep_config_init(key))
    }

    /// Per-configuration initializer: derive scratch-path sizes from the
    /// am lane's capability record.
    fn ep_config_init(&self, key: &EpConfigKey) -> EpConfigDerived {
        let Some(am_lane) = key.am_lane else {
            return EpConfigDerived::default();
        };
        let attrs = self.lock_attrs();
        let attr = &attrs[am_lane as usize];
        EpConfigDerived {
            max_am_short: attr.am.max_short,
            max_am_bcopy: attr.am.max_bcopy,
            bcopy_thresh: attr.am.max_short,
        }
    }

    /// Track an endpoint needing main-thread progression (stub promotion
    /// or back-pressure retry) and register the progress callback on first
    /// use.
    pub(crate) fn stub_ep_add(&self, ep: Endpoint) {
        let _async = self.async_ctx.block();
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut stubs = self.stub_eps.lock().unwrap_or_else(|e| e.into_inner());
            if stubs.iter().any(|e| e.dest_uuid() == ep.dest_uuid()) {
                return;
            }
            stubs.push(ep);
        }
        let mut progress_id = self
            .stub_progress_id
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if progress_id.is_none() {
            let weak = self.weak_self.clone();
            let id = self.tl_worker.register(Arc::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.progress_stub_eps();
                }
            }));
            *progress_id = Some(id);
        }
    }

    /// Main-thread progression of tracked endpoints. Promotion handover
    /// may come from any thread; the switch happens here, on the
    /// progressing thread, so handler re-entrancy invariants hold.
    fn progress_stub_eps(&self) {
        std::thread::yield_now();
        self.async_ctx.check_miss();

        let _async = self.async_ctx.block();
        let mut stubs = self.stub_eps.lock().unwrap_or_else(|e| e.into_inner());
        stubs.retain(|ep| !ep.progress());
        if stubs.is_empty() {
            let mut progress_id = self
                .stub_progress_id
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(id) = progress_id.take() {
                self.tl_worker.unregister(id);
            }
        }
    }
}

impl Drop for WorkerCore {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        // Break incoming callback edges first, then endpoints, then the
        // interfaces themselves (each closing its wakeup handle). The
        // remaining members drop in declaration order.
        self.remove_am_handlers();
        self.lock_reply_eps().clear();
        self.stub_eps.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.close_ifaces();
    }
}

fn worker_name() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, nix::unistd::getpid().as_raw())
}
