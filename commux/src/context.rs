//! Application context: registered transport drivers, the dense resource
//! list and the context-wide configuration shared by all workers.

use std::sync::Arc;

use tracing::debug;

use crate::am::AmTable;
use crate::caps::{AtomicMode, Features, MdAttr, RscIndex, TlResource};
use crate::error::{Error, Result};
use crate::transport::{Iface, OpenParams, RemoteKey, Transport};

/// Environment variable selecting which transports are considered,
/// comma-separated transport names. Unset means all registered transports.
pub const ENV_TLS: &str = "COMMUX_TLS";

/// Context-wide configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Features enabled for workers of this context.
    pub features: Features,
    /// Atomic resource selection policy.
    pub atomic_mode: AtomicMode,
    /// Multi-threaded workers use a mutex instead of a spinlock.
    pub use_mt_mutex: bool,
    /// Extra bytes appended to every pooled request.
    pub request_trailer: usize,
    /// Expected number of endpoints, a sizing hint.
    pub est_num_eps: usize,
    /// Explicit transport filter; overrides [`ENV_TLS`] when set.
    pub tl_filter: Option<Vec<String>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            features: Features::AM | Features::WAKEUP,
            atomic_mode: AtomicMode::Guess,
            use_mt_mutex: false,
            request_trailer: 0,
            est_num_eps: 1,
            tl_filter: None,
        }
    }
}

impl ContextConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the enabled features.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Set the atomic selection mode.
    pub fn with_atomic_mode(mut self, mode: AtomicMode) -> Self {
        self.atomic_mode = mode;
        self
    }

    /// Prefer a mutex over a spinlock for multi-threaded workers.
    pub fn with_mt_mutex(mut self, use_mt_mutex: bool) -> Self {
        self.use_mt_mutex = use_mt_mutex;
        self
    }

    /// Set the per-request trailer size.
    pub fn with_request_trailer(mut self, bytes: usize) -> Self {
        self.request_trailer = bytes;
        self
    }

    /// Set the transport filter, bypassing [`ENV_TLS`].
    pub fn with_tl_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tl_filter = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

struct TlEntry {
    rsc: TlResource,
    tl_index: usize,
}

struct ContextInner {
    config: ContextConfig,
    transports: Vec<Box<dyn Transport>>,
    mds: Vec<MdAttr>,
    /// First global md index per transport, parallel to `transports`.
    md_base: Vec<usize>,
    tls: Vec<TlEntry>,
    am_table: &'static AmTable,
}

/// Shared application context. Cheap to clone and shareable across
/// threads; immutable once built.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Build a context over the given drivers with the default (empty)
    /// dispatch table.
    pub fn new(config: ContextConfig, transports: Vec<Box<dyn Transport>>) -> Result<Self> {
        Self::with_am_table(config, transports, &crate::am::EMPTY_AM_TABLE)
    }

    /// Build a context with an explicit process-wide dispatch table.
    ///
    /// Applies the transport filter (configuration, else [`ENV_TLS`]) and
    /// enumerates one resource per (transport, device) pair in registration
    /// order, assigning dense resource indices.
    pub fn with_am_table(
        config: ContextConfig,
        transports: Vec<Box<dyn Transport>>,
        am_table: &'static AmTable,
    ) -> Result<Self> {
        let filter: Option<Vec<String>> = config.tl_filter.clone().or_else(|| {
            std::env::var(ENV_TLS)
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        });

        let selected: Vec<Box<dyn Transport>> = transports
            .into_iter()
            .filter(|tl| match &filter {
                Some(names) => names.iter().any(|n| n == tl.name() || n == "all"),
                None => true,
            })
            .collect();

        let mut mds = Vec::new();
        let mut md_base = Vec::with_capacity(selected.len());
        let mut tls = Vec::new();
        for (tl_index, tl) in selected.iter().enumerate() {
            md_base.push(mds.len());
            let local_mds = tl.mds();
            for dev in tl.devices() {
                if dev.md_index >= local_mds.len() {
                    return Err(Error::InvalidParam("device references unknown memory domain"));
                }
                tls.push(TlEntry {
                    rsc: TlResource {
                        tl_name: tl.name().to_string(),
                        dev_name: dev.name,
                        md_index: md_base[tl_index] + dev.md_index,
                    },
                    tl_index,
                });
            }
            mds.extend(local_mds);
        }

        if tls.is_empty() {
            return Err(Error::NoDevice);
        }
        // Resource indices must fit the per-worker bitmask.
        if tls.len() > 64 {
            return Err(Error::InvalidParam("more than 64 transport resources"));
        }

        debug!(num_tls = tls.len(), "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                transports: selected,
                mds,
                md_base,
                tls,
                am_table,
            }),
        })
    }

    /// Number of transport resources; fixed for the context's life.
    pub fn num_tls(&self) -> usize {
        self.inner.tls.len()
    }

    /// Resource descriptor for a dense index.
    pub fn tl_rsc(&self, rsc_index: RscIndex) -> &TlResource {
        &self.inner.tls[rsc_index as usize].rsc
    }

    /// Memory-domain record by global index.
    pub fn md_attr(&self, md_index: usize) -> &MdAttr {
        &self.inner.mds[md_index]
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// The process-wide AM dispatch table.
    pub fn am_table(&self) -> &'static AmTable {
        self.inner.am_table
    }

    /// Open an interface on the resource's device.
    pub(crate) fn open_iface(
        &self,
        rsc_index: RscIndex,
        params: &OpenParams,
    ) -> Result<Box<dyn Iface>> {
        let entry = &self.inner.tls[rsc_index as usize];
        self.inner.transports[entry.tl_index].open_iface(&entry.rsc.dev_name, params)
    }

    /// Pack a remote key through the driver owning its memory domain.
    pub fn pack_rkey(&self, rkey: &RemoteKey) -> Result<Vec<u8>> {
        let tl_index = self.transport_of_md(rkey.md_index)?;
        Ok(self.inner.transports[tl_index].rkey_pack(rkey))
    }

    /// Unpack a remote key blob for the given memory domain.
    pub fn unpack_rkey(&self, md_index: usize, buf: &[u8]) -> Result<RemoteKey> {
        let tl_index = self.transport_of_md(md_index)?;
        self.inner.transports[tl_index].rkey_unpack(buf)
    }

    fn transport_of_md(&self, md_index: usize) -> Result<usize> {
        if md_index >= self.inner.mds.len() {
            return Err(Error::InvalidParam("unknown memory domain"));
        }
        let mut owner = 0;
        for (tl_index, base) in self.inner.md_base.iter().enumerate() {
            if md_index >= *base {
                owner = tl_index;
            }
        }
        Ok(owner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("num_tls", &self.num_tls())
            .field("features", &self.inner.config.features)
            .finish()
    }
}
