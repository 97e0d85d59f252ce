//! commux - Unified communication worker runtime over heterogeneous
//! transports.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Context                                 │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────────────┐  │
//! │  │ Transport  │  │  Resource    │  │  AM dispatch table       │  │
//! │  │ drivers    │  │  registry    │  │  (immutable, per id)     │  │
//! │  └────────────┘  └──────────────┘  └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//!                     │ one interface per resource
//!                     ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Worker                                  │
//! │  progress() ──► iface[0..num_tls].progress() ──► AM handlers     │
//! │  get_efd/arm/wait/signal ──► self-pipe + iface wakeups (epoll)   │
//! │  get_reply_ep(uuid) ──► reply map ──► stub ep ──► promotion      │
//! │  atomic_tls ◄── atomic resource selector                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Worker**: a scheduling/progress domain owning one interface per
//!   selected (transport, device) resource
//! - **AM dispatch**: incoming frames route through the process-wide
//!   handler table; handlers either consume the descriptor or retain it
//!   and release it later
//! - **Wakeup**: per-interface event descriptors plus an internal
//!   self-pipe aggregate into one pollable descriptor
//! - **Threading**: worker handles are `Send + Sync`; multi-threaded
//!   workers serialize application threads on a conditional lock, and
//!   driver-owned threads post events through the worker's
//!   [`AsyncHandle`](worker::AsyncHandle)
//!
//! Transport drivers implement the traits in [`transport`]; the `looptl`
//! crate ships an in-process reference driver.

pub mod address;
pub mod am;
mod atomic;
pub mod caps;
pub mod context;
pub mod endpoint;
pub mod epconf;
pub mod error;
mod request;
mod stats;
pub mod transport;
mod wakeup;
pub mod worker;

pub use address::{AddressSegment, WorkerAddress};
pub use am::{AmDisposition, AmHandlerEntry, AmId, AmTable, AmTraceType, AM_ID_LAST};
pub use caps::{
    AmCaps, AmCbFlags, AtomicMode, Features, IfaceAttr, IfaceFlags, MdAttr, RmaCaps, RscIndex,
    TlResource, WakeupEvents,
};
pub use context::{Context, ContextConfig, ENV_TLS};
pub use endpoint::Endpoint;
pub use epconf::{EpConfig, EpConfigDerived, EpConfigKey};
pub use error::{Error, Result};
pub use request::{Request, RequestFlags};
pub use stats::WorkerStats;
pub use transport::{
    AmDesc, AmRecvCb, AmTracerCb, DeviceDesc, Iface, IfaceWakeup, OpenParams, RemoteKey, RxPool,
    TlEndpoint, Transport,
};
pub use wakeup::SignalHandle;
pub use worker::{AsyncHandle, ThreadMode, Worker, WorkerParams, RX_HEADROOM};
