//! Active-message dispatch table.
//!
//! One process-wide immutable table maps an AM id to its protocol handler,
//! a feature-mask gate and an optional tracer. The worker installs the
//! active subset on every interface it opens; protocols never talk to a
//! driver's handler slots directly.

use crate::caps::{AmCbFlags, Features};
use crate::transport::AmDesc;
use crate::worker::Worker;

/// Active-message id. The first byte of protocol header on the wire.
pub type AmId = u8;

/// Number of AM ids; ids are dense over `[0, AM_ID_LAST)`.
pub const AM_ID_LAST: usize = 16;

/// Direction of a traced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmTraceType {
    /// Outgoing frame.
    Send,
    /// Incoming frame.
    Recv,
}

/// What a handler did with the received descriptor.
///
/// The two paths are type-distinct: consuming hands the descriptor back for
/// immediate reclaim, retaining means the handler moved it out and releases
/// it later. There is no third option.
pub enum AmDisposition {
    /// Payload was consumed during the callback; the receive slot is
    /// reclaimed now.
    Consumed(AmDesc),
    /// The handler took ownership of the descriptor; the slot stays out of
    /// the transport pool until the descriptor is released.
    Retained,
}

/// Protocol handler. Runs with the worker borrowed for the call; the
/// descriptor is owned by the handler from entry. Sync handlers run on the
/// progressing application thread, async handlers may run on a
/// transport-owned thread, so the callable must be thread-safe either way.
pub type AmHandler = dyn Fn(&Worker, AmDesc) -> AmDisposition + Send + Sync;

/// Optional per-id frame tracer; renders a one-line description into `out`.
pub type AmTracer = dyn Fn(&Worker, AmTraceType, AmId, &[u8], &mut String) + Send + Sync;

/// One dispatch-table record.
#[derive(Clone, Copy)]
pub struct AmHandlerEntry {
    /// The id is active on a worker iff this mask intersects the context's
    /// feature set.
    pub features: Features,
    /// Sync handlers are only installed on interfaces with sync-callback
    /// capability.
    pub flags: AmCbFlags,
    /// The protocol handler.
    pub cb: &'static AmHandler,
    /// Optional frame tracer.
    pub tracer: Option<&'static AmTracer>,
}

impl std::fmt::Debug for AmHandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmHandlerEntry")
            .field("features", &self.features)
            .field("flags", &self.flags)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

/// The immutable dispatch table, one slot per AM id.
#[derive(Debug)]
pub struct AmTable {
    entries: [Option<AmHandlerEntry>; AM_ID_LAST],
}

/// Table with no registered protocols; nothing gets installed.
pub static EMPTY_AM_TABLE: AmTable = AmTable::empty();

impl AmTable {
    /// The empty table.
    pub const fn empty() -> Self {
        Self {
            entries: [None; AM_ID_LAST],
        }
    }

    /// Build a table from (id, record) pairs.
    ///
    /// # Panics
    /// On an id outside `[0, AM_ID_LAST)` or a duplicate id: the table is
    /// assembled once at process start, so a bad registration is a
    /// programming error.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (AmId, AmHandlerEntry)>,
    {
        let mut table = Self::empty();
        for (id, entry) in entries {
            let slot = &mut table.entries[id as usize];
            assert!(slot.is_none(), "duplicate AM id {}", id);
            *slot = Some(entry);
        }
        table
    }

    /// Record for `id`, if a protocol registered one.
    pub fn get(&self, id: AmId) -> Option<&AmHandlerEntry> {
        self.entries.get(id as usize).and_then(|e| e.as_ref())
    }

    /// Ids with a registered record.
    pub fn ids(&self) -> impl Iterator<Item = AmId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(id, _)| id as AmId)
    }
}
