//! Active-message dispatch tests: many-to-one traffic with mixed handler
//! dispositions, feature/sync gating, descriptor retention and teardown.

mod common;

use std::cell::{Cell, RefCell};
use std::sync::OnceLock;

use commux::{
    AmCbFlags, AmDesc, AmDisposition, AmHandlerEntry, AmTable, ContextConfig, Features,
    IfaceFlags, Worker, WorkerParams,
};
use common::loop_context_with_table;
use looptl::{LoopDevice, DEFAULT_RX_POOL};

const AM_ID: u8 = 15;
const MAGIC: u64 = 0xdead_beef_1234_5678;
const NUM_SENDERS: usize = 10;

thread_local! {
    static AM_COUNT: Cell<usize> = const { Cell::new(0) };
    static PAYLOAD_BAD: Cell<bool> = const { Cell::new(false) };
    static BACKLOG: RefCell<Vec<AmDesc>> = const { RefCell::new(Vec::new()) };
    static SEQS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn payload_len(seq: u64) -> usize {
    8 + ((seq as usize * 37) % 16376)
}

fn fill_payload(buf: &mut [u8], seq: u64) {
    buf[..8].copy_from_slice(&seq.to_le_bytes());
    buf[8..].fill(seq as u8);
}

fn check_payload(data: &[u8]) {
    let seq = u64::from_le_bytes(data[..8].try_into().unwrap());
    let ok = data.len() == payload_len(seq) && data[8..].iter().all(|b| *b == seq as u8);
    if !ok {
        PAYLOAD_BAD.with(|bad| bad.set(true));
    }
}

/// Checks three quarters of the messages inline; stamps and retains the
/// rest for a later drain.
fn many2one_handler(_worker: &Worker, mut desc: AmDesc) -> AmDisposition {
    let count = AM_COUNT.with(|c| {
        c.set(c.get() + 1);
        c.get()
    });

    if count % 4 == 0 {
        let len = desc.len() as u64;
        desc.headroom_mut()[..8].copy_from_slice(&MAGIC.to_le_bytes());
        desc.headroom_mut()[8..16].copy_from_slice(&len.to_le_bytes());
        BACKLOG.with(|b| b.borrow_mut().push(desc));
        AmDisposition::Retained
    } else {
        check_payload(desc.data());
        AmDisposition::Consumed(desc)
    }
}

fn counting_handler(_worker: &Worker, desc: AmDesc) -> AmDisposition {
    AM_COUNT.with(|c| c.set(c.get() + 1));
    SEQS.with(|s| {
        s.borrow_mut()
            .push(u64::from_le_bytes(desc.data()[..8].try_into().unwrap()))
    });
    AmDisposition::Consumed(desc)
}

fn retaining_handler(_worker: &Worker, desc: AmDesc) -> AmDisposition {
    AM_COUNT.with(|c| c.set(c.get() + 1));
    BACKLOG.with(|b| b.borrow_mut().push(desc));
    AmDisposition::Retained
}

fn many2one_table() -> &'static AmTable {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        AmTable::from_entries([(
            AM_ID,
            AmHandlerEntry {
                features: Features::AM,
                flags: AmCbFlags::Sync,
                cb: &many2one_handler,
                tracer: None,
            },
        )])
    })
}

fn counting_table(features: Features) -> AmTable {
    AmTable::from_entries([(
        AM_ID,
        AmHandlerEntry {
            features,
            flags: AmCbFlags::Sync,
            cb: &counting_handler,
            tracer: None,
        },
    )])
}

#[test]
fn test_many2one_am_bcopy() {
    let num_sends: u64 = 1000;

    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![LoopDevice::new("self0")],
        many2one_table(),
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let receiver_addr = receiver.get_address();

    let senders: Vec<Worker> = (0..NUM_SENDERS)
        .map(|_| Worker::create(&ctx, WorkerParams::default()).unwrap())
        .collect();
    let eps: Vec<_> = senders
        .iter()
        .map(|s| s.connect(&receiver_addr).unwrap())
        .collect();

    let mut payload = vec![0u8; 16 * 1024];
    for seq in 0..num_sends {
        let sender_num = (seq as usize * 7) % NUM_SENDERS;
        let len = payload_len(seq);
        fill_payload(&mut payload[..len], seq);
        eps[sender_num].am_bcopy(AM_ID, &payload[..len]).unwrap();

        // Keep queues moving: retry queued sends, deliver at the receiver.
        senders[sender_num].progress();
        receiver.progress();
    }

    let mut spins = 0;
    while AM_COUNT.with(|c| c.get()) < num_sends as usize {
        for sender in &senders {
            sender.progress();
        }
        receiver.progress();
        spins += 1;
        assert!(spins < 1_000_000, "missing messages");
    }

    assert_eq!(AM_COUNT.with(|c| c.get()), num_sends as usize);
    assert!(!PAYLOAD_BAD.with(|b| b.get()), "payload mismatch");

    // Drain the retained backlog: each descriptor carries the stamp in its
    // headroom and the original payload.
    let backlog: Vec<AmDesc> = BACKLOG.with(|b| b.borrow_mut().drain(..).collect());
    assert_eq!(backlog.len(), num_sends as usize / 4);
    for desc in backlog {
        let head = desc.headroom();
        assert_eq!(u64::from_le_bytes(head[..8].try_into().unwrap()), MAGIC);
        let stamped_len = u64::from_le_bytes(head[8..16].try_into().unwrap());
        assert_eq!(stamped_len as usize, desc.len());
        check_payload(desc.data());
        desc.release();
    }
    assert!(!PAYLOAD_BAD.with(|b| b.get()), "backlog payload mismatch");

    // Every descriptor made it back to the transport pool.
    assert_eq!(receiver.iface_rx_pool_avail(0), Some(DEFAULT_RX_POOL));
}

#[test]
fn test_handler_gated_by_features() {
    // The entry wants RMA; the context only enables AM. The id must not be
    // installed, so the frame falls through to the driver's drop path.
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| counting_table(Features::RMA));

    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![LoopDevice::new("self0")],
        table,
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let ep = sender.connect(&receiver.get_address()).unwrap();

    ep.am_bcopy(AM_ID, &42u64.to_le_bytes()).unwrap();
    sender.progress();
    assert_eq!(receiver.progress(), 1);
    assert_eq!(AM_COUNT.with(|c| c.get()), 0);
}

#[test]
fn test_sync_handler_skipped_without_sync_capability() {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| counting_table(Features::AM));

    // bcopy-capable interface without sync callbacks: a sync handler must
    // not be installed there.
    let no_sync = LoopDevice::new("nosync").with_flags(
        IfaceFlags::AM_SHORT | IfaceFlags::AM_BCOPY | IfaceFlags::WAKEUP
            | IfaceFlags::CONNECT_TO_IFACE,
    );
    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![no_sync],
        table,
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let ep = sender.connect(&receiver.get_address()).unwrap();

    ep.am_bcopy(AM_ID, &7u64.to_le_bytes()).unwrap();
    sender.progress();
    receiver.progress();
    assert_eq!(AM_COUNT.with(|c| c.get()), 0);
}

#[test]
fn test_per_endpoint_arrival_order() {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| counting_table(Features::AM));

    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![LoopDevice::new("self0")],
        table,
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let ep = sender.connect(&receiver.get_address()).unwrap();

    for seq in 0..50u64 {
        let mut payload = vec![0u8; 64];
        fill_payload(&mut payload, seq);
        ep.am_bcopy(AM_ID, &payload).unwrap();
        sender.progress();
        receiver.progress();
    }
    while AM_COUNT.with(|c| c.get()) < 50 {
        sender.progress();
        receiver.progress();
    }

    let seqs = SEQS.with(|s| s.borrow().clone());
    assert_eq!(seqs, (0..50).collect::<Vec<u64>>());
}

#[test]
fn test_retained_descriptor_holds_rx_slot() {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        AmTable::from_entries([(
            AM_ID,
            AmHandlerEntry {
                features: Features::AM,
                flags: AmCbFlags::Sync,
                cb: &retaining_handler,
                tracer: None,
            },
        )])
    });

    let device = LoopDevice {
        rx_pool_size: 4,
        ..LoopDevice::new("small")
    };
    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![device],
        table,
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let ep = sender.connect(&receiver.get_address()).unwrap();

    for seq in 0..6u64 {
        let mut payload = vec![0u8; 16];
        fill_payload(&mut payload, seq);
        ep.am_bcopy(AM_ID, &payload).unwrap();
        sender.progress();
    }

    // Four slots retained; the remaining frames wait in the queue.
    assert_eq!(receiver.progress(), 4);
    assert_eq!(receiver.iface_rx_pool_avail(0), Some(0));
    assert_eq!(receiver.progress(), 0);

    // Releasing the backlog returns the slots and delivery resumes.
    BACKLOG.with(|b| b.borrow_mut().clear());
    assert_eq!(receiver.iface_rx_pool_avail(0), Some(4));
    assert_eq!(receiver.progress(), 2);
    assert_eq!(AM_COUNT.with(|c| c.get()), 6);
    BACKLOG.with(|b| b.borrow_mut().clear());
}

#[test]
fn test_teardown_with_handlers_and_endpoints() {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| counting_table(Features::AM));

    let ctx = loop_context_with_table(
        ContextConfig::new().with_features(Features::AM | Features::WAKEUP),
        vec![LoopDevice::new("self0")],
        table,
    );
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();

    // A populated reply map, including one endpoint per fake peer.
    for peer in 0..100u64 {
        let _ = receiver.get_reply_ep(0x9000 + peer);
    }

    // Frames sitting undelivered when the worker dies.
    let ep = sender.connect(&receiver.get_address()).unwrap();
    for _ in 0..5 {
        ep.am_bcopy(AM_ID, &1u64.to_le_bytes()).unwrap();
    }
    sender.progress();

    // Destroy replaces every installed handler with the dropping no-op
    // before closing interfaces; no protocol handler may fire after this.
    receiver.destroy();
    assert_eq!(AM_COUNT.with(|c| c.get()), 0);

    // The sender stays usable against the dead peer.
    sender.progress();
}
