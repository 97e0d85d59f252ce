//! Stub endpoint tests: reply-map lookup, queueing before wire-up and
//! main-thread promotion without losing operations.

mod common;

use std::cell::RefCell;
use std::sync::OnceLock;

use commux::{
    AmCbFlags, AmDesc, AmDisposition, AmHandlerEntry, AmTable, ContextConfig, Features, Worker,
    WorkerParams,
};
use common::loop_context_with_table;
use looptl::LoopDevice;

const AM_ID: u8 = 3;

thread_local! {
    static RECEIVED: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

fn recording_handler(_worker: &Worker, desc: AmDesc) -> AmDisposition {
    RECEIVED.with(|r| r.borrow_mut().push(desc.data().to_vec()));
    AmDisposition::Consumed(desc)
}

fn table() -> &'static AmTable {
    static TABLE: OnceLock<AmTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        AmTable::from_entries([(
            AM_ID,
            AmHandlerEntry {
                features: Features::AM,
                flags: AmCbFlags::Sync,
                cb: &recording_handler,
                tracer: None,
            },
        )])
    })
}

fn config() -> ContextConfig {
    ContextConfig::new().with_features(Features::AM | Features::WAKEUP)
}

#[test]
fn test_reply_ep_is_unique_per_peer() {
    let ctx = loop_context_with_table(config(), vec![LoopDevice::new("self0")], table());
    let worker = Worker::create(&ctx, WorkerParams::default()).unwrap();

    let ep1 = worker.get_reply_ep(0xaaaa);
    let ep2 = worker.get_reply_ep(0xaaaa);

    // One endpoint per peer: work queued through one handle is visible
    // through the other.
    ep1.am_bcopy(AM_ID, b"queued").unwrap();
    assert_eq!(ep2.pending_len(), 1);
    assert!(ep2.is_stub());
}

#[test]
fn test_stub_queues_then_promotion_delivers_in_order() {
    let ctx = loop_context_with_table(config(), vec![LoopDevice::new("self0")], table());
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();

    // Reply endpoint requested before any handshake completed.
    let ep = sender.get_reply_ep(receiver.uuid());
    assert!(ep.is_stub());

    for i in 0..3u8 {
        ep.am_bcopy(AM_ID, &[b'm', i]).unwrap();
    }
    assert_eq!(ep.pending_len(), 3);

    // Progress alone cannot deliver: the endpoint is still a stub.
    sender.progress();
    receiver.progress();
    assert!(RECEIVED.with(|r| r.borrow().is_empty()));
    assert_eq!(ep.pending_len(), 3);

    // The handshake hands over the connected transport endpoint; the
    // switch itself happens on the next progress pump.
    let promoted = sender.connect(&receiver.get_address()).unwrap();
    assert_eq!(promoted.dest_uuid(), receiver.uuid());
    assert!(ep.is_stub());

    sender.progress();
    assert!(!ep.is_stub());
    assert_eq!(ep.pending_len(), 0);

    receiver.progress();
    let received = RECEIVED.with(|r| r.borrow().clone());
    assert_eq!(received, vec![b"m\x00".to_vec(), b"m\x01".to_vec(), b"m\x02".to_vec()]);

    // Later sends go straight through.
    ep.am_bcopy(AM_ID, b"direct").unwrap();
    receiver.progress();
    assert_eq!(RECEIVED.with(|r| r.borrow().len()), 4);
}

#[test]
fn test_promotion_from_connect_reuses_stub() {
    let ctx = loop_context_with_table(config(), vec![LoopDevice::new("self0")], table());
    let receiver = Worker::create(&ctx, WorkerParams::default()).unwrap();
    let sender = Worker::create(&ctx, WorkerParams::default()).unwrap();

    let stub = sender.get_reply_ep(receiver.uuid());
    let connected = sender.connect(&receiver.get_address()).unwrap();
    assert_eq!(stub.dest_uuid(), connected.dest_uuid());

    sender.progress();
    assert!(!stub.is_stub());

    // A second connect finds the wired endpoint, no new entry.
    let again = sender.connect(&receiver.get_address()).unwrap();
    assert!(!again.is_stub());
    assert_eq!(again.dest_uuid(), receiver.uuid());
}
