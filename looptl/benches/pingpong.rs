//! Loopback AM pingpong benchmark.

use std::cell::Cell;
use std::sync::OnceLock;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use commux::{
    AmCbFlags, AmDisposition, AmHandlerEntry, AmTable, Context, ContextConfig, Features,
    Transport, Worker, WorkerParams,
};
use looptl::{LoopDevice, LoopTransport};

const AM_ID: u8 = 1;

thread_local! {
    static RX: Cell<u64> = const { Cell::new(0) };
}

fn rx_handler(_worker: &Worker, desc: commux::AmDesc) -> AmDisposition {
    RX.with(|c| c.set(c.get() + 1));
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
                cb: &rx_handler,
                tracer: None,
            },
        )])
    })
}

fn bench_am_bcopy(c: &mut Criterion) {
    let transports: Vec<Box<dyn Transport>> =
        vec![Box::new(LoopTransport::new(vec![LoopDevice::new("bench0")]))];
    let config = ContextConfig::new().with_features(Features::AM | Features::WAKEUP);
    let context = Context::with_am_table(config, transports, table()).unwrap();

    let receiver = Worker::create(&context, WorkerParams::default()).unwrap();
    let sender = Worker::create(&context, WorkerParams::default()).unwrap();
    let ep = sender.connect(&receiver.get_address()).unwrap();

    for size in [8usize, 256, 4096] {
        let payload = vec![0x5au8; size];
        let mut group = c.benchmark_group("am_bcopy");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}b", size), |b| {
            b.iter(|| {
                let before = RX.with(|c| c.get());
                ep.am_bcopy(AM_ID, &payload).unwrap();
                sender.progress();
                while RX.with(|c| c.get()) == before {
                    receiver.progress();
                }
            })
        });
        group.finish();
    }
}

criterion_group!(benches, bench_am_bcopy);
criterion_main!(benches);
