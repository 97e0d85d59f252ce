//! Shared helpers for commux integration tests over the loopback driver.

use commux::{AmTable, Context, ContextConfig, Transport};
use looptl::{LoopDevice, LoopTransport};

/// Context over the given loopback devices. The explicit filter keeps the
/// environment selector out of test runs.
pub fn loop_context(config: ContextConfig, devices: Vec<LoopDevice>) -> Context {
    let transports: Vec<Box<dyn Transport>> = vec![Box::new(LoopTransport::new(devices))];
    Context::new(config.with_tl_filter(["loop"]), transports).expect("loop context")
}

/// Same, with a process-wide AM dispatch table.
pub fn loop_context_with_table(
    config: ContextConfig,
    devices: Vec<LoopDevice>,
    table: &'static AmTable,
) -> Context {
    let transports: Vec<Box<dyn Transport>> = vec![Box::new(LoopTransport::new(devices))];
    Context::with_am_table(config.with_tl_filter(["loop"]), transports, table)
        .expect("loop context")
}
