//! Print a worker summary over a set of loopback devices.
//!
//! Handy for eyeballing resource enumeration and atomic selection:
//!
//! ```bash
//! cargo run --bin loop_info -- --devices 2 --atomic-mode guess
//! ```

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use commux::{AtomicMode, Context, ContextConfig, Features, Transport, Worker, WorkerParams};
use looptl::{LoopDevice, LoopTransport};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AtomicModeArg {
    Cpu,
    Device,
    Guess,
}

impl From<AtomicModeArg> for AtomicMode {
    fn from(arg: AtomicModeArg) -> Self {
        match arg {
            AtomicModeArg::Cpu => AtomicMode::Cpu,
            AtomicModeArg::Device => AtomicMode::Device,
            AtomicModeArg::Guess => AtomicMode::Guess,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Create a loopback worker and print its summary")]
struct Args {
    /// Number of loopback devices to declare.
    #[arg(long, default_value_t = 2)]
    devices: usize,

    /// Atomic resource selection mode.
    #[arg(long, value_enum, default_value_t = AtomicModeArg::Guess)]
    atomic_mode: AtomicModeArg,

    /// Drive one progress pump before printing.
    #[arg(long)]
    progress: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let devices: Vec<LoopDevice> = (0..args.devices)
        .map(|i| LoopDevice::new(&format!("self{}", i)))
        .collect();
    let transports: Vec<Box<dyn Transport>> = vec![Box::new(LoopTransport::new(devices))];

    let config = ContextConfig::new()
        .with_features(Features::AM | Features::WAKEUP | Features::AMO32 | Features::AMO64)
        .with_atomic_mode(args.atomic_mode.into());
    let context = Context::new(config, transports)?;

    let worker = Worker::create(&context, WorkerParams::default())?;
    if args.progress {
        worker.progress();
    }
    worker.print_info(&mut std::io::stdout())?;
    Ok(())
}
