use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use edvs_rs::logging::init_rust_logging;
use edvs_rs::{AcquisitionConfig, Edvs, NoopObserver};

#[derive(Parser, Debug)]
#[command(name = "edvs-demo", about = "Connect to an eDVS4337 and print event batches")]
struct Args {
    /// Serial device (e.g., /dev/ttyUSB0)
    port: String,
    /// Baud rate; overrides the config file
    #[arg(short, long)]
    baud: Option<u32>,
    /// TOML acquisition config
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of batches to read before stopping
    #[arg(short = 'n', long, default_value_t = 20)]
    batches: usize,
    /// Request a timestamp reset after this many batches
    #[arg(long)]
    reset_after: Option<usize>,
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AcquisitionConfig::default(),
    };
    config.serial.port = args.port.clone();
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    // The demo always waits for data.
    config.blocking_pop = true;

    println!("Opening {} at {} baud...", config.serial.port, config.serial.baud_rate);
    let mut edvs = Edvs::open(config).context("opening sensor")?;
    let info = edvs.info().clone();
    println!(
        "Connected to {} ({}x{})",
        info.device_string, info.size_x, info.size_y
    );

    edvs.start(Arc::new(NoopObserver))
        .context("starting acquisition")?;

    for i in 0..args.batches {
        if args.reset_after == Some(i) {
            println!("Resetting timestamps...");
            edvs.reset_timestamps();
        }
        let Some(batch) = edvs.next_batch() else {
            println!("Acquisition ended after {i} batches");
            break;
        };
        println!(
            "[Batch {:3}] pixels: {:5} | special: {} | ts: {}..{} | overflow: {}{}",
            i,
            batch.pixel_count(),
            batch.special_count(),
            batch.lowest_timestamp(),
            batch.highest_timestamp(),
            batch.wrap_overflow(),
            if batch.is_timestamp_reset() { " | reset" } else { "" },
        );
    }

    println!("Stopping...");
    edvs.stop().context("stopping acquisition")?;
    println!("Done.");
    Ok(())
}
