//! NR MAC Scheduler Simulator
//!
//! Runs the gNB MAC scheduler slot by slot against simulated UEs and prints
//! per-UE throughput, HARQ and link adaptation statistics.

mod config;
mod sim;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::SimConfig;
use sim::Simulator;

/// NR MAC scheduler simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (.yaml, .yml or .toml); built-in scenario when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides the scenario
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of slots to simulate
    #[arg(long)]
    slots: Option<u64>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Pace slots at their real duration
    #[arg(long)]
    realtime: bool,

    /// Write every scheduler input message to this file as JSON lines
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    if let Some(slots) = args.slots {
        config.simulation.slots = slots;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    config.simulation.realtime |= args.realtime;

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting NR MAC scheduler simulator");
    match &args.config {
        Some(path) => info!("Scenario: {}", path.display()),
        None => info!("Scenario: built-in"),
    }
    let carrier = &config.scheduler.carrier;
    info!("Cell configuration:");
    info!("  Cell ID: {}, BWP: {}", carrier.cell_id, carrier.bwp_id);
    match carrier.subcarrier_spacing() {
        Ok(scs) => info!("  Numerology: {} (SCS {} kHz)", carrier.numerology, scs.khz()),
        Err(_) => info!("  Numerology: {}", carrier.numerology),
    }
    info!("  RBs: {} ({} RBGs)", carrier.num_rbs, carrier.num_rbgs());
    info!("  Duplex: {:?}", carrier.duplex);
    info!("  Policy: {:?} / {:?}", config.scheduler.policy, config.scheduler.access);

    config.validate()?;
    let mut simulator = Simulator::new(&config)?;
    if let Some(path) = &args.trace {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        simulator = simulator.with_trace(Box::new(std::io::BufWriter::new(file)));
        info!("Tracing scheduler input to {}", path.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut handle = tokio::spawn(sim::run(
        simulator,
        config.simulation.slots,
        config.simulation.realtime,
        stop.clone(),
    ));

    // Wait for completion or shutdown signal
    let report = tokio::select! {
        res = &mut handle => res??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping after the current slot");
            stop.store(true, Ordering::Relaxed);
            handle.await??
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    info!("Simulator shutdown complete");
    Ok(())
}
