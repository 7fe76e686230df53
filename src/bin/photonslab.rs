//! PhotonSlab Command-Line Driver
//!
//! Runs the allocator against an in-memory backend with synthetic churn and
//! reports what it did.
//!
//! # Examples
//!
//! ```bash
//! # 600 frames of churn over up to 500 entries
//! photonslab simulate --frames 600 --entries 500 --seed 7
//!
//! # Same run, stats as JSON and Prometheus text
//! photonslab simulate --frames 600 --json --metrics
//!
//! # Show the effective configuration (file + PHOTONSLAB__* overrides)
//! photonslab --config photonslab.toml config
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use photonslab::memory::{AllocatorMetrics, HostBackend, ELEMENT_FLOATS};
use photonslab::{AllocatorConfig, EntryId, FrameLoop, MemoryController};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonSlab - size-bucketed slot allocator for shared vertex buffers
#[derive(Parser, Debug)]
#[command(name = "photonslab")]
#[command(version = photonslab::VERSION)]
#[command(about = "PhotonSlab - size-bucketed slot allocator for shared vertex buffers", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Allocator configuration file (TOML)
    #[arg(long, global = true, env = "PHOTONSLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTONSLAB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the allocator with random churn
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

/// Simulation arguments
#[derive(Args, Debug)]
struct SimulateArgs {
    /// Frames to run
    #[arg(long, default_value = "600")]
    frames: u64,

    /// Upper bound on live entries
    #[arg(long, default_value = "500")]
    entries: usize,

    /// RNG seed
    #[arg(long, default_value = "42", env = "PHOTONSLAB_SEED")]
    seed: u64,

    /// Largest payload, in elements
    #[arg(long, default_value = "70000")]
    max_elements: usize,

    /// Print final stats as JSON
    #[arg(long)]
    json: bool,

    /// Print final stats in Prometheus text format
    #[arg(long)]
    metrics: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = AllocatorConfig::load(cli.config.as_deref())
        .context("failed to load allocator configuration")?;

    match cli.command {
        Commands::Simulate(args) => simulate_command(config, args),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("PhotonSlab {}", photonslab::VERSION);
            Ok(())
        }
    }
}

fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "photonslab.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// A live entry: element count plus the seed its payload is derived from
struct LiveEntry {
    id: EntryId,
    elements: usize,
    seed: f32,
}

/// Seeded churn generator
struct Churn {
    rng: StdRng,
    live: Vec<LiveEntry>,
    next_id: u64,
    max_entries: usize,
    max_elements: usize,
}

impl Churn {
    fn new(seed: u64, max_entries: usize, max_elements: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            live: Vec::new(),
            next_id: 1,
            max_entries,
            max_elements: max_elements.max(1),
        }
    }

    /// Log-uniform element count so every size class sees traffic
    fn element_count(&mut self) -> usize {
        let max = (self.max_elements as f64).ln();
        let n = self.rng.gen_range(0.0..=max).exp() as usize;
        n.clamp(1, self.max_elements)
    }

    fn pick(&mut self) -> Option<usize> {
        if self.live.is_empty() {
            None
        } else {
            Some(self.rng.gen_range(0..self.live.len()))
        }
    }
}

fn payload(elements: usize, seed: f32) -> Vec<f32> {
    (0..elements * ELEMENT_FLOATS)
        .map(|i| seed + (i % ELEMENT_FLOATS) as f32 * 0.1)
        .collect()
}

#[derive(Debug, Default)]
struct ChurnTotals {
    inserted: u64,
    updated: u64,
    resized: u64,
    removed: u64,
    reuploaded: u64,
}

fn simulate_command(config: AllocatorConfig, args: SimulateArgs) -> anyhow::Result<()> {
    info!(
        frames = args.frames,
        entries = args.entries,
        seed = args.seed,
        max_elements = args.max_elements,
        "Starting simulation"
    );

    let controller = MemoryController::with_config(HostBackend::new(), config)?;
    let mut frames = FrameLoop::new(controller);
    let mut churn = Churn::new(args.seed, args.entries, args.max_elements);
    let mut totals = ChurnTotals::default();
    let ops_per_frame = (args.entries / 20).max(1);

    for _ in 0..args.frames {
        let mut frame = frames.begin_frame();

        for _ in 0..ops_per_frame {
            let roll = churn.rng.gen_range(0..100);
            let below_cap = churn.live.len() < churn.max_entries;

            if (roll < 40 && below_cap) || churn.live.is_empty() {
                let entry = LiveEntry {
                    id: EntryId(churn.next_id),
                    elements: churn.element_count(),
                    seed: churn.rng.gen(),
                };
                churn.next_id += 1;
                frame.ensure_slot(entry.id, &payload(entry.elements, entry.seed))?;
                churn.live.push(entry);
                totals.inserted += 1;
            } else if roll < 70 {
                if let Some(i) = churn.pick() {
                    let seed = churn.rng.gen();
                    let entry = &mut churn.live[i];
                    entry.seed = seed;
                    frame.ensure_slot(entry.id, &payload(entry.elements, entry.seed))?;
                    totals.updated += 1;
                }
            } else if roll < 85 {
                if let Some(i) = churn.pick() {
                    let elements = churn.element_count();
                    let entry = &mut churn.live[i];
                    entry.elements = elements;
                    frame.ensure_slot(entry.id, &payload(entry.elements, entry.seed))?;
                    totals.resized += 1;
                }
            } else if let Some(i) = churn.pick() {
                let entry = churn.live.swap_remove(i);
                frame.remove_cluster(entry.id)?;
                totals.removed += 1;
            }
        }

        for id in frame.take_pending_reuploads() {
            match churn.live.iter().find(|e| e.id == id) {
                Some(entry) => {
                    frame.ensure_slot(entry.id, &payload(entry.elements, entry.seed))?;
                    totals.reuploaded += 1;
                }
                None => warn!(entry = %id, "Re-upload requested for unknown entry"),
            }
        }

        frame.finish()?;
    }

    let controller = frames.controller();
    controller.validate_integrity()?;
    let stats = controller.stats();
    controller.log_stats();

    println!("Simulation ({} frames, seed {})", args.frames, args.seed);
    println!("───────────────────────────────");
    println!(
        "  • {} inserted, {} updated, {} resized, {} removed, {} re-uploaded",
        totals.inserted, totals.updated, totals.resized, totals.removed, totals.reuploaded
    );
    println!("{}", stats.render_report());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    if args.metrics {
        let metrics = AllocatorMetrics::new()?;
        metrics.observe(&stats);
        print!("{}", metrics.encode()?);
    }

    Ok(())
}
