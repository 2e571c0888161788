use crate::context::{runtime, Context};
use crate::output::print_json;
use clap::Subcommand;
use gigdesk_core::config::{scan_interval_from_minutes, MAX_SCAN_INTERVAL_MINUTES};
use gigdesk_core::orchestrator::{DetectionReport, ExecutionReport};
use std::path::Path;

#[derive(Subcommand)]
pub enum EngineSubcommand {
    /// Run both sweeps on a timer until Ctrl-C
    Run {
        /// Minutes between sweeps (default: scan_interval_minutes from config)
        #[arg(long)]
        interval_minutes: Option<u64>,
    },

    /// Run the sweeps once and print what they did
    Sweep {
        /// Only run the detection sweep
        #[arg(long, conflicts_with = "execute")]
        detect: bool,
        /// Only run the execution sweep
        #[arg(long)]
        execute: bool,
    },
}

pub fn run(data_dir: &Path, subcmd: EngineSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        EngineSubcommand::Run { interval_minutes } => run_forever(data_dir, interval_minutes),
        EngineSubcommand::Sweep { detect, execute } => {
            // Neither flag means both sweeps.
            let both = !detect && !execute;
            sweep(data_dir, detect || both, execute || both, json)
        }
    }
}

fn run_forever(data_dir: &Path, interval_minutes: Option<u64>) -> anyhow::Result<()> {
    let ctx = Context::open(data_dir)?;
    let interval = match interval_minutes {
        Some(0) => anyhow::bail!("--interval-minutes must be at least 1"),
        Some(m) if m > MAX_SCAN_INTERVAL_MINUTES => {
            anyhow::bail!("--interval-minutes must be at most {MAX_SCAN_INTERVAL_MINUTES}")
        }
        Some(m) => scan_interval_from_minutes(m),
        None => ctx.config.scan_interval(),
    };
    let engine = ctx.engine()?;

    runtime()?.block_on(async move {
        let handle = engine.start(interval);
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down; waiting for in-flight sweeps");
        handle.stop().await;
        anyhow::Ok(())
    })
}

fn sweep(data_dir: &Path, detect: bool, execute: bool, json: bool) -> anyhow::Result<()> {
    let ctx = Context::open(data_dir)?;
    let engine = ctx.engine()?;

    let (detection, execution) = runtime()?.block_on(async {
        let detection = if detect {
            Some(engine.run_detection_sweep().await?)
        } else {
            None
        };
        let execution = if execute {
            Some(engine.run_execution_sweep().await?)
        } else {
            None
        };
        anyhow::Ok((detection, execution))
    })?;

    if json {
        print_json(&serde_json::json!({
            "detection": detection,
            "execution": execution,
        }))?;
        return Ok(());
    }
    if let Some(r) = &detection {
        print_detection(r);
    }
    if let Some(r) = &execution {
        print_execution(r);
    }
    Ok(())
}

fn print_detection(r: &DetectionReport) {
    println!("Detection sweep");
    println!("  users scanned:        {} ({} failed)", r.users_scanned, r.users_failed);
    println!("  stalled entities:     {}", r.candidates);
    println!(
        "  detections:           {} new, {} refreshed, {} resolved",
        r.detections_created, r.detections_refreshed, r.detections_resolved
    );
    println!(
        "  next actions:         {} new, {} already active, {} without recommendation",
        r.actions_created, r.actions_already_active, r.no_recommendation
    );
    println!("  expired actions:      {}", r.actions_expired);
    if r.entity_errors > 0 {
        println!("  entity errors:        {}", r.entity_errors);
    }
}

fn print_execution(r: &ExecutionReport) {
    println!("Execution sweep");
    println!(
        "  users considered:     {} ({} active, {} failed)",
        r.users_considered, r.users_active, r.users_failed
    );
    println!(
        "  auto-executed:        {} ({} delivery failures)",
        r.actions_executed, r.delivery_failures
    );
    println!("  skipped (cooldown):   {}", r.skipped_cooldown);
    if r.entity_errors > 0 {
        println!("  entity errors:        {}", r.entity_errors);
    }
}
