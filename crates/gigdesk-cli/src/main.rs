mod cmd;
mod context;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    actions::ActionsSubcommand, config::ConfigSubcommand, engine::EngineSubcommand,
    lead::LeadSubcommand, log::LogSubcommand, stalls::StallsSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gigdesk",
    about = "Next best action engine: find stalled leads, jobs and invoices and act on them",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data directory holding config.yaml and gigdesk.redb (default: ~/.gigdesk)
    #[arg(long, global = true, env = "GIGDESK_DIR")]
    data_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load users, leads, jobs and invoices from a YAML or JSON file
    Import {
        /// Dataset file with `users`, `leads`, `jobs` and `invoices` lists
        file: PathBuf,
    },

    /// Run the engine or a single sweep
    Engine {
        #[command(subcommand)]
        subcommand: EngineSubcommand,
    },

    /// List, act on, or dismiss next actions
    Actions {
        #[command(subcommand)]
        subcommand: ActionsSubcommand,
    },

    /// Inspect stall detections
    Stalls {
        #[command(subcommand)]
        subcommand: StallsSubcommand,
    },

    /// Audit trail of autonomous sends
    Log {
        #[command(subcommand)]
        subcommand: LogSubcommand,
    },

    /// Record lead intent signals
    Lead {
        #[command(subcommand)]
        subcommand: LeadSubcommand,
    },

    /// Show, validate, or create the engine config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Engine {
            subcommand: EngineSubcommand::Run { .. },
        } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = context::resolve_data_dir(cli.data_dir.as_deref()).and_then(|data_dir| {
        match cli.command {
            Commands::Import { file } => cmd::import::run(&data_dir, &file, cli.json),
            Commands::Engine { subcommand } => cmd::engine::run(&data_dir, subcommand, cli.json),
            Commands::Actions { subcommand } => cmd::actions::run(&data_dir, subcommand, cli.json),
            Commands::Stalls { subcommand } => cmd::stalls::run(&data_dir, subcommand, cli.json),
            Commands::Log { subcommand } => cmd::log::run(&data_dir, subcommand, cli.json),
            Commands::Lead { subcommand } => cmd::lead::run(&data_dir, subcommand, cli.json),
            Commands::Config { subcommand } => cmd::config::run(&data_dir, subcommand, cli.json),
        }
    });

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
