use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use gigdesk_core::config::{EngineConfig, WarnLevel};
use gigdesk_core::{io, paths};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective config (defaults filled in)
    Show,

    /// Validate the config for common mistakes
    Validate,

    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(data_dir: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(data_dir, json),
        ConfigSubcommand::Validate => validate(data_dir, json),
        ConfigSubcommand::Init { force } => init(data_dir, force),
    }
}

fn show(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::load(&paths::config_path(data_dir)).context("failed to load config")?;
    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::load(&paths::config_path(data_dir)).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if has_errors {
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(data_dir: &Path, force: bool) -> anyhow::Result<()> {
    let path = paths::config_path(data_dir);
    let config = EngineConfig::default();
    if force {
        config.save(&path).context("failed to write config")?;
    } else {
        let data = serde_yaml::to_string(&config)?;
        if !io::write_if_missing(&path, data.as_bytes()).context("failed to write config")? {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                path.display()
            );
        }
    }
    println!("Wrote {}", path.display());
    Ok(())
}
