use crate::context::{runtime, Context};
use crate::output::{fmt_confidence, fmt_opt_time, fmt_time, print_json, print_table};
use clap::Subcommand;
use gigdesk_core::store::EntityStore;
use gigdesk_core::types::format_cents;
use std::path::Path;

#[derive(Subcommand)]
pub enum StallsSubcommand {
    /// Open stall detections for a user
    List {
        #[arg(long)]
        user: String,
        /// Include resolved detections
        #[arg(long)]
        all: bool,
    },
}

pub fn run(data_dir: &Path, subcmd: StallsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StallsSubcommand::List { user, all } => list(data_dir, &user, all, json),
    }
}

fn list(data_dir: &Path, user: &str, all: bool, json: bool) -> anyhow::Result<()> {
    let ctx = Context::open(data_dir)?;
    let mut rows = runtime()?.block_on(async {
        if all {
            ctx.store.list_stall_detections(user).await
        } else {
            ctx.store.list_open_stall_detections(user).await
        }
    })?;
    rows.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No stalls for {user}.");
        return Ok(());
    }
    let table = rows
        .iter()
        .map(|d| {
            vec![
                format!("{}:{}", d.entity_type, d.entity_id),
                d.stall_type.to_string(),
                format_cents(d.money_at_risk),
                fmt_confidence(d.confidence),
                fmt_time(d.detected_at),
                fmt_opt_time(d.resolved_at),
            ]
        })
        .collect();
    print_table(
        &["ENTITY", "STALL", "AT RISK", "CONF", "DETECTED", "RESOLVED"],
        table,
    );
    Ok(())
}
