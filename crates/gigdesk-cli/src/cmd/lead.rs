use crate::context::{runtime, Context};
use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum LeadSubcommand {
    /// Record that the user tapped "respond" on a lead
    Tap { lead_id: String },
}

pub fn run(data_dir: &Path, subcmd: LeadSubcommand, json: bool) -> anyhow::Result<()> {
    let LeadSubcommand::Tap { lead_id } = subcmd;
    let ctx = Context::open(data_dir)?;
    let engine = ctx.engine()?;
    let count = runtime()?.block_on(engine.record_respond_tap(&lead_id))?;
    if json {
        print_json(&serde_json::json!({ "lead_id": lead_id, "respond_tap_count": count }))?;
    } else {
        println!("Lead {lead_id}: {count} respond taps.");
    }
    Ok(())
}
