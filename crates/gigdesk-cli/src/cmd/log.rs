use crate::context::{runtime, Context};
use crate::output::{fmt_time, print_json, print_table};
use clap::Subcommand;
use gigdesk_core::store::EntityStore;
use std::path::Path;

#[derive(Subcommand)]
pub enum LogSubcommand {
    /// Autonomous sends for a user, newest first
    List {
        #[arg(long)]
        user: String,
    },
}

pub fn run(data_dir: &Path, subcmd: LogSubcommand, json: bool) -> anyhow::Result<()> {
    let LogSubcommand::List { user } = subcmd;
    let ctx = Context::open(data_dir)?;
    let logs = runtime()?.block_on(ctx.store.list_auto_execution_logs(&user))?;

    if json {
        return print_json(&logs);
    }
    if logs.is_empty() {
        println!("No autonomous sends for {user}.");
        return Ok(());
    }
    let rows = logs
        .iter()
        .map(|l| {
            vec![
                fmt_time(l.executed_at),
                format!("{}:{}", l.entity_type, l.entity_id),
                l.action_type.to_string(),
                l.delivery_channel.clone().unwrap_or_else(|| "-".into()),
                if l.success { "ok".into() } else { "failed".into() },
                l.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["EXECUTED", "ENTITY", "ACTION", "CHANNEL", "RESULT", "ERROR"],
        rows,
    );
    Ok(())
}
