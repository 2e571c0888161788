use crate::context::{runtime, Context};
use crate::output::{fmt_confidence, fmt_time, print_json, print_table};
use anyhow::Context as _;
use clap::Subcommand;
use gigdesk_core::types::format_cents;
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum ActionsSubcommand {
    /// Active next actions for a user, most money at risk first
    List {
        #[arg(long)]
        user: String,
    },

    /// Mark an action as done; resolves its stall
    Act { id: Uuid },

    /// Dismiss an action; it comes back next sweep if the entity is still stalled
    Dismiss { id: Uuid },
}

pub fn run(data_dir: &Path, subcmd: ActionsSubcommand, json: bool) -> anyhow::Result<()> {
    let ctx = Context::open(data_dir)?;
    let engine = ctx.engine()?;
    let rt = runtime()?;

    match subcmd {
        ActionsSubcommand::List { user } => {
            let views = rt.block_on(engine.get_next_actions_for_user(&user))?;
            if json {
                return print_json(&views);
            }
            if views.is_empty() {
                println!("No active actions for {user}.");
                return Ok(());
            }
            let rows = views
                .iter()
                .map(|v| {
                    vec![
                        v.action.id.to_string(),
                        format!("{}:{}", v.action.entity_type, v.action.entity_id),
                        v.action.recommended_action.to_string(),
                        format_cents(v.money_at_risk),
                        fmt_confidence(v.confidence),
                        if v.action.auto_executable { "yes" } else { "no" }.into(),
                        fmt_time(v.action.expires_at),
                        v.action.reason.clone(),
                    ]
                })
                .collect();
            print_table(
                &["ID", "ENTITY", "ACTION", "AT RISK", "CONF", "AUTO", "EXPIRES", "REASON"],
                rows,
            );
        }
        ActionsSubcommand::Act { id } => {
            let action = rt
                .block_on(engine.act_on_action(id))
                .with_context(|| format!("cannot act on {id}"))?;
            if json {
                return print_json(&action);
            }
            println!(
                "Acted on {} for {}:{}.",
                action.recommended_action, action.entity_type, action.entity_id
            );
        }
        ActionsSubcommand::Dismiss { id } => {
            let action = rt
                .block_on(engine.dismiss_action(id))
                .with_context(|| format!("cannot dismiss {id}"))?;
            if json {
                return print_json(&action);
            }
            println!(
                "Dismissed {} for {}:{}.",
                action.recommended_action, action.entity_type, action.entity_id
            );
        }
    }
    Ok(())
}
