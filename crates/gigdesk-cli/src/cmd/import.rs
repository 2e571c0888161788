use crate::context::{runtime, Context};
use crate::output::print_json;
use anyhow::Context as _;
use gigdesk_core::entity::Dataset;
use std::path::Path;

pub fn run(data_dir: &Path, file: &Path, json: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    // YAML is a superset of JSON, so one parser covers both.
    let dataset: Dataset = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    if dataset.is_empty() {
        anyhow::bail!("{} contains no users, leads, jobs or invoices", file.display());
    }

    let counts = serde_json::json!({
        "users": dataset.users.len(),
        "leads": dataset.leads.len(),
        "jobs": dataset.jobs.len(),
        "invoices": dataset.invoices.len(),
    });

    let ctx = Context::open(data_dir)?;
    let written = runtime()?
        .block_on(ctx.store.import(dataset))
        .context("import failed")?;

    if json {
        print_json(&serde_json::json!({ "imported": written, "counts": counts }))?;
    } else {
        println!(
            "Imported {written} rows ({} users, {} leads, {} jobs, {} invoices).",
            counts["users"], counts["leads"], counts["jobs"], counts["invoices"]
        );
    }
    Ok(())
}
