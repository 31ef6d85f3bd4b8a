use std::path::Path;

use anyhow::{Context, Result};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use haunts_core::Repository;
use haunts_core::backup;
use haunts_core::models::ImportSummary;

use crate::config::Config;

#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Collection")]
    collection: &'static str,
    #[tabled(rename = "Records")]
    records: usize,
}

fn summary_table(summary: &ImportSummary) -> String {
    let rows = [
        ("author", summary.authors),
        ("places", summary.places),
        ("lists", summary.lists),
        ("list items", summary.list_items),
        ("visits", summary.visits),
        ("dishes", summary.dishes),
        ("categories", summary.categories),
        ("tags", summary.tags),
        ("place tags", summary.place_tags),
    ]
    .map(|(collection, records)| CountRow {
        collection,
        records,
    });
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..2)).with(Alignment::right()))
        .to_string()
}

pub(crate) fn cmd_export(repo: &Repository, output: Option<&Path>, json: bool) -> Result<()> {
    let snapshot = repo.export()?;
    let body = serde_json::to_string_pretty(&snapshot)?;

    let Some(path) = output else {
        println!("{body}");
        return Ok(());
    };

    std::fs::write(path, body.as_bytes())
        .with_context(|| format!("Failed to write backup to {}", path.display()))?;
    let summary = backup::summarize(&snapshot);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Exported to {}", path.display());
        println!("{}", summary_table(&summary));
    }
    Ok(())
}

/// Replace the whole store with a backup file. With `dry_run` the file is
/// only parsed and validated.
pub(crate) fn cmd_import(repo: &Repository, file: &Path, dry_run: bool, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let summary = if dry_run {
        let parsed = backup::parse(&raw)?;
        backup::validate(&parsed)?;
        backup::summarize(&parsed)
    } else {
        repo.import_json(&raw)?
    };

    if json {
        println!(
            "{}",
            serde_json::json!({ "dryRun": dry_run, "summary": summary })
        );
    } else {
        if dry_run {
            println!("Backup is valid. Nothing was changed.");
        } else {
            println!("Restored {}", file.display());
        }
        println!("{}", summary_table(&summary));
    }
    Ok(())
}

pub(crate) fn cmd_defaults(repo: &Repository, json: bool) -> Result<()> {
    let restored = repo.restore_default_categories()?;

    if json {
        println!("{}", serde_json::json!({ "restored": restored }));
    } else if restored == 0 {
        println!("All default categories are present");
    } else {
        println!("Restored {restored} default categor{}", if restored == 1 { "y" } else { "ies" });
    }
    Ok(())
}

pub(crate) fn cmd_status(repo: &Repository, config: &Config, json: bool) -> Result<()> {
    let stats = repo.stats()?;
    let schema_version = repo.schema_version()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "backend": repo.backend_kind(),
                "path": config.db_path,
                "schemaVersion": schema_version,
                "remote": config.remote_url,
                "authenticated": config.api_token.is_some(),
                "collections": stats,
            }))?
        );
        return Ok(());
    }

    println!(
        "Store:   {} ({}, schema v{schema_version})",
        config.db_path.display(),
        repo.backend_kind()
    );
    match &config.remote_url {
        Some(url) => println!(
            "Remote:  {url}{}",
            if config.api_token.is_some() { "" } else { " (no API token)" }
        ),
        None => println!("Remote:  not configured"),
    }

    #[derive(Tabled)]
    struct StatsRow {
        #[tabled(rename = "Collection")]
        kind: String,
        #[tabled(rename = "Records")]
        total: usize,
        #[tabled(rename = "Pending sync")]
        dirty: usize,
    }

    let rows: Vec<StatsRow> = stats
        .into_iter()
        .map(|s| StatsRow {
            kind: s.kind,
            total: s.total,
            dirty: s.dirty,
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}
