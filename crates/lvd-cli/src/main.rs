use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lvd_storage::{BackupKind, MutationOutcome};
use lvd_sync::{run_scheduler, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lvd")]
#[command(about = "London Venue Directory data pipeline")]
struct Cli {
    /// Serve Google and FSA from captured responses in this directory.
    #[arg(long, global = true, env = "LVD_FIXTURES_DIR")]
    fixtures: Option<PathBuf>,

    #[arg(long, global = true, env = "LVD_DATASET_PATH")]
    dataset: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, match and merge every query in the search plan.
    Sync,
    /// Match existing venues against FSA without calling Google.
    EnrichFsa {
        /// Look up venues that already have a match again.
        #[arg(long)]
        refresh: bool,
    },
    /// Check the current dataset without changing it.
    Validate,
    /// Print field coverage for the current dataset.
    Coverage {
        /// Exit non-zero when any field is below this percentage.
        #[arg(long)]
        fail_below: Option<f64>,
    },
    /// List backups, oldest first.
    Backups,
    /// Put a backup back in place. Without --backup, step back one state.
    Rollback {
        #[arg(long)]
        backup: Option<String>,
    },
    /// Run syncs on LVD_SYNC_CRON until Ctrl-C.
    Schedule,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,lvd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_run(summary: &SyncRunSummary) {
    println!(
        "run {} complete: attempted={} succeeded={} failed={} added={} updated={} fsa_matched={}",
        summary.run_id,
        summary.records_attempted,
        summary.records_succeeded,
        summary.records_failed,
        summary.added.len(),
        summary.updated.len(),
        summary.fsa.matched,
    );
    if let (Some(before), Some(after)) = (&summary.coverage_before, &summary.coverage_after) {
        for field in &after.fields {
            let was = before
                .field(&field.field)
                .map(|f| format!("{:.1}%", f.percent))
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<14} {was:>7} -> {:.1}%", field.field, field.percent);
        }
    }
    if !summary.duplicate_suspects.is_empty() {
        println!("  duplicate suspects: {}", summary.duplicate_suspects.len());
    }
    if let Some(dir) = &summary.reports_dir {
        println!("  report: {dir}");
    }
}

fn print_mutation(outcome: &MutationOutcome) {
    println!(
        "{} committed: {} venues, sha256 {}",
        outcome.op, outcome.dataset.total_venues, outcome.sha256_after
    );
    if let Some(backup) = &outcome.backup {
        println!("  previous state backed up as {}", backup.id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(dataset) = cli.dataset {
        config.dataset_path = dataset;
    }
    if let Some(dir) = cli.fixtures {
        config = config.with_fixtures(dir);
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            print_run(&summary);
        }
        Commands::EnrichFsa { refresh } => {
            let summary = SyncPipeline::new(config)?.enrich_fsa(refresh).await?;
            print_run(&summary);
        }
        Commands::Validate => {
            let stability = config.stability_layer();
            let Some(report) = stability.validate_current().await? else {
                bail!("no dataset at {}", config.dataset_path.display());
            };
            if !report.is_valid() {
                for issue in &report.issues {
                    eprintln!("  {issue}");
                }
                bail!("dataset is invalid ({} issues)", report.issues.len());
            }
            println!("{}: {}", config.dataset_path.display(), report.summary());
        }
        Commands::Coverage { fail_below } => {
            let stability = config.stability_layer();
            let dataset = stability
                .load()
                .await?
                .with_context(|| format!("no dataset at {}", config.dataset_path.display()))?;
            let report = dataset.coverage.report();
            println!("{} venues", report.total);
            for field in &report.fields {
                println!("  {:<14} {:>5} {:>6.1}%", field.field, field.count, field.percent);
            }
            if let Some(min) = fail_below {
                let low = report.below(min);
                if !low.is_empty() {
                    let names = low.iter().map(|f| f.field.as_str()).collect::<Vec<_>>();
                    bail!("coverage below {min}% for: {}", names.join(", "));
                }
            }
        }
        Commands::Backups => {
            let backups = config.stability_layer().list_backups().await?;
            if backups.is_empty() {
                println!("no backups");
            }
            for backup in backups {
                let kind = match backup.kind {
                    BackupKind::Mutation => "",
                    BackupKind::PreRestore => "  (before rollback)",
                };
                println!("{}  {} bytes{kind}", backup.id, backup.byte_size);
            }
        }
        Commands::Rollback { backup } => {
            let stability = config.stability_layer();
            let outcome = match backup {
                Some(id) => stability.restore(&id).await?,
                None => stability.restore_latest().await?,
            };
            print_mutation(&outcome);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            run_scheduler(pipeline).await?;
        }
        Commands::Report { runs } => {
            let markdown = lvd_sync::report_recent_runs(&config.reports_dir, runs)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
