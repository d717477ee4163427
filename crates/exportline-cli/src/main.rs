use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use exportline_storage::{DownloadBaseline, DownloadOutcome, DownloadWatcher};
use exportline_sync::{
    build_pipeline_from_env, load_workload, serve_schedule, MemoryDatastore, PgDatastore,
    SchemaRouter, SyncConfig, SyncPipeline, SyncRunSummary,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "exportline")]
#[command(about = "Acquire portal report exports and load them into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Trigger, await, download and load every configured report.
    Run,
    /// Load an existing directory of downloaded archives and CSV files.
    Ingest {
        dir: PathBuf,
        /// Record store operations in memory instead of writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which table a file name would be loaded into.
    Route { filename: String },
    /// Wait for a browser download in DIR to finish.
    Watch { dir: PathBuf },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

fn print_summary(label: &str, summary: &SyncRunSummary) {
    println!(
        "{label} complete: run_id={} reports={} files={} loaded={} skipped={} failed={} rows={} report_dir={}",
        summary.run_id,
        summary.reports_acquired,
        summary.files_discovered,
        summary.files_loaded,
        summary.files_skipped,
        summary.files_failed,
        summary.rows_inserted,
        summary.report_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "exportline starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = build_pipeline_from_env().await?.run_once().await?;
            print_summary("run", &summary);
        }
        Commands::Ingest { dir, dry_run } => {
            let config = SyncConfig::from_env();
            let workload = load_workload(&config.workload_path).await?;
            if dry_run {
                let store = Arc::new(MemoryDatastore::new());
                let pipeline = SyncPipeline::new(config, workload, store.clone());
                let summary = pipeline.ingest_directory(&dir).await?;
                print_summary("dry run", &summary);
                println!("{}", serde_json::to_string_pretty(&store.ops().await)?);
            } else {
                let store = PgDatastore::connect(&config.database_url).await?;
                let pipeline = SyncPipeline::new(config, workload, Arc::new(store));
                let summary = pipeline.ingest_directory(&dir).await?;
                print_summary("ingest", &summary);
            }
        }
        Commands::Route { filename } => {
            let config = SyncConfig::from_env();
            let workload = load_workload(&config.workload_path).await?;
            let router = SchemaRouter::new(workload.schemas);
            match router.route(&filename) {
                Some(schema) => println!(
                    "{filename} -> {} (keyword {:?}, columns {})",
                    schema.table_name,
                    schema.match_keyword,
                    schema.columns.join(", ")
                ),
                None => println!("{filename} -> no matching schema; file would be skipped"),
            }
            for shadow in router.shadowed_schemas() {
                println!(
                    "warning: keyword {:?} ({}) is shadowed by earlier keyword {:?}",
                    shadow.shadowed_keyword, shadow.shadowed_table, shadow.shadowing_keyword
                );
            }
        }
        Commands::Watch { dir } => {
            let config = SyncConfig::from_env();
            let watcher = DownloadWatcher::new(dir, config.watcher_config());
            match watcher.wait_for_completion(&DownloadBaseline::empty()).await? {
                DownloadOutcome::Completed { files } => {
                    for file in files {
                        println!("complete: {}", file.display());
                    }
                }
                DownloadOutcome::TimedOutProceeding(warning) => println!("warning: {warning}"),
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline_from_env().await?);
            serve_schedule(pipeline).await?;
        }
    }

    Ok(())
}
