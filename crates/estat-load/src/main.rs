//! estat-load - command-line entry point

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use estat_common::logging::{init_logging, LogConfig, LogLevel};
use estat_load::config::AppConfig;
use estat_load::models::{LoadStrategy, Representation};
use estat_load::pipeline::{self, PipelineOutcome};
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(
    name = "estat-load",
    version,
    about = "Download, transform and load Eurostat datasets into a database"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (debug-level logging)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingestion pipeline for a single dataset
    Run {
        /// Eurostat dataset identifier (e.g. 'nama_10_gdp')
        #[arg(short = 'd', long)]
        dataset_id: String,

        /// Emit dimension codes ('standard') or code-list labels ('full')
        #[arg(short = 'r', long, value_enum, default_value_t = Representation::Standard)]
        representation: Representation,

        /// Replace the dataset ('full') or load only when newer ('delta')
        #[arg(short = 's', long, value_enum, default_value_t = LoadStrategy::Full)]
        load_strategy: LoadStrategy,
    },

    /// Run a delta pipeline for every managed dataset
    UpdateAll {
        /// YAML file listing dataset ids under a 'datasets' key
        #[arg(long, default_value = "managed_datasets.yml")]
        datasets_file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });
    let _ = init_logging(&log_config);

    process::exit(execute(cli).await);
}

async fn execute(cli: Cli) -> i32 {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            eprintln!("Error: {e}");
            return 2;
        },
    };

    match cli.command {
        Commands::Run {
            dataset_id,
            representation,
            load_strategy,
        } => {
            tokio::select! {
                result = pipeline::run_pipeline(&dataset_id, representation, load_strategy, &config) => {
                    match result {
                        Ok(PipelineOutcome::Loaded { rows_loaded }) => {
                            println!("Pipeline for {dataset_id} completed: {rows_loaded} rows loaded.");
                            0
                        },
                        Ok(PipelineOutcome::SkippedUpToDate) => {
                            println!("Dataset {dataset_id} is already up to date.");
                            0
                        },
                        Err(e) => {
                            eprintln!("Pipeline for {dataset_id} failed: {e}");
                            1
                        },
                    }
                },
                // Dropping the pipeline future interrupts in-flight network
                // and database operations at their next await point. Any
                // orphaned staging table is reaped on the next prepare.
                _ = tokio::signal::ctrl_c() => {
                    warn!(dataset_id, "cancelled by signal");
                    eprintln!("Cancelled.");
                    130
                },
            }
        },

        Commands::UpdateAll { datasets_file } => {
            tokio::select! {
                result = pipeline::run_batch_update(&datasets_file, &config) => {
                    match result {
                        Ok(summary) => {
                            println!(
                                "Batch update finished: {} updated, {} skipped, {} failed.",
                                summary.updated, summary.skipped, summary.failed
                            );
                            if summary.failed > 0 { 1 } else { 0 }
                        },
                        Err(e) => {
                            eprintln!("Batch update failed: {e}");
                            1
                        },
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    warn!("cancelled by signal");
                    eprintln!("Cancelled.");
                    130
                },
            }
        },
    }
}
