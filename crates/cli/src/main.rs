//! Pricebatch command line runner
//!
//! Loads configuration, prepares the schema and runs the pipeline over the
//! data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pricebatch_pipeline::{AppConfig, MemoryStore, Pipeline, RunReport};

#[derive(Parser, Debug)]
#[command(name = "pricebatch", version)]
#[command(about = "Ingest price CSV files in batches and report running statistics")]
struct Args {
    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the input CSV files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Rows per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,

    /// Do not create the tables before running
    #[arg(long)]
    skip_schema: bool,
}

impl Args {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config =
            AppConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.data_dir {
            config.pipeline.data_dir.clone_from(dir);
        }
        if let Some(size) = self.batch_size {
            config.pipeline.batch_size = size;
        }
        config
            .validate_config()
            .context("invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();
}

fn summarize(report: &RunReport) {
    let failed = report.failed_files();
    if let Some(metrics) = &report.metrics {
        info!(
            files = metrics.files_processed,
            rows_read = metrics.rows_read,
            rows_inserted = metrics.rows_inserted,
            stats_written = metrics.stats_written,
            failed_files = metrics.files_failed,
            total_ms = metrics.total_processing_time_us / 1000,
            avg_file_us = metrics.avg_processing_time_us,
            "Run finished"
        );
    }
    if failed > 0 {
        warn!(failed, "Some files were not ingested");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = args.load_config()?;
    info!(
        data_dir = %config.pipeline.data_dir.display(),
        batch_size = config.pipeline.batch_size,
        "Configuration loaded"
    );

    let pipeline = if args.dry_run {
        info!("Dry run: using the in-memory store");
        Pipeline::new(Arc::new(MemoryStore::new()), &config)
    } else {
        Pipeline::with_postgres(&config).context("failed to configure the database pool")?
    };

    if args.skip_schema {
        info!("Skipping schema creation");
    } else {
        info!(store = pipeline.store_name(), "Creating tables");
        pipeline
            .ensure_schema()
            .await
            .context("failed to create tables")?;
        info!("Tables are ready");
    }

    let report = pipeline.run().await.context("pipeline run failed")?;
    summarize(&report);
    Ok(())
}
