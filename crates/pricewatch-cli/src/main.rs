use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pricewatch_sync::{build_controller, run_scheduled, Observability, RunConfig};

/// Configuration comes from PRICEWATCH_* environment variables.
#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Scrape product prices and sellers into the tracking spreadsheet")]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    let config = RunConfig::from_env();
    let _observability = Observability::init(&config.log_config())?;
    let controller = build_controller(&config)?;

    if config.scheduler_enabled {
        run_scheduled(Arc::new(controller), &config.sync_cron).await?;
        return Ok(());
    }

    let report = controller.run().await?;
    println!(
        "run complete: run_id={} batch={} items={} captured={} skipped={} updated={} not_found={}",
        report.run_id,
        report.batch_stamp,
        report.items_seen,
        report.buffered,
        report.skipped.len(),
        report.reconcile.updated(),
        report.reconcile.not_found().len()
    );
    Ok(())
}
