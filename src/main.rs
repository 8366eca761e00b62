use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use listing_geocoder::{init_tracing, run, AppConfig, BatchOptions, BatchSummary};

/// Geocode listing addresses that are missing from the location cache.
#[derive(Parser, Debug)]
#[command(name = "geocode-listings", version)]
struct Cli {
    /// Maximum addresses to process this run (0 = no cap)
    #[arg(long, value_name = "N")]
    limit: Option<u32>,

    /// Consider every listing file, not only the latest per source
    #[arg(long)]
    all_batches: bool,

    /// Delay between provider requests in milliseconds
    #[arg(long, value_name = "MS")]
    delay_ms: Option<u64>,

    /// Locality appended to every address before lookup
    #[arg(long, value_name = "TEXT")]
    locality: Option<String>,

    /// List pending addresses without geocoding or writing
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(limit) = self.limit {
            config.batch.limit = (limit > 0).then_some(limit);
        }
        if self.all_batches {
            config.batch.latest_only = false;
        }
        if let Some(delay) = self.delay_ms {
            config.batch.request_delay = Duration::from_millis(delay);
        }
        if let Some(locality) = &self.locality {
            config.geocoding.locality = locality.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match try_main(&cli).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: &Cli) -> anyhow::Result<BatchSummary> {
    let mut config = AppConfig::from_env().context("invalid configuration")?;
    cli.apply(&mut config);

    let mut options = BatchOptions::from_settings(&config.batch);
    options.dry_run = cli.dry_run;

    run(&config, options)
        .await
        .context("geocoding run could not start")
}

fn print_summary(summary: &BatchSummary) {
    let rule = "=".repeat(60);
    println!("{rule}");
    if summary.dry_run {
        println!("DRY RUN: {} addresses pending", summary.pending);
        for address in &summary.pending_addresses {
            println!("  {address}");
        }
    } else {
        println!("GEOCODING COMPLETE");
        println!("Successfully geocoded and cached: {}", summary.succeeded);
        println!("Failed: {}", summary.failed);
        println!("Total processed: {}", summary.succeeded + summary.failed);
    }
    for failure in &summary.failures {
        println!("  {} [{}] {}", failure.address, failure.stage.as_str(), failure.reason);
    }
    println!("{rule}");
}
