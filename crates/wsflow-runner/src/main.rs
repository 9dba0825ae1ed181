//! # wsflow-runner
//!
//! Runs every feed of a JSON configuration file: opens and subscribes all
//! channel × pair streams, logs each decoded record, and shuts the pipelines
//! down cleanly on Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! wsflow-runner config.json --log-level debug --log-dir /tmp/wsflow
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use tracing::{error, info, warn};
use wsflow_stream::{MultiStreamAggregator, StreamRecord};

/// WebSocket stream aggregation runner.
#[derive(Parser)]
#[command(name = "wsflow-runner", about = "WebSocket stream aggregation runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log directory for daily-rotating file output. Overrides the config file.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration and initialize logging
    let config = wsflow_core::config::load_config(&cli.config)?;
    let mut logging = config.logging.clone();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    if let Some(dir) = cli.log_dir {
        logging.dir = Some(dir);
    }
    wsflow_core::logging::init_logging(&logging);

    info!("wsflow-runner starting, config={}, {} feed(s)", cli.config.display(), config.feeds.len());

    // 2. Build one aggregator per feed
    let mut feeds: Vec<MultiStreamAggregator<StreamRecord>> = Vec::new();
    for (idx, feed) in config.feeds.iter().enumerate() {
        match wsflow_stream::registry::create_feed(feed) {
            Ok(aggregator) => {
                info!("feed[{idx}]: created '{}' ({} stream(s))", feed.name, aggregator.stream_keys().len());
                feeds.push(aggregator);
            }
            Err(e) => error!("feed[{idx}]: failed to create '{}': {e}", feed.name),
        }
    }

    // 3. Subscribe, start, and consume every feed
    let mut consumers = Vec::new();
    for aggregator in &mut feeds {
        let failed = aggregator.subscribe().await;
        if !failed.is_empty() {
            warn!("{} stream(s) failed to subscribe and were dropped", failed.len());
        }
        aggregator.start_stream();

        let mut records = Box::pin(aggregator.output().into_stream());
        consumers.push(tokio::spawn(async move {
            let mut count = 0u64;
            while let Some(record) = records.next().await {
                count += 1;
                info!("{record}");
            }
            count
        }));
    }

    info!("all {} feed(s) started, press Ctrl+C to stop", feeds.len());

    // 4. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 5. Stop all feeds; consumers end once the outputs are drained
    for aggregator in &feeds {
        aggregator.stop_stream().await;
    }
    for consumer in consumers {
        match consumer.await {
            Ok(count) => info!("consumer finished after {count} record(s)"),
            Err(e) => error!("consumer task failed: {e}"),
        }
    }

    info!("all feeds stopped, goodbye");
    Ok(())
}
