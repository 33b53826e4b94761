use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lead_crawler::chrome::{ChromeBrowser, ChromeOptions};
use lead_crawler::observer::{watch, ConsoleObserver, POLL_INTERVAL};
use lead_crawler::{event_bridge, LeadStore, Pipeline, PipelineConfig, PipelineState};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lead_crawler=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = PipelineConfig::from_env().context("invalid configuration")?;
    if let Some(query) = std::env::args().nth(1).filter(|q| !q.trim().is_empty()) {
        config.query = query;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        "Scraping up to {} leads for '{}' into {}",
        config.target_count,
        config.query,
        config.output_path.display()
    );

    let store = LeadStore::create(&config.output_path, config.dedup_key)
        .with_context(|| format!("cannot open {}", config.output_path.display()))?;
    let browser = ChromeBrowser::new(ChromeOptions::from_config(&config));
    let (sink, mut stream) = event_bridge();

    let pipeline = Pipeline::new(config.clone(), browser, store, sink);
    let stop = pipeline.stop_signal();
    let worker = tokio::spawn(pipeline.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received, stopping after the current card...");
            stop.request_stop();
        }
    });

    let mut console = ConsoleObserver::stdout();
    let Some(summary) = watch(worker, &mut stream, &mut console, POLL_INTERVAL).await else {
        anyhow::bail!("scrape worker crashed");
    };
    info!(
        "Run {} finished: {} saved, {} duplicates, {} discarded, {} skipped, {} scrolls",
        summary.run_id, summary.accepted, summary.duplicates, summary.discarded, summary.skipped, summary.scrolls
    );

    if summary.state == PipelineState::Aborted {
        anyhow::bail!("scrape aborted after saving {} leads", summary.accepted);
    }
    Ok(())
}
