//! Opens one result panel and dumps what the extractor sees.
//!
//! Usage: `debug-panel [query]`. Writes `debug_panel.png` next to the binary's cwd.

use anyhow::Result;
use dotenv::dotenv;

use lead_crawler::chrome::{ChromeBrowser, ChromeOptions};
use lead_crawler::{extract, Browse, PipelineConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let mut config = PipelineConfig::from_env()?;
    if let Some(query) = std::env::args().nth(1) {
        config.query = query;
    }
    println!("🕵️ Starting panel debugger for '{}'...", config.query);
    println!("URL: {}", config.search_url());

    let mut browser = ChromeBrowser::new(ChromeOptions::from_config(&config));
    let outcome = inspect(&mut browser, &config.query).await;

    println!("Capturing screenshot...");
    match browser.screenshot("debug_panel.png") {
        Ok(()) => println!("Saved debug_panel.png"),
        Err(e) => println!("Screenshot failed: {}", e),
    }

    browser.close().await?;
    outcome
}

async fn inspect(browser: &mut ChromeBrowser, query: &str) -> Result<()> {
    browser.load(query).await?;

    let handles = browser.result_handles().await?;
    println!("Feed shows {} cards:", handles.len());
    for handle in handles.iter().take(10) {
        println!("  #{} {}", handle.index, handle.label);
    }

    let Some(first) = handles.first() else {
        println!("No cards to open");
        return Ok(());
    };

    let panel = browser.open_panel(first).await?;
    println!("--- panel text ---\n{}", panel.text);
    println!("--- panel html: {} bytes, url: {:?}", panel.html.len(), panel.url);

    match extract(&panel) {
        Some(record) => println!("Extracted: {}", serde_json::to_string_pretty(&record)?),
        None => println!("Extractor found no name"),
    }
    Ok(())
}
