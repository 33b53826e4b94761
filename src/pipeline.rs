//! Scrape pipeline orchestrator.
//!
//! Drives the navigation driver, extractor and store in one sequential loop
//! and reports every step through the event bridge. It is the only component
//! that decides to end a run.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::ScrapeResult;
use crate::events::{EventSink, ScrapeEvent};
use crate::extractor::extract;
use crate::navigator::{Browse, NavigationDriver, ResultHandle};
use crate::store::{LeadStore, Offer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Cooperative cancellation flag shared with observers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub accepted: usize,
    pub duplicates: usize,
    /// Panels without a usable name
    pub discarded: usize,
    /// Cards whose panel never rendered
    pub skipped: usize,
    pub scrolls: u32,
}

/// Why the main loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TargetReached,
    Exhausted,
    ScrollCap,
    Cancelled,
}

pub struct Pipeline<B: Browse, W: Write = File> {
    config: Arc<PipelineConfig>,
    driver: NavigationDriver<B>,
    store: LeadStore<W>,
    events: EventSink,
    stop: StopSignal,
    summary: RunSummary,
}

impl<B: Browse, W: Write + Send> Pipeline<B, W> {
    pub fn new(config: Arc<PipelineConfig>, browser: B, store: LeadStore<W>, events: EventSink) -> Self {
        let driver = NavigationDriver::new(browser, &config);
        Self {
            config,
            driver,
            store,
            events,
            stop: StopSignal::new(),
            summary: RunSummary {
                run_id: Uuid::new_v4(),
                state: PipelineState::Idle,
                accepted: 0,
                duplicates: 0,
                discarded: 0,
                skipped: 0,
                scrolls: 0,
            },
        }
    }

    /// Handle for requesting a stop from outside the worker.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Run to completion. Always releases the browser and always ends with
    /// exactly one `Done` or `Fatal` event.
    pub async fn run(mut self) -> RunSummary {
        let span = info_span!("scrape", run_id = %self.summary.run_id);
        async move {
            self.summary.state = PipelineState::Running;
            info!("Pipeline running for query '{}'", self.config.query);

            let outcome = self.drive().await;

            if let Err(e) = self.driver.release().await {
                warn!("Browser teardown failed: {}", e);
            }

            match outcome {
                Ok(reason) => {
                    self.summary.state = PipelineState::Completed;
                    let total = self.store.len();
                    info!("Run completed ({:?}) with {} leads", reason, total);
                    self.events.info(format!("Finished. {} businesses scraped.", total));
                    self.events.emit(ScrapeEvent::Done { total });
                }
                Err(e) => {
                    self.summary.state = PipelineState::Aborted;
                    error!("Run aborted: {}", e);
                    self.events.emit(ScrapeEvent::Fatal { message: e.to_string() });
                }
            }

            self.summary.accepted = self.store.len();
            self.summary
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> ScrapeResult<StopReason> {
        self.events.info("Starting browser...");
        self.driver.open(&self.config.query).await?;
        self.events.info("Results loaded");

        let mut processed: HashSet<String> = HashSet::new();
        let mut idle_steps = 0u32;

        loop {
            if let Some(reason) = self.exit_check() {
                return Ok(reason);
            }

            let handles = match self.driver.enumerate_results().await {
                Ok(handles) => handles,
                Err(e) => {
                    self.events.warn(format!("Could not list results: {}", e));
                    Vec::new()
                }
            };
            let fresh: Vec<ResultHandle> = handles
                .into_iter()
                .filter(|h| !processed.contains(&h.key()))
                .collect();
            let found_new = !fresh.is_empty();

            for handle in fresh {
                processed.insert(handle.key());
                self.process_card(&handle).await?;

                if let Some(reason) = self.exit_check() {
                    return Ok(reason);
                }
            }

            if self.summary.scrolls >= self.config.max_scrolls {
                self.events.warn(format!("Scroll limit of {} reached", self.config.max_scrolls));
                return Ok(StopReason::ScrollCap);
            }

            let progress = self.driver.scroll_for_more().await;
            self.summary.scrolls += 1;

            if progress.grew || found_new {
                idle_steps = 0;
            } else {
                idle_steps += 1;
                self.events.debug(format!(
                    "No new results after scroll ({}/{})",
                    idle_steps, self.config.max_idle_scrolls
                ));
                if idle_steps >= self.config.max_idle_scrolls {
                    self.events.info("No more results: feed exhausted");
                    return Ok(StopReason::Exhausted);
                }
            }
        }
    }

    fn exit_check(&self) -> Option<StopReason> {
        if self.store.len() >= self.config.target_count {
            return Some(StopReason::TargetReached);
        }
        if self.stop.is_requested() {
            self.events.info("Stop requested, finishing up");
            return Some(StopReason::Cancelled);
        }
        None
    }

    /// Activate, extract and offer one card. Only sink failures escape.
    async fn process_card(&mut self, handle: &ResultHandle) -> ScrapeResult<()> {
        let panel = self.driver.activate(handle).await;
        if panel.is_empty() {
            self.summary.skipped += 1;
            self.events.warn(format!(
                "Skipped card #{} ({}): detail panel did not render",
                handle.index,
                display_label(handle)
            ));
            return Ok(());
        }

        let Some(record) = extract(&panel) else {
            self.summary.discarded += 1;
            self.events.debug(format!("Discarded card #{}: no name found", handle.index));
            return Ok(());
        };

        match self.store.offer(&record)? {
            Offer::Accepted { count } => {
                self.events.info(format!("Scraped: {}", record.name));
                self.events.emit(ScrapeEvent::Progress { record, count });
            }
            Offer::Duplicate => {
                self.summary.duplicates += 1;
                self.events.info(format!("Duplicate skipped: {}", record.name));
            }
        }
        Ok(())
    }
}

fn display_label(handle: &ResultHandle) -> &str {
    if handle.label.trim().is_empty() {
        "unlabeled"
    } else {
        handle.label.trim()
    }
}
