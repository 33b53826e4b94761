//! Navigation driver: owns the browser session for one run.
//!
//! The driver wraps a [`Browse`] backend and adds the policies the backend
//! should not care about: retrying the initial load, jitter around scrolls and
//! clicks, bounded per-card retries and feed-growth tracking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::extractor::PanelSnapshot;
use crate::jitter::Jitter;

/// Attempts per card before giving up on its panel.
pub const ACTIVATION_ATTEMPTS: u32 = 2;

/// A result card as seen in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultHandle {
    /// Position in the feed; the feed only ever appends
    pub index: usize,
    /// Accessible label of the card, usually the business name
    #[serde(default)]
    pub label: String,
}

impl ResultHandle {
    pub fn new(index: usize, label: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
        }
    }

    /// Identity of the card within one run.
    pub fn key(&self) -> String {
        format!("{}:{}", self.index, self.label.trim())
    }
}

/// Size of the results feed after a scroll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetrics {
    pub scroll_height: u64,
    pub result_count: usize,
}

impl FeedMetrics {
    fn grew_since(&self, previous: &FeedMetrics) -> bool {
        self.scroll_height > previous.scroll_height || self.result_count > previous.result_count
    }
}

/// Browser session seam.
///
/// Implementations perform single attempts only; retries and pacing live in
/// [`NavigationDriver`].
#[async_trait]
pub trait Browse: Send {
    /// Load the search surface for `query` and wait for the results feed.
    async fn load(&mut self, query: &str) -> anyhow::Result<()>;

    /// Cards currently rendered in the feed.
    async fn result_handles(&mut self) -> anyhow::Result<Vec<ResultHandle>>;

    /// Scroll the feed once and report its size afterwards.
    async fn scroll(&mut self) -> anyhow::Result<FeedMetrics>;

    /// Click a card and read its detail panel.
    async fn open_panel(&mut self, handle: &ResultHandle) -> anyhow::Result<PanelSnapshot>;

    /// Tear the session down. Must be safe to call more than once.
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollProgress {
    /// The feed got taller or gained cards
    pub grew: bool,
    pub metrics: FeedMetrics,
}

pub struct NavigationDriver<B: Browse> {
    browser: B,
    jitter: Jitter,
    retry_limit: u32,
    retry_backoff: Duration,
    last_metrics: Option<FeedMetrics>,
    released: bool,
}

impl<B: Browse> NavigationDriver<B> {
    pub fn new(browser: B, config: &PipelineConfig) -> Self {
        Self {
            browser,
            jitter: Jitter::new(config.min_delay, config.max_delay),
            retry_limit: config.retry_limit,
            retry_backoff: config.retry_backoff,
            last_metrics: None,
            released: false,
        }
    }

    /// Load the search surface, retrying transient failures.
    ///
    /// Makes at most `retry_limit + 1` attempts, waiting `retry_backoff * attempt`
    /// between them.
    pub async fn open(&mut self, query: &str) -> ScrapeResult<()> {
        let max_attempts = self.retry_limit.saturating_add(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!("🔄 Retry attempt {}/{}...", attempt, max_attempts);
            }

            match self.browser.load(query).await {
                Ok(()) => {
                    info!("✅ Search surface loaded on attempt {}/{}", attempt, max_attempts);
                    return Ok(());
                }
                Err(e) => {
                    warn!("❌ Attempt {}/{}: {}", attempt, max_attempts, e);
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let wait = self.backoff_delay(attempt);
                        if !wait.is_zero() {
                            info!("⏳ Waiting {:?} before retry...", wait);
                            sleep(wait).await;
                        }
                    }
                }
            }
        }

        Err(ScrapeError::Navigation {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Linear backoff after the `attempt`-th failure, saturating instead of overflowing.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }

    pub async fn enumerate_results(&mut self) -> anyhow::Result<Vec<ResultHandle>> {
        let handles = self.browser.result_handles().await?;
        debug!("Feed shows {} result cards", handles.len());
        Ok(handles)
    }

    /// Scroll once, then wait a jitter delay for lazy results to render.
    ///
    /// A failed scroll is reported as "did not grow" so the caller's
    /// no-progress counter still advances.
    pub async fn scroll_for_more(&mut self) -> ScrollProgress {
        let measured = match self.browser.scroll().await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Scroll failed: {}", e);
                None
            }
        };
        self.jitter.pause().await;

        match measured {
            Some(metrics) => {
                let grew = match &self.last_metrics {
                    Some(previous) => metrics.grew_since(previous),
                    None => true,
                };
                debug!(
                    "Feed after scroll: height {} / {} cards (grew: {})",
                    metrics.scroll_height, metrics.result_count, grew
                );
                self.last_metrics = Some(metrics);
                ScrollProgress { grew, metrics }
            }
            None => ScrollProgress {
                grew: false,
                metrics: self.last_metrics.unwrap_or_default(),
            },
        }
    }

    /// Reveal `handle`'s detail panel.
    ///
    /// Gives up after [`ACTIVATION_ATTEMPTS`] and returns an empty snapshot
    /// rather than an error: one bad card must not sink the batch.
    pub async fn activate(&mut self, handle: &ResultHandle) -> PanelSnapshot {
        for attempt in 1..=ACTIVATION_ATTEMPTS {
            match self.browser.open_panel(handle).await {
                Ok(panel) if !panel.is_empty() => {
                    self.jitter.pause().await;
                    return panel;
                }
                Ok(_) => {
                    debug!(
                        "Panel for card #{} ({}) was empty (attempt {}/{})",
                        handle.index, handle.label, attempt, ACTIVATION_ATTEMPTS
                    );
                }
                Err(e) => {
                    debug!(
                        "Panel for card #{} ({}) failed (attempt {}/{}): {}",
                        handle.index, handle.label, attempt, ACTIVATION_ATTEMPTS, e
                    );
                }
            }
            if attempt < ACTIVATION_ATTEMPTS {
                self.jitter.pause().await;
            }
        }

        warn!("Giving up on card #{} ({})", handle.index, handle.label);
        PanelSnapshot::default()
    }

    /// Close the browser session. Idempotent.
    pub async fn release(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.browser.close().await
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend that fails a configurable number of times per operation.
    #[derive(Default)]
    struct FlakyBrowser {
        load_failures: u32,
        panel_failures: u32,
        loads: Arc<AtomicU32>,
        panels: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
        metrics: Vec<FeedMetrics>,
    }

    #[async_trait]
    impl Browse for FlakyBrowser {
        async fn load(&mut self, _query: &str) -> anyhow::Result<()> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.load_failures {
                anyhow::bail!("navigation timeout");
            }
            Ok(())
        }

        async fn result_handles(&mut self) -> anyhow::Result<Vec<ResultHandle>> {
            Ok(vec![ResultHandle::new(0, "Alpha Ltd")])
        }

        async fn scroll(&mut self) -> anyhow::Result<FeedMetrics> {
            if self.metrics.is_empty() {
                anyhow::bail!("feed detached");
            }
            Ok(self.metrics.remove(0))
        }

        async fn open_panel(&mut self, handle: &ResultHandle) -> anyhow::Result<PanelSnapshot> {
            let n = self.panels.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.panel_failures {
                anyhow::bail!("element detached");
            }
            Ok(PanelSnapshot::from_text(handle.label.clone()))
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(retry_limit: u32) -> PipelineConfig {
        PipelineConfig {
            retry_limit,
            retry_backoff: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_retries_exactly_retry_limit_times() {
        let browser = FlakyBrowser {
            load_failures: u32::MAX,
            ..Default::default()
        };
        let loads = browser.loads.clone();
        let mut driver = NavigationDriver::new(browser, &config(3));

        let err = driver.open("cafes").await.unwrap_err();

        assert_eq!(loads.load(Ordering::SeqCst), 4);
        assert!(matches!(err, ScrapeError::Navigation { attempts: 4, ref last_error } if last_error == "navigation timeout"));
    }

    #[tokio::test]
    async fn test_open_recovers_from_transient_failure() {
        let browser = FlakyBrowser {
            load_failures: 2,
            ..Default::default()
        };
        let loads = browser.loads.clone();
        let mut driver = NavigationDriver::new(browser, &config(3));

        driver.open("cafes").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_extreme_retry_settings_do_not_overflow() {
        let browser = FlakyBrowser {
            load_failures: 1,
            ..Default::default()
        };
        let loads = browser.loads.clone();
        let mut driver = NavigationDriver::new(browser, &config(u32::MAX));

        driver.open("cafes").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let slow = PipelineConfig {
            retry_backoff: Duration::MAX,
            ..config(3)
        };
        let driver = NavigationDriver::new(FlakyBrowser::default(), &slow);
        assert_eq!(driver.backoff_delay(1), Duration::MAX);
        assert_eq!(driver.backoff_delay(u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_activate_retries_then_yields_empty_panel() {
        let browser = FlakyBrowser {
            panel_failures: u32::MAX,
            ..Default::default()
        };
        let panels = browser.panels.clone();
        let mut driver = NavigationDriver::new(browser, &config(0));

        let panel = driver.activate(&ResultHandle::new(3, "Beta Co")).await;
        assert!(panel.is_empty());
        assert_eq!(panels.load(Ordering::SeqCst), ACTIVATION_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_activate_second_attempt_succeeds() {
        let browser = FlakyBrowser {
            panel_failures: 1,
            ..Default::default()
        };
        let mut driver = NavigationDriver::new(browser, &config(0));

        let panel = driver.activate(&ResultHandle::new(0, "Beta Co")).await;
        assert_eq!(panel.text, "Beta Co");
    }

    #[tokio::test]
    async fn test_scroll_growth_tracking() {
        let browser = FlakyBrowser {
            metrics: vec![
                FeedMetrics { scroll_height: 1000, result_count: 7 },
                FeedMetrics { scroll_height: 1800, result_count: 7 },
                FeedMetrics { scroll_height: 1800, result_count: 7 },
            ],
            ..Default::default()
        };
        let mut driver = NavigationDriver::new(browser, &config(0));

        assert!(driver.scroll_for_more().await.grew);
        assert!(driver.scroll_for_more().await.grew);
        assert!(!driver.scroll_for_more().await.grew);
        // Backend now errors: counts as no growth, keeps the last metrics.
        let failed = driver.scroll_for_more().await;
        assert!(!failed.grew);
        assert_eq!(failed.metrics.scroll_height, 1800);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let browser = FlakyBrowser::default();
        let closes = browser.closes.clone();
        let mut driver = NavigationDriver::new(browser, &config(0));

        driver.release().await.unwrap();
        driver.release().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
