//! Headless Chrome backend for the navigation driver.
//!
//! Each method performs a single attempt over CDP. The CDP client is blocking,
//! so calls go through `block_in_place` to keep the runtime's other tasks (the
//! observer) scheduled.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Input::{
    DispatchMouseEvent, DispatchMouseEventPointer_TypeOption, DispatchMouseEventTypeOption,
};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::block_in_place;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{search_url_for, PipelineConfig};
use crate::extractor::PanelSnapshot;
use crate::jitter::Jitter;
use crate::navigator::{Browse, FeedMetrics, ResultHandle};
use crate::store::normalize;

const FEED_SELECTOR: &str = "div[role='feed']";
const PANEL_HEADING_SELECTOR: &str = "div[role='main'] h1";

// ============================================================================
// Page Scripts
// ============================================================================

const CONSENT_JS: &str = r#"
    (() => {
        const selectors = [
            'form[action*="consent"] button[aria-label*="Accept"]',
            'button[aria-label*="Accept all"]',
            'button[id*="accept"]',
            'form[action*="consent"] button:last-of-type'
        ];
        for (const selector of selectors) {
            const btn = document.querySelector(selector);
            if (btn && btn.offsetParent !== null) {
                btn.click();
                return "consent_clicked";
            }
        }
        return "no_consent";
    })();
"#;

const LIST_CARDS_JS: &str = r#"
    (() => {
        const cards = Array.from(document.querySelectorAll("div[role='article']"));
        return JSON.stringify(cards.map((card, index) => {
            const title = card.querySelector('.qBF1Pd');
            const label = card.getAttribute('aria-label') || (title ? title.textContent : '') || '';
            return { index, label: label.trim() };
        }));
    })();
"#;

const FEED_ANCHOR_JS: &str = r#"
    (() => {
        const feed = document.querySelector("div[role='feed']");
        if (!feed) return JSON.stringify(null);
        const r = feed.getBoundingClientRect();
        return JSON.stringify({ x: r.left + r.width / 2, y: r.top + Math.min(r.height / 2, 400) });
    })();
"#;

const FEED_METRICS_JS: &str = r#"
    (() => {
        const feed = document.querySelector("div[role='feed']");
        const height = feed ? feed.scrollHeight : document.body.scrollHeight;
        const count = document.querySelectorAll("div[role='article']").length;
        return JSON.stringify({ scroll_height: height, result_count: count });
    })();
"#;

/// Called as `(CLICK_CARD_FN)(index)`.
const CLICK_CARD_FN: &str = r#"
    (index) => {
        const cards = document.querySelectorAll("div[role='article']");
        const card = cards[index];
        if (!card) return "missing";
        const target = card.querySelector('a.hfpxzc') || card;
        target.scrollIntoView({ block: 'center' });
        target.click();
        return "clicked";
    }
"#;

const READ_PANEL_JS: &str = r#"
    (() => {
        const panels = Array.from(document.querySelectorAll("div[role='main']"));
        const panel = panels.reverse().find(p => p.querySelector('h1'));
        if (!panel) return JSON.stringify({ text: '', html: '', url: location.href, heading: null });
        const h1 = panel.querySelector('h1');
        return JSON.stringify({
            text: panel.innerText || '',
            html: panel.outerHTML,
            url: location.href,
            heading: h1 ? h1.innerText : null
        });
    })();
"#;

#[derive(Debug, Deserialize)]
struct PanelPayload {
    text: String,
    html: String,
    url: Option<String>,
    heading: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Anchor {
    x: f64,
    y: f64,
}

// ============================================================================
// Browser Backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub base_url: String,
    pub headless: bool,
    pub window_size: (u32, u32),
    pub page_timeout: Duration,
    /// Wait after clicking a card before its panel is read
    pub settle: Jitter,
    /// Wheel distance per scroll step, in pixels
    pub scroll_distance: (f64, f64),
}

impl ChromeOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            headless: config.headless,
            window_size: (1920, 1080),
            page_timeout: config.page_timeout,
            settle: Jitter::new(config.min_delay, config.max_delay),
            scroll_distance: (1200.0, 1800.0),
        }
    }
}

/// Chrome session driven over CDP.
///
/// The CDP client blocks, and every call runs under `block_in_place`. Drive it
/// from a multi-thread tokio runtime: a current-thread runtime (the default
/// for `#[tokio::test]`) panics on the first browser call.
pub struct ChromeBrowser {
    options: ChromeOptions,
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
}

impl ChromeBrowser {
    pub fn new(options: ChromeOptions) -> Self {
        Self {
            options,
            browser: None,
            tab: None,
        }
    }

    fn launch(&self) -> anyhow::Result<Browser> {
        let mut args = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--lang=en-US"),
        ];
        if self.options.headless {
            args.push(OsStr::new("--headless=new"));
        }

        info!("🚀 Launching Chrome (headless: {})", self.options.headless);
        Browser::new(LaunchOptions {
            // Headless mode is selected through the args above
            headless: false,
            window_size: Some(self.options.window_size),
            idle_browser_timeout: self.options.page_timeout.max(Duration::from_secs(300)),
            args,
            ..Default::default()
        })
    }

    fn ensure_tab(&mut self) -> anyhow::Result<Arc<Tab>> {
        if let Some(tab) = &self.tab {
            return Ok(tab.clone());
        }
        if self.browser.is_none() {
            let browser = block_in_place(|| self.launch())?;
            self.browser = Some(browser);
        }
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("browser not running"))?;
        let tab = block_in_place(|| browser.new_tab())?;
        tab.set_default_timeout(self.options.page_timeout);
        self.tab = Some(tab.clone());
        Ok(tab)
    }

    fn current_tab(&self) -> anyhow::Result<Arc<Tab>> {
        self.tab
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no open page; load() must succeed first"))
    }

    /// Drop the tab and browser process so the next load starts clean.
    fn reset(&mut self) {
        self.tab = None;
        self.browser = None;
    }

    async fn load_attempt(&mut self, query: &str) -> anyhow::Result<()> {
        let url = search_url_for(&self.options.base_url, query);
        let tab = self.ensure_tab()?;

        info!("Navigating to {}", url);
        block_in_place(|| -> anyhow::Result<()> {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })?;

        let consent = evaluate_string(&tab, CONSENT_JS)?;
        debug!("Consent check result: {}", consent);
        if consent == "consent_clicked" {
            info!("Consent accepted, waiting for redirect...");
            sleep(Duration::from_secs(2)).await;
            block_in_place(|| tab.wait_until_navigated().map(|_| ()))?;
        }

        let timeout = self.options.page_timeout;
        block_in_place(|| {
            tab.wait_for_element_with_custom_timeout(FEED_SELECTOR, timeout)
                .map(|_| ())
        })?;
        Ok(())
    }

    /// Save a PNG of the current page, for selector debugging.
    pub fn screenshot(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let tab = self.current_tab()?;
        let png = block_in_place(|| tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true))?;
        std::fs::write(path.as_ref(), png)?;
        info!("📸 Screenshot saved to {}", path.as_ref().display());
        Ok(())
    }
}

#[async_trait]
impl Browse for ChromeBrowser {
    async fn load(&mut self, query: &str) -> anyhow::Result<()> {
        let result = self.load_attempt(query).await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    async fn result_handles(&mut self) -> anyhow::Result<Vec<ResultHandle>> {
        let tab = self.current_tab()?;
        evaluate_json(&tab, LIST_CARDS_JS)
    }

    async fn scroll(&mut self) -> anyhow::Result<FeedMetrics> {
        let tab = self.current_tab()?;
        let anchor: Option<Anchor> = evaluate_json(&tab, FEED_ANCHOR_JS)?;

        match anchor {
            Some(anchor) => {
                let (low, high) = self.options.scroll_distance;
                let distance = rand::thread_rng().gen_range(low..high);
                wheel(&tab, anchor.x, anchor.y, distance).await?;
            }
            None => {
                warn!("No results feed on page, scrolling the window instead");
                block_in_place(|| tab.evaluate("window.scrollBy(0, window.innerHeight * 0.8);", false))?;
            }
        }

        // Give the lazy loader a moment before measuring
        sleep(Duration::from_millis(300)).await;
        evaluate_json(&tab, FEED_METRICS_JS)
    }

    async fn open_panel(&mut self, handle: &ResultHandle) -> anyhow::Result<PanelSnapshot> {
        let tab = self.current_tab()?;

        let script = format!("({})({})", CLICK_CARD_FN, handle.index);
        let clicked = evaluate_string(&tab, &script)?;
        if clicked != "clicked" {
            anyhow::bail!("card #{} is no longer in the feed", handle.index);
        }

        self.options.settle.pause().await;
        block_in_place(|| {
            tab.wait_for_element_with_custom_timeout(PANEL_HEADING_SELECTOR, Duration::from_secs(10))
                .map(|_| ())
        })?;

        let payload: PanelPayload = evaluate_json(&tab, READ_PANEL_JS)?;

        // The panel of the previously clicked card can linger for a moment.
        if let Some(heading) = payload.heading.as_deref().map(normalize).filter(|h| !h.is_empty()) {
            let label = normalize(&handle.label);
            if !label.is_empty() && !label.contains(&heading) && !heading.contains(&label) {
                anyhow::bail!("panel still shows '{}' instead of '{}'", heading, handle.label);
            }
        }

        Ok(PanelSnapshot {
            text: payload.text,
            html: payload.html,
            url: payload.url,
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(tab) = self.tab.take() {
            if let Err(e) = block_in_place(|| tab.close(true)) {
                debug!("Tab close failed: {}", e);
            }
        }
        if self.browser.take().is_some() {
            info!("🧹 Browser session closed");
        }
        Ok(())
    }
}

// ============================================================================
// CDP Helpers
// ============================================================================

/// Run a script that returns a string.
fn evaluate_string(tab: &Arc<Tab>, script: &str) -> anyhow::Result<String> {
    let result = block_in_place(|| tab.evaluate(script, false))?;
    match result.value {
        Some(serde_json::Value::String(s)) => Ok(s),
        other => Err(anyhow::anyhow!("script returned {:?} instead of a string", other)),
    }
}

/// Run a script that returns `JSON.stringify(...)` and decode it.
fn evaluate_json<T: DeserializeOwned>(tab: &Arc<Tab>, script: &str) -> anyhow::Result<T> {
    let raw = evaluate_string(tab, script)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Human-like wheel scroll over a point using trusted CDP events.
async fn wheel(tab: &Arc<Tab>, x: f64, y: f64, distance: f64) -> anyhow::Result<()> {
    let steps = 10;
    let step_size = distance / steps as f64;

    for _ in 0..steps {
        block_in_place(|| {
            tab.call_method(DispatchMouseEvent {
                Type: DispatchMouseEventTypeOption::MouseWheel,
                x,
                y,
                button: None,
                buttons: None,
                modifiers: None,
                timestamp: None,
                delta_x: Some(0.0),
                delta_y: Some(step_size),
                pointer_Type: Some(DispatchMouseEventPointer_TypeOption::Mouse),
                force: None,
                tangential_pressure: None,
                tilt_x: None,
                tilt_y: None,
                twist: None,
                click_count: None,
            })
        })?;

        let delay = rand::thread_rng().gen_range(50..150);
        sleep(Duration::from_millis(delay)).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_config() {
        let config = PipelineConfig {
            headless: false,
            base_url: "http://localhost:8080/maps".into(),
            ..Default::default()
        };
        let options = ChromeOptions::from_config(&config);
        assert!(!options.headless);
        assert_eq!(options.base_url, "http://localhost:8080/maps");
        assert_eq!(options.settle.min(), config.min_delay);
        assert_eq!(options.settle.max(), config.max_delay);
    }

    #[test]
    fn test_click_script_is_an_invocation() {
        let script = format!("({})({})", CLICK_CARD_FN, 7);
        assert!(script.trim_end().ends_with("(7)"));
        assert!(script.contains("div[role='article']"));
    }

    #[test]
    fn test_panel_payload_decodes() {
        let payload: PanelPayload = serde_json::from_str(
            r#"{"text":"Alpha Ltd\n01207 123456","html":"<h1>Alpha Ltd</h1>","url":"https://maps.example/place","heading":"Alpha Ltd"}"#,
        )
        .unwrap();
        assert_eq!(payload.heading.as_deref(), Some("Alpha Ltd"));
        assert_eq!(payload.url.as_deref(), Some("https://maps.example/place"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_calls_before_load_fail_cleanly() {
        let mut browser = ChromeBrowser::new(ChromeOptions::from_config(&PipelineConfig::default()));
        assert!(browser.result_handles().await.is_err());
        assert!(browser.open_panel(&ResultHandle::new(0, "x")).await.is_err());
        browser.close().await.unwrap();
    }
}
