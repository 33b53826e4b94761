//! Run configuration.
//!
//! A `PipelineConfig` is built once (from the environment or by hand), validated,
//! and then shared read-only behind an `Arc` for the lifetime of one run.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ScrapeError, ScrapeResult};
use crate::store::DedupKey;

pub const DEFAULT_QUERY: &str = "businesses in Consett";
pub const DEFAULT_BASE_URL: &str = "https://www.google.com/maps";

/// Upper bound for `retry_limit`.
pub const MAX_RETRY_LIMIT: u32 = 20;
/// Upper bound for `retry_backoff`; the longest wait is this times `retry_limit`.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Free-text search typed into the directory surface
    pub query: String,
    /// Stop once this many distinct records were accepted
    pub target_count: usize,
    /// Lower bound of the human-timing jitter
    pub min_delay: Duration,
    /// Upper bound of the human-timing jitter
    pub max_delay: Duration,
    /// Extra attempts allowed when loading the search surface
    pub retry_limit: u32,
    /// Linear backoff unit between load attempts (`backoff * attempt`)
    pub retry_backoff: Duration,
    /// CSV sink, truncated at the start of a run
    pub output_path: PathBuf,
    pub headless: bool,
    /// Consecutive scroll steps without new results before the feed counts as exhausted
    pub max_idle_scrolls: u32,
    /// Hard cap on scroll steps per run
    pub max_scrolls: u32,
    pub page_timeout: Duration,
    pub dedup_key: DedupKey,
    pub base_url: String,
}

impl PipelineConfig {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Build from `LEAD_*` environment variables (after `dotenv` has run).
    pub fn from_env() -> ScrapeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> ScrapeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> ScrapeResult<T> {
            match raw {
                Some(v) => v
                    .parse()
                    .map_err(|_| ScrapeError::Config(format!("{} must be a number, got '{}'", key, v))),
                None => Ok(default),
            }
        }

        let headless = match parsed("LEAD_HEADLESS").as_deref() {
            None => defaults.headless,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(ScrapeError::Config(format!("LEAD_HEADLESS must be true/false, got '{}'", other)))
            }
        };

        let dedup_key = match parsed("LEAD_DEDUP_KEY") {
            Some(v) => v.parse()?,
            None => defaults.dedup_key,
        };

        let config = Self {
            query: parsed("LEAD_QUERY").unwrap_or(defaults.query),
            target_count: number("LEAD_TARGET_COUNT", parsed("LEAD_TARGET_COUNT"), defaults.target_count)?,
            min_delay: Duration::from_millis(number(
                "LEAD_MIN_DELAY_MS",
                parsed("LEAD_MIN_DELAY_MS"),
                defaults.min_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(number(
                "LEAD_MAX_DELAY_MS",
                parsed("LEAD_MAX_DELAY_MS"),
                defaults.max_delay.as_millis() as u64,
            )?),
            retry_limit: number("LEAD_RETRY_LIMIT", parsed("LEAD_RETRY_LIMIT"), defaults.retry_limit)?,
            retry_backoff: Duration::from_millis(number(
                "LEAD_RETRY_BACKOFF_MS",
                parsed("LEAD_RETRY_BACKOFF_MS"),
                defaults.retry_backoff.as_millis() as u64,
            )?),
            output_path: parsed("LEAD_OUTPUT").map(PathBuf::from).unwrap_or(defaults.output_path),
            headless,
            max_idle_scrolls: number(
                "LEAD_MAX_IDLE_SCROLLS",
                parsed("LEAD_MAX_IDLE_SCROLLS"),
                defaults.max_idle_scrolls,
            )?,
            max_scrolls: number("LEAD_MAX_SCROLLS", parsed("LEAD_MAX_SCROLLS"), defaults.max_scrolls)?,
            page_timeout: Duration::from_secs(number(
                "LEAD_PAGE_TIMEOUT_SECS",
                parsed("LEAD_PAGE_TIMEOUT_SECS"),
                defaults.page_timeout.as_secs(),
            )?),
            dedup_key,
            base_url: parsed("LEAD_BASE_URL").unwrap_or(defaults.base_url),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ScrapeResult<()> {
        if self.query.trim().is_empty() {
            return Err(ScrapeError::Config("query must not be empty".into()));
        }
        if self.target_count == 0 {
            return Err(ScrapeError::Config("target_count must be at least 1".into()));
        }
        if self.min_delay > self.max_delay {
            return Err(ScrapeError::Config(format!(
                "min_delay ({:?}) exceeds max_delay ({:?})",
                self.min_delay, self.max_delay
            )));
        }
        if self.retry_limit > MAX_RETRY_LIMIT {
            return Err(ScrapeError::Config(format!(
                "retry_limit must be at most {}, got {}",
                MAX_RETRY_LIMIT, self.retry_limit
            )));
        }
        if self.retry_backoff > MAX_RETRY_BACKOFF {
            return Err(ScrapeError::Config(format!(
                "retry_backoff must be at most {:?}, got {:?}",
                MAX_RETRY_BACKOFF, self.retry_backoff
            )));
        }
        if self.max_idle_scrolls == 0 {
            return Err(ScrapeError::Config("max_idle_scrolls must be at least 1".into()));
        }
        Ok(())
    }

    /// URL of the results feed for the configured query.
    pub fn search_url(&self) -> String {
        search_url_for(&self.base_url, &self.query)
    }
}

pub fn search_url_for(base_url: &str, query: &str) -> String {
    format!(
        "{}/search/{}?hl=en",
        base_url.trim_end_matches('/'),
        urlencoding::encode(query.trim())
    )
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            query: DEFAULT_QUERY.to_string(),
            target_count: 50,
            min_delay: Duration::from_millis(1200),
            max_delay: Duration::from_millis(2200),
            retry_limit: 3,
            retry_backoff: Duration::from_secs(5),
            output_path: PathBuf::from("leads.csv"),
            headless: true,
            max_idle_scrolls: 3,
            max_scrolls: 200,
            page_timeout: Duration::from_secs(60),
            dedup_key: DedupKey::Name,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.query, DEFAULT_QUERY);
        assert_eq!(config.target_count, 50);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.dedup_key, DedupKey::Name);
        assert!(config.headless);
    }

    #[test]
    fn test_env_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("LEAD_QUERY", "plumbers in Durham"),
            ("LEAD_TARGET_COUNT", "12"),
            ("LEAD_MIN_DELAY_MS", "100"),
            ("LEAD_MAX_DELAY_MS", "300"),
            ("LEAD_HEADLESS", "false"),
            ("LEAD_DEDUP_KEY", "name_address"),
            ("LEAD_OUTPUT", "out/durham.csv"),
        ]))
        .unwrap();

        assert_eq!(config.query, "plumbers in Durham");
        assert_eq!(config.target_count, 12);
        assert_eq!(config.min_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_millis(300));
        assert!(!config.headless);
        assert_eq!(config.dedup_key, DedupKey::NameAndAddress);
        assert_eq!(config.output_path, PathBuf::from("out/durham.csv"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_TARGET_COUNT", "lots")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_TARGET_COUNT", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[
            ("LEAD_MIN_DELAY_MS", "900"),
            ("LEAD_MAX_DELAY_MS", "100"),
        ]))
        .is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_HEADLESS", "maybe")])).is_err());
    }

    #[test]
    fn test_rejects_unbounded_retry_settings() {
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_RETRY_LIMIT", "4294967295")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_RETRY_LIMIT", "21")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_RETRY_BACKOFF_MS", "18446744073709551615")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_RETRY_BACKOFF_MS", "300001")])).is_err());

        let config = PipelineConfig::from_lookup(lookup(&[
            ("LEAD_RETRY_LIMIT", "20"),
            ("LEAD_RETRY_BACKOFF_MS", "300000"),
        ]))
        .unwrap();
        assert_eq!(config.retry_limit, MAX_RETRY_LIMIT);
        assert_eq!(config.retry_backoff, MAX_RETRY_BACKOFF);
    }

    #[test]
    fn test_search_url_encodes_query() {
        let config = PipelineConfig::new("cafés in Consett");
        assert_eq!(
            config.search_url(),
            "https://www.google.com/maps/search/caf%C3%A9s%20in%20Consett?hl=en"
        );
    }
}
