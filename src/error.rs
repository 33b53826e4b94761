use thiserror::Error;

/// Errors that terminate a scrape run.
///
/// Transient problems (a card whose panel never renders, a scroll that fails)
/// are absorbed where they happen and never become a `ScrapeError`.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Navigation failed after {attempts} attempts. Last error: {last_error}")]
    Navigation { attempts: u32, last_error: String },
    #[error("CSV sink error: {0}")]
    Sink(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;
