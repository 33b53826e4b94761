pub mod chrome;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod jitter;
pub mod navigator;
pub mod observer;
pub mod pipeline;
pub mod store;

pub use config::PipelineConfig;
pub use error::{ScrapeError, ScrapeResult};
pub use events::{event_bridge, EventSink, EventStream, ScrapeEvent, Severity};
pub use extractor::{extract, LeadRecord, PanelSnapshot};
pub use navigator::{Browse, NavigationDriver, ResultHandle};
pub use pipeline::{Pipeline, PipelineState, RunSummary, StopSignal};
pub use store::{DedupKey, LeadStore, Offer};
