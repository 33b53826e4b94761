//! Event bridge between the scrape worker and its observers.
//!
//! The worker only ever pushes; observers only ever drain. The queue is FIFO
//! and lossless, so observers see events in exactly the order they were made.

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::extractor::LeadRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScrapeEvent {
    Log { message: String, severity: Severity },
    /// A record that is already durable in the sink
    Progress { record: LeadRecord, count: usize },
    Done { total: usize },
    Fatal { message: String },
}

impl ScrapeEvent {
    /// `Done` and `Fatal` end a run; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScrapeEvent::Done { .. } | ScrapeEvent::Fatal { .. })
    }
}

/// Create a connected sender/receiver pair.
pub fn event_bridge() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink { tx },
        EventStream {
            rx,
            disconnected: false,
        },
    )
}

/// Producer half, owned by the worker.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<ScrapeEvent>,
}

impl EventSink {
    /// Never blocks. An observer that went away is not the worker's problem.
    pub fn emit(&self, event: ScrapeEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event dropped: no observer attached");
        }
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        self.emit(ScrapeEvent::Log {
            message: message.into(),
            severity,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Severity::Warn, message);
    }
}

/// Consumer half, owned by the observer.
#[derive(Debug)]
pub struct EventStream {
    rx: UnboundedReceiver<ScrapeEvent>,
    disconnected: bool,
}

impl EventStream {
    /// Take everything queued right now without waiting.
    pub fn drain(&mut self) -> Vec<ScrapeEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        events
    }

    /// Wait for the next event; `None` once the worker side is gone and the queue is empty.
    pub async fn next(&mut self) -> Option<ScrapeEvent> {
        let event = self.rx.recv().await;
        if event.is_none() {
            self.disconnected = true;
        }
        event
    }

    /// True once every sender was dropped and the queue has been emptied.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}
