//! Observer side of the event bridge.
//!
//! Observers poll the stream on a fixed interval and render whatever is
//! queued. They never touch the browser or the sink.

use std::io::Write;
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::events::{EventStream, ScrapeEvent, Severity};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait Observer {
    fn on_event(&mut self, event: &ScrapeEvent);
}

/// Renders events as timestamped console lines.
pub struct ConsoleObserver<W: Write> {
    out: W,
    min_severity: Severity,
    rows: usize,
}

impl ConsoleObserver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ConsoleObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            min_severity: Severity::Info,
            rows: 0,
        }
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: String) {
        // A closed stdout is not worth aborting the run over.
        if writeln!(self.out, "{}", text).is_err() {
            warn!("Console observer lost its output");
        }
    }
}

impl<W: Write> Observer for ConsoleObserver<W> {
    fn on_event(&mut self, event: &ScrapeEvent) {
        match event {
            ScrapeEvent::Log { message, severity } => {
                if *severity >= self.min_severity {
                    let stamp = Local::now().format("%H:%M:%S");
                    self.line(format!("[{}] {:<5} {}", stamp, severity, message));
                }
            }
            ScrapeEvent::Progress { record, count } => {
                self.rows += 1;
                self.line(format!(
                    "{:>4} | {} | {} | {} | {}",
                    count, record.name, record.phone, record.website, record.address
                ));
            }
            ScrapeEvent::Done { total } => {
                self.line(format!("✅ Done: {} leads saved", total));
            }
            ScrapeEvent::Fatal { message } => {
                self.line(format!("❌ Fatal: {}", message));
                eprintln!("Scrape failed: {}", message);
            }
        }
        if let Err(e) = self.out.flush() {
            warn!("Console observer could not flush: {}", e);
        }
    }
}

/// Poll `stream` every `every` until a terminal event arrives.
///
/// Returns the terminal event, or `None` if the worker went away without one.
pub async fn observe<O: Observer>(
    stream: &mut EventStream,
    observer: &mut O,
    every: Duration,
) -> Option<ScrapeEvent> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        for event in stream.drain() {
            observer.on_event(&event);
            if event.is_terminal() {
                return Some(event);
            }
        }

        if stream.is_disconnected() {
            warn!("Worker stopped without a final event");
            return None;
        }
    }
}

/// Observe `stream` until the run ends, then join `worker`.
///
/// A worker that dies without a terminal event (a panic, a cancelled task) is
/// rendered as `Fatal`, so the observer always sees exactly one terminal event.
pub async fn watch<T, O: Observer>(
    worker: JoinHandle<T>,
    stream: &mut EventStream,
    observer: &mut O,
    every: Duration,
) -> Option<T> {
    let terminal = observe(stream, observer, every).await;

    match worker.await {
        Ok(value) => {
            if terminal.is_none() {
                observer.on_event(&ScrapeEvent::Fatal {
                    message: "worker stopped without reporting a result".to_string(),
                });
            }
            Some(value)
        }
        Err(e) => {
            if terminal.is_none() {
                observer.on_event(&ScrapeEvent::Fatal {
                    message: format!("worker crashed: {}", e),
                });
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bridge;
    use crate::extractor::LeadRecord;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<ScrapeEvent>,
    }

    impl Observer for Recorder {
        fn on_event(&mut self, event: &ScrapeEvent) {
            self.seen.push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_observe_stops_at_terminal_event() {
        let (sink, mut stream) = event_bridge();
        sink.info("Results loaded");
        sink.emit(ScrapeEvent::Done { total: 0 });
        sink.info("never rendered");

        let mut recorder = Recorder::default();
        let last = observe(&mut stream, &mut recorder, Duration::from_millis(5)).await;

        assert_eq!(last, Some(ScrapeEvent::Done { total: 0 }));
        assert_eq!(recorder.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_observe_returns_when_worker_vanishes() {
        let (sink, mut stream) = event_bridge();
        let worker = tokio::spawn(async move {
            sink.warn("about to crash");
        });
        worker.await.unwrap();

        let mut recorder = Recorder::default();
        let last = observe(&mut stream, &mut recorder, Duration::from_millis(5)).await;

        assert!(last.is_none());
        assert_eq!(recorder.seen.len(), 1);
    }

    #[tokio::test]
    async fn test_observe_picks_up_events_across_ticks() {
        let (sink, mut stream) = event_bridge();
        let worker = tokio::spawn(async move {
            for count in 1..=3 {
                sink.emit(ScrapeEvent::Progress {
                    record: LeadRecord::new(format!("Lead {}", count)),
                    count,
                });
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            sink.emit(ScrapeEvent::Done { total: 3 });
        });

        let mut recorder = Recorder::default();
        let last = observe(&mut stream, &mut recorder, Duration::from_millis(2)).await;
        worker.await.unwrap();

        assert_eq!(last, Some(ScrapeEvent::Done { total: 3 }));
        assert_eq!(recorder.seen.len(), 4);
    }

    #[tokio::test]
    async fn test_watch_renders_crashed_worker_as_fatal() {
        let (sink, mut stream) = event_bridge();
        let worker = tokio::spawn(async move {
            sink.info("Starting browser...");
            let attempts: u32 = std::hint::black_box(u32::MAX);
            attempts.checked_add(1).expect("attempt counter overflow")
        });

        let mut recorder = Recorder::default();
        let result = watch(worker, &mut stream, &mut recorder, Duration::from_millis(5)).await;

        assert!(result.is_none());
        assert_eq!(recorder.seen.len(), 2);
        match recorder.seen.last() {
            Some(ScrapeEvent::Fatal { message }) => assert!(message.contains("worker crashed")),
            other => panic!("expected Fatal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_passes_through_normal_completion() {
        let (sink, mut stream) = event_bridge();
        let worker = tokio::spawn(async move {
            sink.emit(ScrapeEvent::Done { total: 2 });
            2usize
        });

        let mut recorder = Recorder::default();
        let result = watch(worker, &mut stream, &mut recorder, Duration::from_millis(5)).await;

        assert_eq!(result, Some(2));
        assert_eq!(recorder.seen, vec![ScrapeEvent::Done { total: 2 }]);
    }

    /// Accepts writes, refuses to flush.
    struct StuckPipe(Vec<u8>);

    impl Write for StuckPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn test_flush_failure_is_not_fatal() {
        let mut console = ConsoleObserver::new(StuckPipe(Vec::new()));
        console.on_event(&ScrapeEvent::Progress {
            record: LeadRecord::new("Alpha Ltd"),
            count: 1,
        });
        console.on_event(&ScrapeEvent::Done { total: 1 });

        assert_eq!(console.rows(), 1);
        assert!(String::from_utf8(console.into_inner().0).unwrap().contains("Alpha Ltd"));
    }

    #[test]
    fn test_console_rendering() {
        let mut console = ConsoleObserver::new(Vec::new());
        console.on_event(&ScrapeEvent::Log {
            message: "Starting browser...".into(),
            severity: Severity::Info,
        });
        console.on_event(&ScrapeEvent::Log {
            message: "noise".into(),
            severity: Severity::Debug,
        });
        let mut record = LeadRecord::new("Alpha Ltd");
        record.phone = "01207 111222".into();
        console.on_event(&ScrapeEvent::Progress { record, count: 1 });
        console.on_event(&ScrapeEvent::Done { total: 1 });

        assert_eq!(console.rows(), 1);
        let out = String::from_utf8(console.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("INFO  Starting browser..."));
        assert!(lines[0].starts_with('['));
        assert_eq!(lines[1], "   1 | Alpha Ltd | 01207 111222 | N/A | N/A");
        assert!(lines[2].contains("1 leads saved"));
    }
}
