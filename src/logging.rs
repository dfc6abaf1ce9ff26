use crate::frames::Frame;
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "streamkeeper.log";
pub const DEFAULT_FILTER: &str = "streamkeeper=info";

/// Installs the global subscriber: env filter, daily-rolling file output and
/// span traces for `ObservedError`. Keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init_tracing(log_dir: &Path, json: bool) -> WorkerGuard {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if json {
        fmt::layer().json().with_writer(non_blocking).boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
    {
        eprintln!("Tracing already initialized: {}", e);
    }

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-session record counts, logged once when the session ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetric {
    pub records: usize,
    pub content_fragments: usize,
    pub text_chars: usize,
    pub preamble_chars: usize,
    pub status_events: usize,
    pub source_domains: usize,
    pub routing_updates: usize,
    pub meta_records: usize,
    pub errors: usize,
    pub terminal: bool,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: &Frame) {
        self.records += 1;
        match frame {
            Frame::Content(token) => {
                self.content_fragments += 1;
                self.text_chars += token.chars().count();
            }
            Frame::PreambleDelta(text) | Frame::Preamble(text) => {
                self.preamble_chars += text.chars().count();
            }
            Frame::Status(_) => self.status_events += 1,
            Frame::SourceDomain(_) => self.source_domains += 1,
            Frame::ModelInfo(_) => self.routing_updates += 1,
            Frame::Meta(_) => self.meta_records += 1,
            Frame::Error(_) => self.errors += 1,
            Frame::Done => self.terminal = true,
        }
    }

    pub fn log_summary(&self, session: &str, outcome: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Session: {} | Outcome: {} | Records: {} | Content: {} frags / {} chars | Status: {} | Domains: {} | Meta: {} | Errors: {} | Terminal: {}",
            session,
            outcome,
            self.records,
            self.content_fragments,
            self.text_chars,
            self.status_events,
            self.source_domains,
            self.meta_records,
            self.errors,
            self.terminal
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::parse_record;

    #[test]
    fn test_metric_counts_by_kind() {
        let mut metric = StreamMetric::new();
        for line in [
            r#"{"token":"héllo"}"#,
            r#"{"token":"!"}"#,
            r#"{"status":{"type":"search_start"}}"#,
            r#"{"done":true}"#,
        ] {
            match parse_record(line) {
                Some(frame) => metric.record(&frame),
                None => panic!("fixture did not parse: {}", line),
            }
        }
        assert_eq!(metric.records, 4);
        assert_eq!(metric.content_fragments, 2);
        assert_eq!(metric.text_chars, 6);
        assert_eq!(metric.status_events, 1);
        assert!(metric.terminal);
    }
}
