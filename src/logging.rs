use crate::types::{ChatEvent, RequestId, Result};
use colored::*;
use std::panic;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatflow=info,sqlx=warn"))
}

/// Initialize the tracing subscriber. With a log file the writer is
/// non-blocking; the returned guard must stay alive for the process lifetime
/// or buffered lines are lost.
pub fn init(log_file: Option<&str>) -> Result<Option<WorkerGuard>> {
    match log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = match path.file_name() {
                Some(f) => f.to_owned(),
                None => std::ffi::OsString::from("chatflow.log"),
            };
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
            Ok(None)
        }
    }
}

/// Route panics through tracing so they land in the same sink as everything
/// else before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters recorded by the accumulator and summarized once when
/// the stream ends.
#[derive(Default)]
pub struct StreamMetric {
    pub events: usize,
    pub chunks: usize,
    pub text_chars: usize,
    pub thinking_chars: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &ChatEvent) {
        self.events += 1;
        match event {
            ChatEvent::Chunk { content } => {
                self.chunks += 1;
                self.text_chars += content.len();
            }
            ChatEvent::Thinking { content } => {
                self.thinking_chars += content.len();
            }
            _ => {}
        }
    }

    pub fn log_summary(&self, request_id: &RequestId) {
        if self.events > 0 && self.chunks == 0 {
            warn!(
                "{}",
                format!(
                    "[STREAM END] req={} produced events but no text",
                    request_id.short()
                )
                .red()
                .bold()
            );
            return;
        }
        info!(
            "[STREAM END] req={} | Events: {} | Chunks: {} | Text: {} chars | Thinking: {} chars",
            request_id.short(),
            self.events,
            self.chunks,
            self.text_chars,
            self.thinking_chars
        );
    }
}
