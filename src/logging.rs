use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Environment variable holding the log level override.
pub const LOG_LEVEL_ENV: &str = "EOS_VBOX_IMPORTER_LOGLEVEL";

pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

// ── LogConfig ────────────────────────────────────────────

/// Logging setup handed to the provisioner.
///
/// Nothing here touches the global dispatcher: callers scope the subscriber
/// with `WithSubscriber` or [`LogConfig::install`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub sink: LogSink,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            sink: LogSink::Stderr,
        }
    }
}

impl LogConfig {
    /// Read the level from [`LOG_LEVEL_ENV`], falling back to [`DEFAULT_LEVEL`].
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .as_deref()
            .and_then(parse_level)
            .unwrap_or(DEFAULT_LEVEL);
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Build a subscriber: our own events at `level`, everything else at warn.
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        let filter = EnvFilter::new("warn").add_directive(
            format!("eos_vbox_importer={}", self.level)
                .parse()
                .expect("valid log directive"),
        );

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(matches!(self.sink, LogSink::Stderr))
            .with_writer(self.sink.clone())
            .finish()
    }

    /// Make this config the default subscriber for the current thread until
    /// the guard is dropped.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(self.subscriber())
    }
}

/// Parse a level given either as a number (Python-style severities: 10 debug,
/// 20 info, 30 warning, 40 error, 50 critical) or as a symbolic name.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(severity) = value.parse::<i64>() {
        return Some(match severity {
            ..=0 => LevelFilter::TRACE,
            1..=10 => LevelFilter::DEBUG,
            11..=20 => LevelFilter::INFO,
            21..=30 => LevelFilter::WARN,
            31..=50 => LevelFilter::ERROR,
            _ => LevelFilter::OFF,
        });
    }

    match value.to_ascii_uppercase().as_str() {
        "NOTSET" | "TRACE" => Some(LevelFilter::TRACE),
        "DEBUG" => Some(LevelFilter::DEBUG),
        "INFO" => Some(LevelFilter::INFO),
        "WARN" | "WARNING" => Some(LevelFilter::WARN),
        "ERROR" | "CRITICAL" | "FATAL" => Some(LevelFilter::ERROR),
        "OFF" => Some(LevelFilter::OFF),
        _ => None,
    }
}

// ── LogSink ──────────────────────────────────────────────

/// Where formatted log lines go.
#[derive(Debug, Clone, Default)]
pub enum LogSink {
    #[default]
    Stderr,
    /// Collect lines in memory, for inspecting what a run reported.
    Buffer(LogBuffer),
}

/// Shared in-memory log capture.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap()).into_owned()
    }
}

/// Writer returned by `MakeWriter::make_writer`.
pub enum SinkWriter {
    Stderr(std::io::Stderr),
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SinkWriter::Stderr(stderr) => stderr.write(buf),
            SinkWriter::Buffer(inner) => {
                inner.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SinkWriter::Stderr(stderr) => stderr.flush(),
            SinkWriter::Buffer(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            LogSink::Stderr => SinkWriter::Stderr(std::io::stderr()),
            LogSink::Buffer(buffer) => SinkWriter::Buffer(buffer.inner.clone()),
        }
    }
}
