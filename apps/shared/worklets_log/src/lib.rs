//! Centralized logging for worklet hosts
//!
//! Provides a custom formatter for tracing that:
//! - Formats thread IDs as #N instead of ThreadId(N)
//! - Extracts `runtime_name` and `runtime_id` fields to display as `worklet::ui#1`
//! - Strips common prefixes from targets for cleaner output
//! - Writes to stdout or stderr, so a host can keep stdout for its own output
//! - Filters external dependency logs based on `WORKLETS_LOGDEPS` environment variable
//!
//! # Environment Variables
//!
//! - `WORKLETS_LOGDEPS`: Set to `1` to enable logging from external dependencies.
//!   Default is `0` which only shows logs from the worklets crates.
//!
//! # Usage
//!
//! ```rust,ignore
//! use worklets_log::{init_logging, LogConfig, LogStream};
//! use tracing::Level;
//!
//! let config = LogConfig::new("worklets_host::")
//!     .with_stream(LogStream::Stderr)
//!     .with_level(Level::DEBUG);
//! init_logging(config)?;
//! ```

use std::fmt as std_fmt;
use std::io::{self, Write};
use tracing::Level;
use tracing::field::Field;
use tracing_subscriber::field::Visit;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::{
    self, FmtContext, FormatEvent, FormatFields, MakeWriter, format::Writer,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Console stream the log output goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
}

impl LogStream {
    fn atty_stream(self) -> atty::Stream {
        match self {
            LogStream::Stdout => atty::Stream::Stdout,
            LogStream::Stderr => atty::Stream::Stderr,
        }
    }
}

/// Writer handed out by [`ConsoleWriter`]
pub enum ConsoleHandle {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
}

impl Write for ConsoleHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ConsoleHandle::Stdout(out) => out.write(buf),
            ConsoleHandle::Stderr(err) => err.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ConsoleHandle::Stdout(out) => out.flush(),
            ConsoleHandle::Stderr(err) => err.flush(),
        }
    }
}

/// A MakeWriter for the configured console stream
#[derive(Debug, Clone, Copy)]
pub struct ConsoleWriter {
    stream: LogStream,
}

impl ConsoleWriter {
    pub fn new(stream: LogStream) -> Self {
        Self { stream }
    }
}

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = ConsoleHandle;

    fn make_writer(&'a self) -> Self::Writer {
        match self.stream {
            LogStream::Stdout => ConsoleHandle::Stdout(io::stdout()),
            LogStream::Stderr => ConsoleHandle::Stderr(io::stderr()),
        }
    }
}

/// Field extractor for runtime_name, runtime_id, engine and message fields
///
/// Used by the custom formatter to detect runtime-related log messages
/// and format them as `worklet::name#id: message`.
#[derive(Default)]
pub struct FieldExtractor {
    pub runtime_name: Option<String>,
    pub runtime_id: Option<u64>,
    pub engine: Option<String>,
    pub message: Option<String>,
}

impl FieldExtractor {
    /// The `worklet::name#id` label, if the event carries a runtime name
    pub fn runtime_label(&self) -> Option<String> {
        let name = self.runtime_name.as_ref()?;
        Some(match self.runtime_id {
            Some(id) => format!("worklet::{}#{}", name, id),
            None => format!("worklet::{}", name),
        })
    }
}

impl Visit for FieldExtractor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "runtime_name" => self.runtime_name = Some(value.to_string()),
            "engine" => self.engine = Some(value.to_string()),
            "message" => self.message = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "runtime_id" {
            self.runtime_id = Some(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "runtime_id" {
            self.runtime_id = u64::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std_fmt::Debug) {
        match field.name() {
            "runtime_name" => {
                self.runtime_name = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            "runtime_id" => self.runtime_id = format!("{:?}", value).parse().ok(),
            "engine" => self.engine = Some(format!("{:?}", value).trim_matches('"').to_string()),
            "message" => self.message = Some(format!("{:?}", value).trim_matches('"').to_string()),
            _ => {}
        }
    }
}

/// Custom event formatter for worklet hosts
///
/// Features:
/// - Thread IDs displayed as #N instead of ThreadId(N)
/// - Runtime logs formatted as `worklet::ui#1: message`
/// - Configurable ANSI color support
/// - Configurable target prefix stripping
pub struct CustomFormatter<T> {
    timer: T,
    ansi: bool,
    /// Prefix to strip from log targets (e.g., "worklets_host::")
    strip_prefix: Option<String>,
}

impl<T> CustomFormatter<T> {
    /// Create a new CustomFormatter
    ///
    /// # Arguments
    /// * `timer` - The time formatter to use
    /// * `ansi` - Whether to use ANSI color codes
    pub fn new(timer: T, ansi: bool) -> Self {
        Self {
            timer,
            ansi,
            strip_prefix: None,
        }
    }

    /// Set the prefix to strip from log targets
    ///
    /// # Arguments
    /// * `prefix` - The prefix to strip (e.g., "worklets_host::")
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    /// Target as displayed: our own prefix stripped, dependencies shown in full
    fn display_target<'t>(&self, target: &'t str) -> Option<&'t str> {
        let Some(prefix) = &self.strip_prefix else {
            return Some(target);
        };
        let app_name = prefix.trim_end_matches("::");
        if target == app_name {
            return None;
        }
        let display = target.strip_prefix(prefix.as_str()).unwrap_or(target);
        if display.is_empty() { None } else { Some(display) }
    }
}

impl<T: Clone> Clone for CustomFormatter<T> {
    fn clone(&self) -> Self {
        Self {
            timer: self.timer.clone(),
            ansi: self.ansi,
            strip_prefix: self.strip_prefix.clone(),
        }
    }
}

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Padded label and ANSI color of a level
fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("ERROR", "\x1b[31m"),
        Level::WARN => (" WARN", "\x1b[33m"),
        Level::INFO => (" INFO", "\x1b[32m"),
        Level::DEBUG => ("DEBUG", "\x1b[34m"),
        Level::TRACE => ("TRACE", "\x1b[35m"),
    }
}

/// Numeric part of the current thread id
fn thread_number() -> Option<u64> {
    let id = format!("{:?}", std::thread::current().id());
    id.strip_prefix("ThreadId(")?.strip_suffix(')')?.parse().ok()
}

impl<S, N, T> FormatEvent<S, N> for CustomFormatter<T>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: fmt::time::FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std_fmt::Result {
        let metadata = event.metadata();
        let paint = |code: &'static str| if self.ansi { code } else { "" };

        write!(writer, "{}", paint(DIM))?;
        self.timer.format_time(&mut writer)?;
        write!(writer, "{} ", paint(RESET))?;

        let (label, color) = level_style(*metadata.level());
        write!(writer, "{}{}{} ", paint(color), label, paint(RESET))?;

        if let Some(num) = thread_number() {
            write!(writer, "#{:03} ", num)?;
        }

        let mut extractor = FieldExtractor::default();
        event.record(&mut extractor);

        match extractor.runtime_label() {
            Some(label) => {
                write!(writer, "{}{}{}: ", paint(DIM), label, paint(RESET))?;
                if let Some(msg) = &extractor.message {
                    write!(writer, "{}", msg)?;
                }
            }
            None => {
                if let Some(target) = self.display_target(metadata.target()) {
                    write!(writer, "{}{}{}: ", paint(DIM), target, paint(RESET))?;
                }
                ctx.field_format().format_fields(writer.by_ref(), event)?;
            }
        }

        writeln!(writer)
    }
}

/// Create a timer with custom format
///
/// Uses format: `[year]/[month]/[day] [hour]:[minute]:[second].[subsecond digits:4]`
pub fn create_custom_timer()
-> OffsetTime<&'static [time::format_description::BorrowedFormatItem<'static>]> {
    use time::macros::format_description;

    let format =
        format_description!("[year]/[month]/[day] [hour]:[minute]:[second].[subsecond digits:4]");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    OffsetTime::new(offset, format)
}

/// Check if dependency logging is enabled via WORKLETS_LOGDEPS environment variable
///
/// Returns `true` if `WORKLETS_LOGDEPS=1`, `false` otherwise (default).
pub fn is_dependency_logging_enabled() -> bool {
    std::env::var("WORKLETS_LOGDEPS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Build the filter directive for dependency logging
///
/// When dependency logging is off, only the worklets crates log.
pub fn build_filter_directives(level: Level, log_deps: bool) -> String {
    let level_str = match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    };

    if log_deps {
        level_str.to_string()
    } else {
        format!(
            "off,worklets={level},worklets_log={level},worklets_host={level}",
            level = level_str
        )
    }
}

/// Parse a level name as used in configuration files
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Detect if ANSI colors should be used for `stream`
///
/// Disables ANSI colors if:
/// - the stream is not a TTY (piped/redirected)
/// - NO_COLOR env var is set (https://no-color.org/)
/// - TERM=dumb
pub fn should_use_ansi(stream: LogStream) -> bool {
    atty::is(stream.atty_stream())
        && std::env::var("NO_COLOR").is_err()
        && std::env::var("TERM").map(|t| t != "dumb").unwrap_or(true)
}

/// Logging configuration
///
/// `W` is the log file type; the console side is picked with [`LogStream`].
pub struct LogConfig<W: Write + Send + 'static = std::fs::File> {
    /// Target prefix hidden in console output (e.g. "worklets_host::")
    pub strip_prefix: String,
    /// Force ANSI colors on or off; `None` decides per stream
    pub use_ansi: Option<bool>,
    pub level: Level,
    pub stream: LogStream,
    /// Receives an uncolored copy of every event
    pub log_file: Option<W>,
}

impl<W: Write + Send + 'static> LogConfig<W> {
    pub fn new(strip_prefix: impl Into<String>) -> Self {
        Self {
            strip_prefix: strip_prefix.into(),
            use_ansi: None,
            level: Level::DEBUG,
            stream: LogStream::default(),
            log_file: None,
        }
    }

    pub fn with_ansi(mut self, use_ansi: bool) -> Self {
        self.use_ansi = Some(use_ansi);
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_stream(mut self, stream: LogStream) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_log_file(mut self, file: W) -> Self {
        self.log_file = Some(file);
        self
    }
}

/// Install the global subscriber described by `config`
///
/// # Environment Variables
///
/// * `WORKLETS_LOGDEPS` - Set to `1` to enable logging from external dependencies.
/// * `RUST_LOG` - Replaces the default filter directives entirely
///
/// # Errors
/// Fails if a global subscriber is already installed
pub fn init_logging<W: Write + Send + 'static>(
    config: LogConfig<W>,
) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;

    let timer = create_custom_timer();
    let use_ansi = config.use_ansi.unwrap_or_else(|| should_use_ansi(config.stream));
    let directives = build_filter_directives(config.level, is_dependency_logging_enabled());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(
            CustomFormatter::new(timer.clone(), use_ansi).with_strip_prefix(&config.strip_prefix),
        )
        .with_ansi(use_ansi)
        .with_writer(ConsoleWriter::new(config.stream));

    // None disables file output
    let file_layer = config.log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .event_format(CustomFormatter::new(timer, false).with_strip_prefix(&config.strip_prefix))
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()?;

    Ok(())
}
