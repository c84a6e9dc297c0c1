//! Log initialization and setup

#[cfg(feature = "clap")]
pub mod cli;
pub mod config;

pub use config::*;

use std::{
    cmp::min,
    io::{self, LineWriter, Write},
};

use thiserror::Error;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::ParseError,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

/// Maximum length of a log line.
/// Space for a final trailing newline if truncated.
///
/// Docker "chunks" log message in 16KB chunks, and not all log drivers
/// recombine them.
const MAX_LINE_LENGTH: usize = 16 * 1024 - 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter {filter:?}: {source}")]
    InvalidFilter { filter: String, source: ParseError },

    #[error("Cannot set global tracing subscriber")]
    SetGlobalDefaultError(#[from] SetGlobalDefaultError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for logging.
#[derive(Debug)]
pub struct Builder {
    log_format: LogFormat,
    log_filter: Option<String>,
    // used when log_filter is none.
    default_log_filter: String,
    make_writer: BoxMakeWriter,
    with_target: bool,
    with_ansi: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_filter: None,
            default_log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            make_writer: make_writer(io::stdout),
            with_target: true,
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_writer(self, make_writer: BoxMakeWriter) -> Self {
        Self {
            make_writer,
            ..self
        }
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: &Option<String>) -> Self {
        Self {
            log_filter: log_filter.clone(),
            ..self
        }
    }

    pub fn with_default_log_filter(self, default_log_filter: impl Into<String>) -> Self {
        Self {
            default_log_filter: default_log_filter.into(),
            ..self
        }
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        // Lines are capped and written with a single call to the underlying
        // writer, so threads rarely interleave within a line.
        let make_writer = match log_destination {
            LogDestination::Stdout => make_writer(io::stdout),
            LogDestination::Stderr => make_writer(io::stderr),
        };
        Self {
            make_writer,
            ..self
        }
    }

    /// Sets whether or not an event's target and location are displayed.
    ///
    /// Defaults to true. See [tracing_subscriber::fmt::Layer::with_target]
    pub fn with_target(self, with_target: bool) -> Self {
        Self {
            with_target,
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    ///
    /// Defaults to true. See [tracing_subscriber::fmt::Layer::with_ansi]
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    pub fn build(self) -> Result<impl Subscriber + Send + Sync + 'static> {
        let filter = self.log_filter.unwrap_or(self.default_log_filter);
        let log_filter = EnvFilter::try_new(&filter)
            .map_err(|source| Error::InvalidFilter { filter, source })?;

        let log_writer = self.make_writer;
        let with_target = self.with_target;
        let with_ansi = self.with_ansi;

        let (log_format_full, log_format_pretty, log_format_json) = match self.log_format {
            LogFormat::Full => (
                Some(
                    fmt::layer()
                        .with_writer(log_writer)
                        .with_target(with_target)
                        .with_ansi(with_ansi),
                ),
                None,
                None,
            ),
            LogFormat::Pretty => (
                None,
                Some(
                    fmt::layer()
                        .pretty()
                        .with_writer(log_writer)
                        .with_target(with_target)
                        .with_ansi(with_ansi),
                ),
                None,
            ),
            LogFormat::Json => (
                None,
                None,
                Some(
                    fmt::layer()
                        .json()
                        .with_writer(log_writer)
                        .with_target(with_target)
                        .with_ansi(with_ansi),
                ),
            ),
        };

        Ok(Registry::default()
            .with(log_filter)
            .with(log_format_full)
            .with(log_format_pretty)
            .with(log_format_json))
    }

    /// Build a subscriber and install it as the global default for all
    /// threads.
    pub fn install_global(self) -> Result<()> {
        let subscriber = self.build()?;
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

fn make_writer<F, W>(f: F) -> BoxMakeWriter
where
    F: Fn() -> W + Send + Sync + 'static,
    W: Write + 'static,
{
    BoxMakeWriter::new(move || {
        LineWriter::with_capacity(MAX_LINE_LENGTH, LimitedWriter(MAX_LINE_LENGTH, f()))
    })
}

struct LimitedWriter<W: Write>(usize, W);

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let truncated = &buf[..min(self.0, buf.len())];
        let had_trailing_newline = buf[buf.len() - 1] == b'\n';
        if had_trailing_newline && (truncated[truncated.len() - 1] != b'\n') {
            // slow path; copy buffer and append a newline at the end
            // we still want to perform a single write syscall (if possible).
            let mut tmp = truncated.to_vec();
            tmp.push(b'\n');
            self.1.write_all(&tmp).map(|_| buf.len())
        } else {
            self.1.write_all(truncated).map(|_| buf.len())
        }
        // ^^^ `write_all`:
        // in case of interrupted syscalls we prefer to write a garbled log line.
        // than to just truncate the logs.
    }

    fn flush(&mut self) -> io::Result<()> {
        self.1.flush()
    }
}

#[cfg(test)]
mod test_util {
    //! Utilities for testing logging.
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::{debug, error, info, trace, warn};

    use super::*;

    /// Log writer capturing output in a shared buffer.
    #[derive(Default, Debug, Clone)]
    pub(crate) struct TestWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl TestWriter {
        /// Return a writer and reference to the to-be captured output.
        pub(crate) fn new() -> (Self, Captured) {
            let writer = Self::default();
            let captured = Captured(Arc::clone(&writer.buffer));
            (writer, captured)
        }
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    pub(crate) struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        /// Removes non-determinism by removing the leading timestamp of
        /// every line.
        pub(crate) fn without_timestamps(&self) -> String {
            self.to_string()
                .lines()
                .map(|line| match line.split_once(' ') {
                    Some((ts, rest)) if ts.starts_with(|c: char| c.is_ascii_digit()) => {
                        rest.trim_start()
                    }
                    _ => line,
                })
                .fold(String::new(), |mut out, line| {
                    out.push_str(line);
                    out.push('\n');
                    out
                })
        }
    }

    impl std::fmt::Display for Captured {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let bytes = self.0.lock();
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        }
    }

    pub(crate) fn capture_writer(writer: TestWriter) -> BoxMakeWriter {
        make_writer(move || writer.clone())
    }

    /// Run `f` under a subscriber built from `builder` with test friendly
    /// settings and return what it logged.
    pub(crate) fn log_test<F>(builder: Builder, f: F) -> Captured
    where
        F: Fn(),
    {
        let (writer, output) = TestWriter::new();
        let subscriber = builder
            .with_writer(capture_writer(writer))
            .with_target(false)
            .with_ansi(false)
            .build()
            .expect("subscriber");

        tracing::subscriber::with_default(subscriber, f);

        output
    }

    /// Emit one event per level and return the captured output.
    pub(crate) fn simple_test(builder: Builder) -> Captured {
        log_test(builder, || {
            error!("foo");
            warn!("woo");
            info!("bar");
            debug!("baz");
            trace!("trax");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use pretty_assertions::assert_eq;
    use tracing::{debug, error, info};
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::test_util::*;

    #[test]
    fn simple_logging() {
        assert_eq!(
            simple_test(Builder::new()).without_timestamps(),
            r#"
ERROR foo
WARN woo
"#
            .trim_start(),
        );
    }

    #[test]
    fn verbose_count() {
        assert_eq!(
            simple_test(Builder::new().with_log_verbose_count(0)).without_timestamps(),
            "ERROR foo\nWARN woo\n",
        );
        assert_eq!(
            simple_test(Builder::new().with_log_verbose_count(1)).without_timestamps(),
            "ERROR foo\nWARN woo\nINFO bar\n",
        );
        assert_eq!(
            simple_test(Builder::new().with_log_verbose_count(2)).without_timestamps(),
            "ERROR foo\nWARN woo\nINFO bar\nDEBUG baz\n",
        );
        assert_eq!(
            simple_test(Builder::new().with_log_verbose_count(3)).without_timestamps(),
            "ERROR foo\nWARN woo\nINFO bar\nDEBUG baz\nTRACE trax\n",
        );
    }

    #[test]
    fn test_override_default_log_filter() {
        const DEFAULT_LOG_FILTER: &str = "error";

        assert_eq!(
            simple_test(
                Builder::new()
                    .with_default_log_filter(DEFAULT_LOG_FILTER)
                    .with_log_verbose_count(0)
            )
            .without_timestamps(),
            "ERROR foo\n",
        );

        // -v wins over an explicit filter.
        assert_eq!(
            simple_test(
                Builder::new()
                    .with_log_filter(&Some("error".to_string()))
                    .with_log_verbose_count(1)
            )
            .without_timestamps(),
            "ERROR foo\nWARN woo\nINFO bar\n",
        );
    }

    #[test]
    fn test_structured_fields() {
        let captured = log_test(Builder::new().with_log_verbose_count(1), || {
            info!(addr = "10.0.0.1:8400", rows = 42, "sent rows");
        })
        .without_timestamps();
        assert_eq!(captured, "INFO sent rows addr=\"10.0.0.1:8400\" rows=42\n");
    }

    #[test]
    fn test_json_format() {
        let captured = log_test(
            Builder::new()
                .with_log_verbose_count(1)
                .with_log_format(LogFormat::Json),
            || info!(rows = 7, "flushed"),
        )
        .to_string();
        assert!(captured.starts_with('{'), "{captured}");
        assert!(captured.contains(r#""message":"flushed""#), "{captured}");
        assert!(captured.contains(r#""rows":7"#), "{captured}");
    }

    #[test]
    fn test_invalid_filter() {
        let err = Builder::new()
            .with_log_filter(&Some("[[[".to_string()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidFilter { .. }));
    }

    #[test]
    fn test_side_effects() {
        let called = Arc::new(AtomicBool::new(false));
        let called_captured = Arc::clone(&called);

        fn call(called: &AtomicBool) -> bool {
            called.store(true, Ordering::SeqCst);
            true
        }

        assert_eq!(
            log_test(
                Builder::new().with_log_filter(&Some("error".to_string())),
                move || {
                    error!("foo");
                    debug!(called=?call(&called_captured), "bar");
                }
            )
            .without_timestamps(),
            "ERROR foo\n",
        );

        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_long_lines() {
        let test_cases = vec![
            0..1,
            10..11,
            // the logger adds some prefix text such as level and field name, so
            // the field value length that actually trigger a line overflow is a
            // bit smaller than MAX_LINE_LENGTH.
            MAX_LINE_LENGTH - 40..MAX_LINE_LENGTH + 20,
            20 * 1024..20 * 1024,
        ];

        for range in test_cases {
            for len in range {
                let long = "X".repeat(len);

                let captured = log_test(
                    Builder::new().with_log_filter(&Some("error".to_string())),
                    move || {
                        error!(%long);
                    },
                )
                .to_string();

                assert_eq!(captured.chars().last().unwrap(), '\n');
                assert!(
                    captured.len() <= MAX_LINE_LENGTH,
                    "{} <= {}",
                    captured.len(),
                    MAX_LINE_LENGTH
                );
            }
        }
    }

    // Data reaches the underlying writer one whole line at a time.
    #[test]
    fn line_buffering() {
        let (test_writer, captured) = TestWriter::new();
        let make = capture_writer(test_writer);
        let mut writer = make.make_writer();
        writer.write_all("foo".as_bytes()).unwrap();
        // wasn't flushed yet because there was no newline yet
        assert_eq!(captured.to_string(), "");
        writer.write_all("\nbar".as_bytes()).unwrap();
        // a newline caused the first line to be flushed but the trailing string is still buffered
        assert_eq!(captured.to_string(), "foo\n");
        writer.flush().unwrap();
        // an explicit call to flush flushes even if there is no trailing newline
        assert_eq!(captured.to_string(), "foo\nbar");
    }

    #[test]
    fn limited_writer() {
        const TEST_MAX_LINE_LENGTH: usize = 3;
        let test_cases = vec![
            ("", ""),
            ("a", "a"),
            ("ab", "ab"),
            ("abc", "abc"),
            ("abcd", "abc"),
            ("abcd\n", "abc\n"),
            ("abcd\n\n", "abc\n"),
            ("abcd\nx", "abc"),
            ("\n", "\n"),
            ("\nabc", "\nab"),
        ];
        for (input, want) in test_cases {
            let mut buf = Vec::new();
            {
                let mut lw = LimitedWriter(TEST_MAX_LINE_LENGTH, &mut buf);
                write!(&mut lw, "{input}").unwrap();
            }
            assert_eq!(std::str::from_utf8(&buf).unwrap(), want);
        }
    }
}
