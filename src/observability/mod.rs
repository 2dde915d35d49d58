//! Log subscriber setup for the `kvlock` binary and embedding applications.
//!
//! The library only emits `tracing` events and `metrics` samples. Nothing is
//! printed until a subscriber is installed, either by the host application or
//! through [`init_logging`].

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "KVLOCK_LOG";

/// Environment variable naming a file to append logs to.
pub const LOG_FILE_ENV: &str = "KVLOCK_LOG_FILE";

const DEFAULT_DIRECTIVE: &str = "kvlock=info";
const VERBOSE_DIRECTIVE: &str = "kvlock=debug";

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Raises the default level to `debug`.
    pub verbose: bool,
    /// Filter directive. Falls back to `KVLOCK_LOG`, then the default.
    pub directive: Option<String>,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds a configuration from the environment.
    #[must_use]
    pub fn from_env(format: LogFormat, verbose: bool) -> Self {
        Self {
            format,
            verbose,
            directive: std::env::var(LOG_ENV).ok().filter(|v| !v.trim().is_empty()),
            file: std::env::var_os(LOG_FILE_ENV).map(PathBuf::from),
        }
    }

    /// Builds the filter. An explicit directive wins over `verbose`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the directive cannot be parsed.
    pub fn filter(&self) -> Result<EnvFilter> {
        let directive = match (&self.directive, self.verbose) {
            (Some(directive), _) => directive.as_str(),
            (None, true) => VERBOSE_DIRECTIVE,
            (None, false) => DEFAULT_DIRECTIVE,
        };
        EnvFilter::try_new(directive)
            .map_err(|e| Error::Configuration(format!("invalid log filter '{directive}': {e}")))
    }
}

/// Installs the global log subscriber.
///
/// Logs go to stderr unless a file is configured, so stdout stays free for
/// command output.
///
/// # Errors
///
/// Returns an error if logging was already initialized, the filter is
/// invalid, or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INIT.get().is_some() {
        return Err(init_error("logging already initialized"));
    }

    let filter = config.filter()?;
    let (writer, ansi) = match &config.file {
        Some(path) => (BoxMakeWriter::new(open_log_file(path)?), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_target(true),
            )
            .with(filter)
            .try_init()
            .map_err(init_error)?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .with(filter)
            .try_init()
            .map_err(init_error)?,
    }

    LOGGING_INIT
        .set(())
        .map_err(|()| init_error("failed to mark logging initialized"))
}

/// Thread-safe file writer for logging.
#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| init_error(format!("{}: {e}", parent.display())))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| init_error(format!("{}: {e}", path.display())))?;

    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}

#[allow(clippy::needless_pass_by_value)]
fn init_error(cause: impl std::fmt::Display) -> Error {
    Error::Configuration(format!("logging: {cause}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_filter_defaults() {
        let quiet = LoggingConfig::default();
        assert_eq!(quiet.filter().unwrap().to_string(), DEFAULT_DIRECTIVE);

        let verbose = LoggingConfig {
            verbose: true,
            ..LoggingConfig::default()
        };
        assert_eq!(verbose.filter().unwrap().to_string(), VERBOSE_DIRECTIVE);
    }

    #[test]
    fn test_explicit_directive_wins() {
        let config = LoggingConfig {
            verbose: true,
            directive: Some("warn".to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(config.filter().unwrap().to_string(), "warn");
    }

    #[test]
    fn test_invalid_directive() {
        let config = LoggingConfig {
            directive: Some("kvlock=loud".to_string()),
            ..LoggingConfig::default()
        };
        assert!(matches!(config.filter(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("kvlock.log");
        let mut writer = open_log_file(&path).unwrap();
        writer.write_all(b"line\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[test]
    fn test_init_twice_fails() {
        let config = LoggingConfig {
            directive: Some("off".to_string()),
            ..LoggingConfig::default()
        };
        // Another test binary may already own the global subscriber.
        if init_logging(&config).is_ok() {
            assert!(init_logging(&config).is_err());
        }
    }
}
