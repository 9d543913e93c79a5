//! Thin facade over the structured logging stack. Components receive a
//! parent `Logger` and derive their own child loggers with `log.new(o!(..))`.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};
use std::fmt;
use std::path::Path;

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

#[derive(Debug)]
pub enum InitError {
    Config(serdeconv::Error),
    Build(sloggers::Error),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InitError::Config(err) => write!(f, "invalid logging configuration: {}", err),
            InitError::Build(err) => write!(f, "cannot build logger: {}", err),
        }
    }
}

impl From<serdeconv::Error> for InitError {
    fn from(err: serdeconv::Error) -> Self {
        InitError::Config(err)
    }
}

impl From<sloggers::Error> for InitError {
    fn from(err: sloggers::Error) -> Self {
        InitError::Build(err)
    }
}

/// Builds a logger writing human-readable records to stderr. Used for
/// foreground runs and as the fallback when no logging config is given.
pub fn terminal(verbose: bool) -> Result<Logger, InitError> {
    let level = if verbose { Severity::Debug } else { Severity::Info };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().map_err(Into::into)
}

/// Builds a logger from a TOML description of the back-end, e.g.
///
/// ```toml
/// type = "file"
/// path = "/var/log/corespoold.log"
/// level = "info"
/// ```
pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Logger, InitError> {
    let config: LoggerConfig = serdeconv::from_toml_file(path)?;
    config.build_logger().map_err(Into::into)
}
