//! Structured logging for the zip code contaminant service
//!
//! Provides context-rich logging tagged with the emitting component and,
//! where relevant, the zip code being served. Output goes through
//! `tracing`; `init_logger` installs a console subscriber and, optionally,
//! an append-only log file for daemon operation.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::model::LookupError;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Store,
    Engine,
    Ingest,
    Http,
    System,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Store => write!(f, "STORE"),
            LogSource::Engine => write!(f, "ENGINE"),
            LogSource::Ingest => write!(f, "INGEST"),
            LogSource::Http => write!(f, "HTTP"),
            LogSource::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected outcome of a well-formed request (bad input, unserved zip)
    Expected,
    /// Service degradation or a defect
    Unexpected,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
        }
    }
}

/// Unserved zips and malformed requests are normal traffic, not errors.
pub fn classify_lookup_failure(err: &LookupError) -> FailureType {
    match err {
        LookupError::InvalidInput(_) | LookupError::NotFound(_) => FailureType::Expected,
        LookupError::DependencyUnavailable(_) | LookupError::Store(_) => FailureType::Unexpected,
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("could not open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("logger already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logger(level: &str, log_file: Option<&str>) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.to_string(),
                    source,
                })?;
            Some(
                tracing_fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

pub fn info(source: LogSource, zip: Option<&str>, message: &str) {
    tracing::info!(source = %source, zip = zip.unwrap_or("-"), "{}", message);
}

pub fn warn(source: LogSource, zip: Option<&str>, message: &str) {
    tracing::warn!(source = %source, zip = zip.unwrap_or("-"), "{}", message);
}

pub fn error(source: LogSource, zip: Option<&str>, message: &str) {
    tracing::error!(source = %source, zip = zip.unwrap_or("-"), "{}", message);
}

pub fn debug(source: LogSource, zip: Option<&str>, message: &str) {
    tracing::debug!(source = %source, zip = zip.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a failed lookup or ranking at the level its classification warrants.
pub fn log_lookup_failure(zip: &str, operation: &str, err: &LookupError) {
    let failure_type = classify_lookup_failure(err);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(LogSource::Engine, Some(zip), &message),
        FailureType::Unexpected => error(LogSource::Engine, Some(zip), &message),
    }
}

// ---------------------------------------------------------------------------
// Ingestion Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one dataset's ingestion
pub fn log_ingest_summary(dataset: &str, total: usize, loaded: usize, rejected: usize) {
    let message = format!(
        "{} ingest complete: {}/{} loaded, {} rejected",
        dataset, loaded, total, rejected
    );

    if rejected == 0 {
        info(LogSource::Ingest, None, &message);
    } else if loaded == 0 {
        error(LogSource::Ingest, None, &message);
    } else {
        warn(LogSource::Ingest, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_and_bad_input_are_expected() {
        assert_eq!(
            classify_lookup_failure(&LookupError::NotFound("00000".into())),
            FailureType::Expected
        );
        assert_eq!(
            classify_lookup_failure(&LookupError::InvalidInput("1234".into())),
            FailureType::Expected
        );
    }

    #[test]
    fn test_store_failures_are_unexpected() {
        assert_eq!(
            classify_lookup_failure(&LookupError::DependencyUnavailable("timeout".into())),
            FailureType::Unexpected
        );
        assert_eq!(
            classify_lookup_failure(&LookupError::Store("syntax error".into())),
            FailureType::Unexpected
        );
    }

    #[test]
    fn test_source_tags() {
        assert_eq!(LogSource::Engine.to_string(), "ENGINE");
        assert_eq!(LogSource::System.to_string(), "SYS");
    }
}
