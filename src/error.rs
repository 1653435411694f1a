//! Error types for the coverage and validation core

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or verifying a coverage report
#[derive(Debug, Error)]
pub enum CoverageError {
    /// The report content is structurally invalid
    #[error("failed to parse {format} report: {message}")]
    Parse { format: &'static str, message: String },

    /// The format tag is not one of the known report formats
    #[error("unsupported coverage format: {0}. Supported: cobertura, lcov, jacoco, diff_cover_json")]
    UnsupportedFormat(String),

    /// The report was not rewritten by the test command that should have produced it
    #[error("coverage report {} is older than the test command (report: {report_ms}ms, command: {command_ms}ms)", path.display())]
    StaleReport {
        path: PathBuf,
        report_ms: u128,
        command_ms: u128,
    },

    #[error("failed to read coverage report {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoverageError {
    pub(crate) fn parse(format: &'static str, message: impl Into<String>) -> Self {
        CoverageError::Parse {
            format,
            message: message.into(),
        }
    }
}

/// The test command could not be launched at all
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDir(PathBuf),

    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures that abort a single validation attempt
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("backup failed for {}: {source}", path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to insert candidate into {}: {source}", path.display())]
    Insert {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to restore {} from backup: {source}", path.display())]
    Restore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
