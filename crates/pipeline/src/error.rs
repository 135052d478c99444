//! Pricebatch Pipeline Error System
//!
//! Error handling for CSV batch ingestion and statistics queries.
//! `process_file` and `query_stats` return these; the orchestrator decides
//! whether a failure is logged and skipped.

use thiserror::Error;

/// Pipeline result type for all operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Store unreachable or authentication failure
    #[error("Connection error: {reason}")]
    Connection {
        /// Reason for failure
        reason: String,
    },

    /// Malformed CSV input or unreadable file
    #[error("Parse error in {source_name}: {reason}")]
    Parse {
        /// File (or stream) being parsed
        source_name: String,
        /// Reason for failure
        reason: String,
    },

    /// Uniqueness conflict that was not suppressed by `ON CONFLICT DO NOTHING`
    #[error("Constraint violation during {operation}: {reason}")]
    ConstraintViolation {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Statement or aggregate query failure
    #[error("Query failed: {operation} - {reason}")]
    Query {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Schema migration errors
    #[error("Migration failed: {message}")]
    Migration {
        /// Error message
        message: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create parse error
    pub fn parse(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create constraint violation error
    pub fn constraint_violation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create query error
    pub fn query(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create migration error
    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Stable label for log fields
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Parse { .. } => "parse",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::Query { .. } => "query",
            Self::Configuration { .. } => "configuration",
            Self::Migration { .. } => "migration",
            Self::Io(_) => "io",
        }
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        let line = err
            .position()
            .map_or_else(String::new, |pos| format!(" (line {})", pos.line()));
        Self::parse("csv", format!("{err}{line}"))
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<garde::Report> for PipelineError {
    fn from(report: garde::Report) -> Self {
        Self::configuration(format!("Validation failed: {report}"))
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for PipelineError {
    fn from(err: tokio_postgres::Error) -> Self {
        classify_postgres_error("statement", &err)
    }
}

/// Map a PostgreSQL error onto the pipeline's error kinds
#[cfg(feature = "postgres")]
pub(crate) fn classify_postgres_error(operation: &str, err: &tokio_postgres::Error) -> PipelineError {
    use tokio_postgres::error::SqlState;

    if err.is_closed() {
        return PipelineError::connection(format!("{operation}: {err}"));
    }

    match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
            PipelineError::constraint_violation(operation, err.to_string())
        }
        Some(code) if code.code().starts_with("08") || code.code().starts_with("28") => {
            PipelineError::connection(format!("{operation}: {err}"))
        }
        _ => PipelineError::query(operation, err.to_string()),
    }
}
