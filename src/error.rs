// 🚨 Error taxonomy for batch reconciliation
// Each failure kind is its own type so callers can match on it.

use chrono::NaiveDate;
use thiserror::Error;

// ============================================================================
// SCHEMA ERRORS (raised before any I/O)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch is missing required fields: {}", missing_fields.join(", "))]
pub struct SchemaError {
    pub missing_fields: Vec<String>,
}

// ============================================================================
// I/O ERRORS (connection, bootstrap, staging)
// ============================================================================

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to open connection to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("connection unavailable: {0}")]
    Unavailable(String),

    #[error("failed to bootstrap table {table}: {source}")]
    Bootstrap {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    #[error("failed to create staging table {table}: {source}")]
    StagingCreate {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("staging load failed after {loaded} of {total} rows: {source}")]
    StagingLoad {
        loaded: usize,
        total: usize,
        #[source]
        source: rusqlite::Error,
    },
}

// ============================================================================
// MERGE ERRORS (always followed by rollback)
// ============================================================================

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge step '{step}' failed: {source}")]
    Sql {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error(
        "publish_date for {video_url} is {existing} in storage but batch says {incoming}"
    )]
    PublishDateConflict {
        video_url: String,
        existing: NaiveDate,
        incoming: NaiveDate,
    },

    #[error("stored value in column {column} is malformed: {value}")]
    MalformedValue { column: &'static str, value: String },

    #[error("failed to commit merge: {0}")]
    Commit(#[source] rusqlite::Error),
}

// ============================================================================
// REPORTING ERRORS (post-commit, never fail the run)
// ============================================================================

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error("failed to compute totals for {interval_date}: {source}")]
    Query {
        interval_date: NaiveDate,
        #[source]
        source: rusqlite::Error,
    },
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid table name '{0}': use letters, digits and underscores")]
    InvalidTableName(String),

    #[error("setting {key} has invalid value '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// TOP-LEVEL RUN ERROR
// ============================================================================

/// Failure of a batch-apply run. The durable table is unchanged whenever one
/// of these is returned.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl Error {
    /// Short label used in run events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Schema(_) => "schema",
            Error::Io(_) => "io",
            Error::Merge(_) => "merge",
        }
    }

    /// Whether a caller may retry the whole run. Schema failures repeat on
    /// retry; I/O and merge failures may not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Schema(_) => false,
            Error::Io(_) => true,
            Error::Merge(MergeError::PublishDateConflict { .. }) => false,
            Error::Merge(_) => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
