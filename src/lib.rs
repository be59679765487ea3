// Influencer Campaign Metrics - Core Library
// Batch reconciliation of daily campaign rows into a durable time-series table.
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod merge;
pub mod observability;
pub mod reconciler;
pub mod record;
pub mod report;
pub mod source;
pub mod staging;
pub mod validator;

// Re-export commonly used types
pub use config::{ReconcilerConfig, WarehouseConfig};
pub use db::{
    bootstrap, count_rows, get_metrics_for_date, Connector, SqliteConnector,
};
pub use enrichment::{
    enrich_batch, video_id_from_url, EnrichmentReport, LookupFailure, MetadataTable,
    VideoMetadata, VideoMetadataSource,
};
pub use error::{ConfigError, Error, IoError, MergeError, ReportingError, SchemaError};
pub use merge::MergeSummary;
pub use observability::{MemorySink, RunEvent, RunSink, TracingSink};
pub use reconciler::{BatchOutcome, Reconciler, RunState};
pub use record::{MetricsRecord, RawBatch, RawRow, RowRejection, REQUIRED_FIELDS};
pub use report::Totals;
pub use source::{read_batch, read_batch_csv};
pub use validator::{validate, ValidatedBatch};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
