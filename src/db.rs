use crate::config::{ReconcilerConfig, WarehouseConfig};
use crate::error::IoError;
use crate::record::MetricsRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::PathBuf;
use std::time::Duration;

/// Fixed-width UTC timestamps so TEXT comparison orders them correctly.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_stored_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

// ============================================================================
// CONNECTORS
// ============================================================================

/// Capability to open a connection to the durable store. Injected by the
/// caller; each run asks for exactly one connection.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Connection, IoError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String {
        "sqlite".to_string()
    }
}

/// Opens a SQLite database file in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConnector {
            path: path.into(),
            busy_timeout: crate::config::DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn from_config(warehouse: &WarehouseConfig, settings: &ReconcilerConfig) -> Self {
        SqliteConnector::new(&warehouse.database).with_busy_timeout(settings.busy_timeout)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> Result<Connection, IoError> {
        let target = self.describe();
        let conn = Connection::open(&self.path).map_err(|source| IoError::Connect {
            target: target.clone(),
            source,
        })?;

        // Concurrent runs wait for the write lock instead of failing fast
        conn.busy_timeout(self.busy_timeout)
            .and_then(|_| conn.pragma_update(None, "journal_mode", "WAL"))
            .map_err(|source| IoError::Connect { target, source })?;

        Ok(conn)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

/// Create the durable table and its natural-key index if absent.
/// Safe to repeat, including from concurrent first runs.
pub fn bootstrap(conn: &Connection, table: &str) -> Result<(), IoError> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                influencer_name TEXT NOT NULL,
                video_url TEXT NOT NULL,
                campaign_name TEXT NOT NULL,
                publish_date DATE,
                like_count INTEGER CHECK (like_count IS NULL OR like_count >= 0),
                interval_date DATE NOT NULL,
                last_updated_at TIMESTAMP NOT NULL
            )"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_natural_key
             ON {table}(video_url, interval_date)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_interval_date ON {table}(interval_date)"),
    ];

    for sql in &statements {
        match conn.execute(sql, []) {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {}
            Err(source) => {
                return Err(IoError::Bootstrap {
                    table: table.to_string(),
                    source,
                })
            }
        }
    }

    Ok(())
}

/// A concurrent run created the object between our check and our create.
fn is_already_exists(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("already exists"))
}

// ============================================================================
// READ HELPERS
// ============================================================================

pub(crate) fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    parse_stored_date(&raw).ok_or_else(|| conversion_error(idx, raw))
}

pub(crate) fn optional_date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_stored_date(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, raw)),
        None => Ok(None),
    }
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, raw))
}

fn conversion_error(idx: usize, raw: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("malformed stored value '{}'", raw).into(),
    )
}

/// All durable rows for one interval date, ordered by video URL.
pub fn get_metrics_for_date(
    conn: &Connection,
    table: &str,
    interval_date: NaiveDate,
) -> Result<Vec<MetricsRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT influencer_name, video_url, campaign_name, publish_date,
                like_count, interval_date, last_updated_at
         FROM {table}
         WHERE interval_date = ?1
         ORDER BY video_url"
    ))?;

    let records = stmt
        .query_map(params![format_date(interval_date)], |row| {
            Ok(MetricsRecord {
                influencer_name: row.get(0)?,
                video_url: row.get(1)?,
                campaign_name: row.get(2)?,
                publish_date: optional_date_column(row, 3)?,
                like_count: row.get(4)?,
                interval_date: date_column(row, 5)?,
                last_updated_at: Some(timestamp_column(row, 6)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read {table} rows for {interval_date}"))?;

    Ok(records)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;

    Ok(count)
}

/// Names of TEMP tables visible to this connection.
pub fn temp_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_temp_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}
