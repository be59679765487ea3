// 📦 Staging Writer - run-scoped transient table
// TEMP tables live in the connection's private temp schema, so a run's staged
// rows are invisible to every other connection.

use crate::db::format_date;
use crate::error::IoError;
use crate::validator::ValidatedBatch;
use rusqlite::{params, Connection};
use uuid::Uuid;

/// Handle to one run's staging table. Dropped tables are released even when
/// the handle is never explicitly released.
#[derive(Debug)]
pub struct StagingArea<'conn> {
    conn: &'conn Connection,
    table: String,
    rows: usize,
    released: bool,
}

impl<'conn> StagingArea<'conn> {
    /// Schema-qualified name, for use in SQL.
    pub fn qualified_name(&self) -> String {
        format!("temp.{}", self.table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rows loaded.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Drop the staging table now.
    pub fn release(mut self) -> Result<(), rusqlite::Error> {
        self.released = true;
        drop_table(self.conn, &self.table)
    }
}

impl Drop for StagingArea<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = drop_table(self.conn, &self.table);
        }
    }
}

fn drop_table(conn: &Connection, table: &str) -> Result<(), rusqlite::Error> {
    conn.execute(&format!("DROP TABLE IF EXISTS temp.{table}"), [])?;
    Ok(())
}

/// Staging table name for a run.
pub fn staging_table_name(run_id: Uuid) -> String {
    format!("staging_{}", run_id.simple())
}

/// Create the run's staging table and bulk load the batch into it.
///
/// Meant to run inside the run's transaction: if loading fails, the caller's
/// rollback discards every partially loaded row along with the table.
pub fn stage<'conn>(
    conn: &'conn Connection,
    run_id: Uuid,
    batch: &ValidatedBatch,
) -> Result<StagingArea<'conn>, IoError> {
    let table = staging_table_name(run_id);
    let total = batch.len();

    conn.execute(
        &format!(
            "CREATE TEMP TABLE {table} (
                seq INTEGER PRIMARY KEY,
                influencer_name TEXT NOT NULL,
                video_url TEXT NOT NULL,
                campaign_name TEXT NOT NULL,
                publish_date DATE,
                like_count INTEGER,
                interval_date DATE NOT NULL
            )"
        ),
        [],
    )
    .map_err(|source| IoError::StagingCreate {
        table: table.clone(),
        source,
    })?;

    let mut area = StagingArea {
        conn,
        table,
        rows: 0,
        released: false,
    };

    // Covers the latest-row-per-key lookup the merge runs against this table
    conn.execute(
        &format!(
            "CREATE INDEX temp.{table}_key ON {table}(video_url, interval_date, seq)",
            table = area.table
        ),
        [],
    )
    .map_err(|source| IoError::StagingCreate {
        table: area.table.clone(),
        source,
    })?;

    let mut stmt = conn
        .prepare(&format!(
            "INSERT INTO {} (
                seq, influencer_name, video_url, campaign_name,
                publish_date, like_count, interval_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            area.qualified_name()
        ))
        .map_err(|source| IoError::StagingLoad {
            loaded: 0,
            total,
            source,
        })?;

    for (seq, record) in batch.records().iter().enumerate() {
        stmt.execute(params![
            seq as i64,
            record.influencer_name,
            record.video_url,
            record.campaign_name,
            record.publish_date.map(format_date),
            record.like_count,
            format_date(record.interval_date),
        ])
        .map_err(|source| IoError::StagingLoad {
            loaded: seq,
            total,
            source,
        })?;
    }
    drop(stmt);

    area.rows = total;
    Ok(area)
}
