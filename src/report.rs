// 📊 Result Reporter - post-commit totals for observability
// Read-only. A failure here never touches a committed batch.

use crate::db::{format_date, format_timestamp};
use crate::error::ReportingError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Rows stored for the interval date.
    pub total_rows_today: i64,
    /// Rows for the interval date written within the recent window.
    pub updated_rows_recent: i64,
}

/// Count rows for `interval_date`, and how many were written since
/// `now - recent_window`.
pub fn summarize(
    conn: &Connection,
    table: &str,
    interval_date: NaiveDate,
    recent_window: Duration,
    now: DateTime<Utc>,
) -> Result<Totals, ReportingError> {
    let window = chrono::Duration::from_std(recent_window).unwrap_or(chrono::Duration::MAX);
    let since = now
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    conn.query_row(
        &format!(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN last_updated_at >= ?2 THEN 1 END)
             FROM {table}
             WHERE interval_date = ?1"
        ),
        params![format_date(interval_date), format_timestamp(since)],
        |row| {
            Ok(Totals {
                total_rows_today: row.get(0)?,
                updated_rows_recent: row.get(1)?,
            })
        },
    )
    .map_err(|source| ReportingError::Query {
        interval_date,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap;
    use chrono::TimeZone;

    fn insert(conn: &Connection, url: &str, date: &str, ts: DateTime<Utc>) {
        conn.execute(
            "INSERT INTO metrics VALUES ('Ana', ?1, 'Spring', NULL, 1, ?2, ?3)",
            params![url, date, format_timestamp(ts)],
        )
        .unwrap();
    }

    #[test]
    fn test_summarize_counts_today_and_recent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn, "metrics").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        insert(&conn, "v1", "2024-06-01", now - chrono::Duration::minutes(1));
        insert(&conn, "v2", "2024-06-01", now - chrono::Duration::hours(2));
        insert(&conn, "v3", "2024-05-31", now);

        let totals = summarize(
            &conn,
            "metrics",
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            Duration::from_secs(300),
            now,
        )
        .unwrap();

        assert_eq!(
            totals,
            Totals {
                total_rows_today: 2,
                updated_rows_recent: 1
            }
        );
    }

    #[test]
    fn test_summarize_reports_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let err = summarize(&conn, "metrics", date, Duration::from_secs(300), Utc::now()).unwrap_err();

        let ReportingError::Query { interval_date, .. } = err;
        assert_eq!(interval_date, date);
    }
}
