// 🔀 Merge Executor - set-based upsert from staging into the durable table
//
// Keyed by the natural key (video_url, interval_date):
//   matched     -> like_count and last_updated_at change, nothing else
//   not matched -> staged row inserted in full
// Nothing is ever deleted. Duplicate keys inside one batch: the later row wins.

use crate::db::{format_date, format_timestamp, parse_stored_date, parse_timestamp};
use crate::error::MergeError;
use crate::staging::StagingArea;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub rows_inserted: usize,
    pub rows_updated: usize,
}

impl MergeSummary {
    pub fn rows_written(&self) -> usize {
        self.rows_inserted + self.rows_updated
    }
}

fn sql_error(step: &'static str) -> impl FnOnce(rusqlite::Error) -> MergeError {
    move |source| MergeError::Sql { step, source }
}

/// Staged rows with in-batch duplicates collapsed to the highest `seq`.
fn latest_rows(staging: &StagingArea<'_>) -> String {
    let staged = staging.qualified_name();
    format!(
        "SELECT s.* FROM {staged} s
         WHERE s.seq = (
             SELECT MAX(d.seq) FROM {staged} d
             WHERE d.video_url = s.video_url AND d.interval_date = s.interval_date
         )"
    )
}

/// Timestamp for this run's writes on `interval_date`: now, or just past the
/// latest stored write for that date, whichever is later.
pub fn commit_timestamp(
    conn: &Connection,
    table: &str,
    interval_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, MergeError> {
    let latest: Option<String> = conn
        .query_row(
            &format!("SELECT MAX(last_updated_at) FROM {table} WHERE interval_date = ?1"),
            params![format_date(interval_date)],
            |row| row.get(0),
        )
        .map_err(sql_error("commit_timestamp"))?;

    let Some(raw) = latest else {
        return Ok(now);
    };
    let previous = parse_timestamp(&raw).ok_or(MergeError::MalformedValue {
        column: "last_updated_at",
        value: raw,
    })?;

    if now > previous {
        Ok(now)
    } else {
        Ok(previous + Duration::microseconds(1))
    }
}

/// Fail if a staged publish_date contradicts one already stored for the video.
fn check_publish_dates(
    conn: &Connection,
    table: &str,
    staging: &StagingArea<'_>,
) -> Result<(), MergeError> {
    let conflict: Option<(String, String, String)> = conn
        .query_row(
            &format!(
                "SELECT latest.video_url, t.publish_date, latest.publish_date
                 FROM ({latest}) AS latest
                 JOIN {table} t ON t.video_url = latest.video_url
                 WHERE latest.publish_date IS NOT NULL
                   AND t.publish_date IS NOT NULL
                   AND t.publish_date <> latest.publish_date
                 ORDER BY latest.seq
                 LIMIT 1",
                latest = latest_rows(staging)
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(sql_error("publish_date_check"))?;

    let Some((video_url, existing, incoming)) = conflict else {
        return Ok(());
    };

    let parse = |raw: String| {
        parse_stored_date(&raw).ok_or(MergeError::MalformedValue {
            column: "publish_date",
            value: raw,
        })
    };

    Err(MergeError::PublishDateConflict {
        video_url,
        existing: parse(existing)?,
        incoming: parse(incoming)?,
    })
}

/// Apply the staged batch to `table`. Must run inside the run's transaction;
/// on error the caller rolls back, so no partial merge is ever visible.
pub fn merge(
    conn: &Connection,
    table: &str,
    staging: &StagingArea<'_>,
    commit_ts: DateTime<Utc>,
) -> Result<MergeSummary, MergeError> {
    check_publish_dates(conn, table, staging)?;

    let latest = latest_rows(staging);
    let stamp = format_timestamp(commit_ts);

    // Update first: the insert below skips every key that now exists.
    let rows_updated = conn
        .execute(
            &format!(
                "UPDATE {table}
                 SET like_count = latest.like_count,
                     last_updated_at = ?1
                 FROM ({latest}) AS latest
                 WHERE {table}.video_url = latest.video_url
                   AND {table}.interval_date = latest.interval_date"
            ),
            params![stamp],
        )
        .map_err(sql_error("update_matched"))?;

    let rows_inserted = conn
        .execute(
            &format!(
                "INSERT INTO {table} (
                    influencer_name, video_url, campaign_name,
                    publish_date, like_count, interval_date, last_updated_at
                 )
                 SELECT latest.influencer_name, latest.video_url, latest.campaign_name,
                        latest.publish_date, latest.like_count, latest.interval_date, ?1
                 FROM ({latest}) AS latest
                 WHERE NOT EXISTS (
                     SELECT 1 FROM {table} t
                     WHERE t.video_url = latest.video_url
                       AND t.interval_date = latest.interval_date
                 )
                 ORDER BY latest.seq"
            ),
            params![stamp],
        )
        .map_err(sql_error("insert_unmatched"))?;

    Ok(MergeSummary {
        rows_inserted,
        rows_updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{bootstrap, count_rows, get_metrics_for_date};
    use crate::record::{RawBatch, RawRow, REQUIRED_FIELDS};
    use crate::staging::stage;
    use crate::validator::{validate, ValidatedBatch};
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use uuid::Uuid;

    const TABLE: &str = "metrics";

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn raw(url: &str, influencer: &str, publish: Value, likes: Value) -> RawRow {
        let mut r = RawRow::new();
        r.insert("influencer_name".to_string(), json!(influencer));
        r.insert("video_url".to_string(), json!(url));
        r.insert("campaign_name".to_string(), json!("Spring"));
        r.insert("publish_date".to_string(), publish);
        r.insert("like_count".to_string(), likes);
        r
    }

    fn validated(rows: Vec<RawRow>) -> ValidatedBatch {
        validate(&RawBatch::from_rows(rows), day()).unwrap()
    }

    fn apply(conn: &Connection, batch: &ValidatedBatch, ts: DateTime<Utc>) -> Result<MergeSummary, MergeError> {
        let area = stage(conn, Uuid::new_v4(), batch).unwrap();
        merge(conn, TABLE, &area, ts)
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn, TABLE).unwrap();
        conn
    }

    #[test]
    fn test_insert_then_update() {
        let conn = setup();

        let first = validated(vec![raw("v1", "Ana", json!("2024-05-01"), json!(10))]);
        let summary = apply(&conn, &first, at(0)).unwrap();
        assert_eq!(summary, MergeSummary { rows_inserted: 1, rows_updated: 0 });

        let second = validated(vec![raw("v1", "Someone Else", json!("2024-05-01"), json!(25))]);
        let summary = apply(&conn, &second, at(60)).unwrap();
        assert_eq!(summary, MergeSummary { rows_inserted: 0, rows_updated: 1 });

        let rows = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].like_count, Some(25));
        assert_eq!(rows[0].influencer_name, "Ana");
        assert_eq!(rows[0].publish_date, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(rows[0].interval_date, day());
        assert_eq!(rows[0].last_updated_at, Some(at(60)));
    }

    #[test]
    fn test_later_duplicate_wins() {
        let conn = setup();
        let batch = validated(vec![
            raw("v2", "Ana", json!(null), json!(5)),
            raw("v3", "Ana", json!(null), json!(1)),
            raw("v2", "Ana", json!(null), json!(9)),
        ]);

        let summary = apply(&conn, &batch, at(0)).unwrap();
        assert_eq!(summary.rows_inserted, 2);

        let rows = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        let v2: Vec<_> = rows.iter().filter(|r| r.video_url == "v2").collect();
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].like_count, Some(9));
    }

    #[test]
    fn test_latest_row_lookup_uses_staging_index() {
        let conn = setup();
        let area = stage(&conn, Uuid::new_v4(), &validated(vec![raw("v1", "Ana", json!(null), json!(1))])).unwrap();

        let plan: Vec<String> = conn
            .prepare(&format!("EXPLAIN QUERY PLAN {}", latest_rows(&area)))
            .unwrap()
            .query_map([], |row| row.get(3))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let index = format!("{}_key", area.table());
        assert!(plan.iter().any(|step| step.contains(&index)), "plan: {:?}", plan);
    }

    #[test]
    fn test_large_batch_with_repeated_keys() {
        let conn = setup();
        // 3000 distinct videos; the first 1000 appear twice, the second copy last
        let rows = |offset: i64| -> Vec<RawRow> {
            (0..3000)
                .chain(0..1000)
                .enumerate()
                .map(|(pos, i)| raw(&format!("v{i}"), "Ana", json!(null), json!(pos as i64 + offset)))
                .collect()
        };

        let first = apply(&conn, &validated(rows(0)), at(0)).unwrap();
        assert_eq!(first, MergeSummary { rows_inserted: 3000, rows_updated: 0 });

        let second = apply(&conn, &validated(rows(10_000)), at(1)).unwrap();
        assert_eq!(second, MergeSummary { rows_inserted: 0, rows_updated: 3000 });

        let stored = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        assert_eq!(stored.len(), 3000);
        let v0 = stored.iter().find(|r| r.video_url == "v0").unwrap();
        let v2999 = stored.iter().find(|r| r.video_url == "v2999").unwrap();
        assert_eq!(v0.like_count, Some(13_000));
        assert_eq!(v2999.like_count, Some(12_999));
    }

    #[test]
    fn test_absent_like_count_overwrites_with_unknown() {
        let conn = setup();
        apply(&conn, &validated(vec![raw("v1", "Ana", json!(null), json!(10))]), at(0)).unwrap();
        apply(&conn, &validated(vec![raw("v1", "Ana", json!(null), json!(null))]), at(1)).unwrap();

        let rows = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        assert_eq!(rows[0].like_count, None);
    }

    #[test]
    fn test_conflicting_publish_date_is_rejected() {
        let conn = setup();
        apply(&conn, &validated(vec![raw("v1", "Ana", json!("2024-05-01"), json!(10))]), at(0)).unwrap();

        let err = apply(
            &conn,
            &validated(vec![raw("v1", "Ana", json!("2024-05-02"), json!(11))]),
            at(1),
        )
        .unwrap_err();

        match err {
            MergeError::PublishDateConflict { video_url, existing, incoming } => {
                assert_eq!(video_url, "v1");
                assert_eq!(existing, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
                assert_eq!(incoming, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // Nothing was written by the failed merge
        let rows = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        assert_eq!(rows[0].like_count, Some(10));
    }

    #[test]
    fn test_unknown_publish_date_is_not_a_conflict() {
        let conn = setup();
        apply(&conn, &validated(vec![raw("v1", "Ana", json!("2024-05-01"), json!(10))]), at(0)).unwrap();
        let summary = apply(&conn, &validated(vec![raw("v1", "Ana", json!(null), json!(12))]), at(1)).unwrap();

        assert_eq!(summary.rows_updated, 1);
        let rows = get_metrics_for_date(&conn, TABLE, day()).unwrap();
        assert_eq!(rows[0].publish_date, NaiveDate::from_ymd_opt(2024, 5, 1));
    }

    #[test]
    fn test_commit_timestamp_strictly_increases() {
        let conn = setup();
        assert_eq!(commit_timestamp(&conn, TABLE, day(), at(0)).unwrap(), at(0));

        apply(&conn, &validated(vec![raw("v1", "Ana", json!(null), json!(1))]), at(10)).unwrap();

        // Clock behind the last write
        let ts = commit_timestamp(&conn, TABLE, day(), at(5)).unwrap();
        assert_eq!(ts, at(10) + Duration::microseconds(1));

        // Clock ahead
        assert_eq!(commit_timestamp(&conn, TABLE, day(), at(20)).unwrap(), at(20));

        // Other dates are unaffected
        let other = day().succ_opt().unwrap();
        assert_eq!(commit_timestamp(&conn, TABLE, other, at(0)).unwrap(), at(0));
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let conn = setup();
        let empty = validate(&RawBatch::with_columns(REQUIRED_FIELDS), day()).unwrap();
        let summary = apply(&conn, &empty, at(0)).unwrap();
        assert_eq!(summary, MergeSummary::default());
        assert_eq!(count_rows(&conn, TABLE).unwrap(), 0);
    }
}
