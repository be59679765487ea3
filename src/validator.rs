// ✅ Batch Validator - schema check before any I/O
// Pure: no connection, no storage, no clock.

use crate::error::SchemaError;
use crate::record::{
    classify, text_cell, MetricsRecord, RawBatch, RejectReason, RowClass, RowRejection,
    REQUIRED_FIELDS,
};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// A batch that passed the column-set check, stamped with one interval date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBatch {
    interval_date: NaiveDate,
    records: Vec<MetricsRecord>,
    rejected: Vec<RowRejection>,
}

impl ValidatedBatch {
    pub fn interval_date(&self) -> NaiveDate {
        self.interval_date
    }

    /// Conforming rows, in input order.
    pub fn records(&self) -> &[MetricsRecord] {
        &self.records
    }

    /// Rows left out, in input order.
    pub fn rejected(&self) -> &[RowRejection] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// SHA-256 over the ordered records. Two applies of the same batch on the
    /// same date share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.interval_date.to_string());
        for r in &self.records {
            hasher.update(format!(
                "\x1e{}\x1f{}\x1f{}\x1f{:?}\x1f{:?}",
                r.influencer_name, r.video_url, r.campaign_name, r.publish_date, r.like_count
            ));
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Columns from `REQUIRED_FIELDS` that `batch` does not carry.
pub fn missing_fields(batch: &RawBatch) -> Vec<String> {
    REQUIRED_FIELDS
        .iter()
        .filter(|field| !batch.has_column(field))
        .map(|field| field.to_string())
        .collect()
}

/// Check the batch's column set and classify every row.
pub fn validate(batch: &RawBatch, interval_date: NaiveDate) -> Result<ValidatedBatch, SchemaError> {
    let missing = missing_fields(batch);
    if !missing.is_empty() {
        return Err(SchemaError {
            missing_fields: missing,
        });
    }

    let mut records = Vec::with_capacity(batch.len());
    let mut rejected = Vec::new();

    for (index, row) in batch.rows().iter().enumerate() {
        let class = match batch.conflicting_column(index) {
            Some(column) => RowClass::Rejected(RowRejection {
                index,
                video_url: text_cell(row, "video_url"),
                reason: RejectReason::ConflictingColumn(column.to_string()),
            }),
            None => classify(index, row),
        };
        match class {
            RowClass::Conforming(candidate) => records.push(candidate.into_record(interval_date)),
            RowClass::Rejected(rejection) => rejected.push(rejection),
        }
    }

    Ok(ValidatedBatch {
        interval_date,
        records,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawRow;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn row(url: &str, likes: serde_json::Value) -> RawRow {
        let mut r = RawRow::new();
        r.insert("Influencer_Name".to_string(), json!("Ana"));
        r.insert("Video_Url".to_string(), json!(url));
        r.insert("Campaign_name".to_string(), json!("Spring"));
        r.insert("publish_date".to_string(), json!("2024-05-20"));
        r.insert("current_likes_count".to_string(), likes);
        r
    }

    #[test]
    fn test_missing_campaign_name_is_schema_error() {
        let batch = RawBatch::with_columns([
            "influencer_name",
            "video_url",
            "publish_date",
            "like_count",
        ]);
        let err = validate(&batch, day()).unwrap_err();
        assert_eq!(err.missing_fields, vec!["campaign_name".to_string()]);
    }

    #[test]
    fn test_every_row_gets_the_run_date() {
        let batch = RawBatch::from_rows(vec![row("v1", json!(10)), row("v2", json!("7"))]);
        let validated = validate(&batch, day()).unwrap();

        assert_eq!(validated.len(), 2);
        assert!(validated.records().iter().all(|r| r.interval_date == day()));
        assert!(validated.records().iter().all(|r| r.last_updated_at.is_none()));
        assert_eq!(validated.records()[1].like_count, Some(7));
    }

    #[test]
    fn test_rejected_rows_are_kept_aside() {
        let batch = RawBatch::from_rows(vec![
            row("v1", json!(10)),
            row("v2", json!(-5)),
            row("v3", json!(3)),
        ]);
        let validated = validate(&batch, day()).unwrap();

        assert_eq!(validated.len(), 2);
        assert_eq!(validated.rejected().len(), 1);
        assert_eq!(validated.rejected()[0].index, 1);
    }

    #[test]
    fn test_disagreeing_like_columns_reject_the_row() {
        let mut twice = row("v2", json!(4));
        twice.insert("like_count".to_string(), json!(9));
        let batch = RawBatch::from_rows(vec![row("v1", json!(10)), twice]);
        let validated = validate(&batch, day()).unwrap();

        assert_eq!(validated.len(), 1);
        assert_eq!(validated.records()[0].video_url, "v1");
        assert_eq!(
            validated.rejected()[0],
            RowRejection {
                index: 1,
                video_url: Some("v2".to_string()),
                reason: RejectReason::ConflictingColumn("like_count".to_string()),
            }
        );
    }

    #[test]
    fn test_empty_batch_with_full_header_is_valid() {
        let batch = RawBatch::with_columns(REQUIRED_FIELDS);
        let validated = validate(&batch, day()).unwrap();
        assert!(validated.is_empty());
    }

    #[test]
    fn test_fingerprint_depends_on_content_and_date() {
        let batch = RawBatch::from_rows(vec![row("v1", json!(10))]);
        let a = validate(&batch, day()).unwrap();
        let b = validate(&batch, day()).unwrap();
        let c = validate(&batch, day().succ_opt().unwrap()).unwrap();
        let changed = validate(&RawBatch::from_rows(vec![row("v1", json!(11))]), day()).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }
}
