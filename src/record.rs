// 📋 Record Model - fixed-schema campaign metrics rows
// Classifies raw rows as conforming or rejected. Never raises.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Columns every batch must carry.
pub const REQUIRED_FIELDS: [&str; 5] = [
    "influencer_name",
    "video_url",
    "campaign_name",
    "publish_date",
    "like_count",
];

/// Header names the upstream sheet or enrichment step may use instead of ours.
const COLUMN_ALIASES: [(&str, &str); 1] = [("current_likes_count", "like_count")];

/// One raw row: column name -> cell. Missing key and `null` both mean absent.
pub type RawRow = BTreeMap<String, Value>;

/// Normalize a header: trimmed, lower-cased, aliases resolved.
/// `Influencer_Name` and `influencer_name` are the same column.
pub fn normalize_column(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lowered)
}

// ============================================================================
// RAW BATCH
// ============================================================================

/// An ordered batch of raw rows as produced upstream, with its column set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    columns: Vec<String>,
    rows: Vec<RawRow>,
    /// Row index -> column whose spellings carried different values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    conflicts: BTreeMap<usize, String>,
}

impl RawBatch {
    /// Empty batch with a declared column set (e.g. a CSV header).
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = RawBatch::default();
        for column in columns {
            batch.add_column(column.as_ref());
        }
        batch
    }

    /// Batch whose column set is the union of keys across `rows`, in order of
    /// first appearance.
    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        let mut batch = RawBatch::default();
        for row in rows {
            batch.push_row(row);
        }
        batch
    }

    /// Append a row, normalizing its keys and widening the column set.
    ///
    /// Two keys that normalize to one column (`Video_Url` and `video_url`)
    /// must agree; otherwise the row is marked conflicting and validation
    /// rejects it.
    pub fn push_row(&mut self, row: RawRow) {
        let mut normalized = RawRow::new();
        let mut conflict = None;
        for (key, value) in row {
            let key = normalize_column(&key);
            self.add_column(&key);
            if matches!(normalized.get(&key), Some(previous) if *previous != value) {
                conflict.get_or_insert_with(|| key.clone());
            }
            normalized.insert(key, value);
        }
        if let Some(column) = conflict {
            self.conflicts.insert(self.rows.len(), column);
        }
        self.rows.push(normalized);
    }

    /// Column that row `index` carried twice with different values.
    pub fn conflicting_column(&self, index: usize) -> Option<&str> {
        self.conflicts.get(&index).map(String::as_str)
    }

    pub fn add_column(&mut self, name: &str) {
        let name = normalize_column(name);
        if !self.columns.contains(&name) {
            self.columns.push(name);
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        let name = normalize_column(name);
        self.columns.iter().any(|c| *c == name)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [RawRow] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ============================================================================
// METRICS RECORD
// ============================================================================

/// One row of campaign performance for one video on one calendar day.
///
/// `last_updated_at` is assigned by storage; it is `None` until the record has
/// been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub influencer_name: String,
    pub video_url: String,
    pub campaign_name: String,
    pub publish_date: Option<NaiveDate>,
    pub like_count: Option<i64>,
    pub interval_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// A conforming row before the run's interval date is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub influencer_name: String,
    pub video_url: String,
    pub campaign_name: String,
    pub publish_date: Option<NaiveDate>,
    pub like_count: Option<i64>,
}

impl CandidateRecord {
    pub fn into_record(self, interval_date: NaiveDate) -> MetricsRecord {
        MetricsRecord {
            influencer_name: self.influencer_name,
            video_url: self.video_url,
            campaign_name: self.campaign_name,
            publish_date: self.publish_date,
            like_count: self.like_count,
            interval_date,
            last_updated_at: None,
        }
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MissingValue(String),
    InvalidDate(String),
    InvalidLikeCount(String),
    NegativeLikeCount(i64),
    ConflictingColumn(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingValue(field) => write!(f, "{} is empty", field),
            RejectReason::InvalidDate(raw) => write!(f, "publish_date '{}' is not a date", raw),
            RejectReason::InvalidLikeCount(raw) => {
                write!(f, "like_count '{}' is not an integer", raw)
            }
            RejectReason::NegativeLikeCount(n) => write!(f, "like_count {} is negative", n),
            RejectReason::ConflictingColumn(column) => {
                write!(f, "{} given twice with different values", column)
            }
        }
    }
}

/// A row left out of the batch, with its position in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub index: usize,
    pub video_url: Option<String>,
    pub reason: RejectReason,
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.video_url {
            Some(url) => write!(f, "row {} ({}): {}", self.index, url, self.reason),
            None => write!(f, "row {}: {}", self.index, self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowClass {
    Conforming(CandidateRecord),
    Rejected(RowRejection),
}

/// Classify one raw row. `index` is the row's position in its batch.
pub fn classify(index: usize, row: &RawRow) -> RowClass {
    let video_url = text_cell(row, "video_url");
    let reject = |reason| {
        RowClass::Rejected(RowRejection {
            index,
            video_url: video_url.clone(),
            reason,
        })
    };

    let Some(url) = video_url.clone() else {
        return reject(RejectReason::MissingValue("video_url".to_string()));
    };
    let Some(influencer_name) = text_cell(row, "influencer_name") else {
        return reject(RejectReason::MissingValue("influencer_name".to_string()));
    };
    let Some(campaign_name) = text_cell(row, "campaign_name") else {
        return reject(RejectReason::MissingValue("campaign_name".to_string()));
    };

    let publish_date = match parse_date_cell(row.get("publish_date")) {
        Ok(date) => date,
        Err(reason) => return reject(reason),
    };
    let like_count = match parse_like_count_cell(row.get("like_count")) {
        Ok(count) => count,
        Err(reason) => return reject(reason),
    };

    RowClass::Conforming(CandidateRecord {
        influencer_name,
        video_url: url,
        campaign_name,
        publish_date,
        like_count,
    })
}

/// Non-empty trimmed text, or None.
pub(crate) fn text_cell(row: &RawRow, field: &str) -> Option<String> {
    let text = match row.get(field)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp. Empty means absent.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn parse_date_cell(cell: Option<&Value>) -> Result<Option<NaiveDate>, RejectReason> {
    match cell {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_date(s)
            .map(Some)
            .ok_or_else(|| RejectReason::InvalidDate(s.clone())),
        Some(other) => Err(RejectReason::InvalidDate(other.to_string())),
    }
}

fn parse_like_count_cell(cell: Option<&Value>) -> Result<Option<i64>, RejectReason> {
    let count = match cell {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => f as i64,
            _ => return Err(RejectReason::InvalidLikeCount(n.to_string())),
        },
        Some(Value::String(s)) => {
            // Sheets render large counts with thousands separators.
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            match cleaned.parse::<i64>() {
                Ok(i) => i,
                Err(_) => match cleaned.parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => f as i64,
                    _ => return Err(RejectReason::InvalidLikeCount(s.clone())),
                },
            }
        }
        Some(other) => return Err(RejectReason::InvalidLikeCount(other.to_string())),
    };

    if count < 0 {
        Err(RejectReason::NegativeLikeCount(count))
    } else {
        Ok(Some(count))
    }
}
