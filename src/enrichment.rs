// 🎬 Enrichment - per-video metadata joined onto a raw batch
// The metadata service is a seam: anything implementing VideoMetadataSource.
// A failed lookup leaves the row's values absent; it never fails the batch.

use crate::db::format_date;
use crate::observability::{RunEvent, RunSink};
use crate::record::{parse_date, RawBatch};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub publish_date: Option<NaiveDate>,
    pub like_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupFailure {
    #[error("no video id in url")]
    UnrecognizedUrl,
    #[error("video {0} not found")]
    NotFound(String),
    #[error("metadata service error: {0}")]
    Service(String),
}

pub trait VideoMetadataSource {
    fn lookup(&self, video_id: &str) -> Result<VideoMetadata, LookupFailure>;
}

impl<F> VideoMetadataSource for F
where
    F: Fn(&str) -> Result<VideoMetadata, LookupFailure>,
{
    fn lookup(&self, video_id: &str) -> Result<VideoMetadata, LookupFailure> {
        self(video_id)
    }
}

/// Video id from a watch, short-link, shorts or embed URL.
pub fn video_id_from_url(url: &str) -> Option<&str> {
    let url = url.trim();
    let start = ["?v=", "&v="]
        .iter()
        .find_map(|marker| url.find(marker).map(|i| i + marker.len()))
        .or_else(|| {
            ["youtu.be/", "/shorts/", "/embed/"]
                .iter()
                .find_map(|marker| url.find(marker).map(|i| i + marker.len()))
        })?;

    let rest = &url[start..];
    let end = rest.find(['&', '#', '?', '/']).unwrap_or(rest.len());
    let id = &rest[..end];

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

// ============================================================================
// OFFLINE METADATA TABLE
// ============================================================================

#[derive(Debug, Deserialize)]
struct MetadataRow {
    #[serde(alias = "video_url", alias = "Video_Url")]
    video_id: String,
    #[serde(default)]
    publish_date: Option<String>,
    #[serde(default, alias = "current_likes_count")]
    like_count: Option<i64>,
}

/// Metadata keyed by video id, loaded from a CSV snapshot of the service.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    by_id: HashMap<String, VideoMetadata>,
}

impl MetadataTable {
    pub fn insert(&mut self, video_id: impl Into<String>, metadata: VideoMetadata) {
        self.by_id.insert(video_id.into(), metadata);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open metadata file {}", path.display()))?;
        Self::read(file)
    }

    /// Columns: `video_id` (or a video URL), `publish_date`, `like_count`.
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut table = MetadataTable::default();

        for result in rdr.deserialize() {
            let row: MetadataRow = result.context("Failed to deserialize metadata row")?;
            let id = video_id_from_url(&row.video_id)
                .unwrap_or(&row.video_id)
                .to_string();
            let publish_date = row.publish_date.as_deref().and_then(parse_date);
            table.insert(
                id,
                VideoMetadata {
                    publish_date,
                    like_count: row.like_count,
                },
            );
        }

        Ok(table)
    }
}

impl VideoMetadataSource for MetadataTable {
    fn lookup(&self, video_id: &str) -> Result<VideoMetadata, LookupFailure> {
        self.by_id
            .get(video_id)
            .cloned()
            .ok_or_else(|| LookupFailure::NotFound(video_id.to_string()))
    }
}

// ============================================================================
// ENRICH
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub enriched: usize,
    pub failed: usize,
}

/// Set `publish_date` and `like_count` on every row from `source`.
pub fn enrich_batch(
    batch: &mut RawBatch,
    source: &dyn VideoMetadataSource,
    sink: &dyn RunSink,
) -> EnrichmentReport {
    batch.add_column("publish_date");
    batch.add_column("like_count");

    let mut report = EnrichmentReport::default();

    for row in batch.rows_mut() {
        let url = match row.get("video_url") {
            Some(Value::String(url)) => url.clone(),
            _ => String::new(),
        };

        let looked_up = video_id_from_url(&url)
            .ok_or(LookupFailure::UnrecognizedUrl)
            .and_then(|id| source.lookup(id));

        let metadata = match looked_up {
            Ok(metadata) => {
                report.enriched += 1;
                metadata
            }
            Err(failure) => {
                report.failed += 1;
                sink.record(&RunEvent::EnrichmentFailed {
                    video_url: url,
                    reason: failure.to_string(),
                });
                VideoMetadata::default()
            }
        };

        row.insert(
            "publish_date".to_string(),
            metadata
                .publish_date
                .map(|d| Value::String(format_date(d)))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "like_count".to_string(),
            metadata.like_count.map(Value::from).unwrap_or(Value::Null),
        );
    }

    report
}
