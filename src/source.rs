// 📥 Producer - campaign rows from a spreadsheet CSV export
// Header row is the batch's column set; empty cells are absent values.

use crate::record::{RawBatch, RawRow};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::Path;

pub fn read_batch_csv(csv_path: &Path) -> Result<RawBatch> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;
    read_batch(file).with_context(|| format!("Failed to read batch from {}", csv_path.display()))
}

pub fn read_batch<R: Read>(reader: R) -> Result<RawBatch> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV header")?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        bail!("No data found in export");
    }

    let mut batch = RawBatch::with_columns(headers.iter());

    for (line, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to parse CSV row {}", line + 2))?;

        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();

        batch.push_row(row);
    }

    Ok(batch)
}
