//! Output formatting and persistence for segment statistics and run reports.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use std::fmt::Debug;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::stats::SegmentStatistics;

/// One CSV row per segment. CSV cannot hold the nested key, so it is
/// flattened here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentRow {
    pub route_id: i32,
    pub line_id: i32,
    pub origin_stop_id: i32,
    pub dest_stop_id: i32,
    pub sample_count: usize,
    pub average_kmh: f64,
    pub median_kmh: f64,
    pub min_kmh: f64,
    pub max_kmh: f64,
    pub std_dev_kmh: f64,
    pub p90_kmh: f64,
    pub p95_kmh: f64,
    pub reliable: bool,
}

impl From<&SegmentStatistics> for SegmentRow {
    fn from(stats: &SegmentStatistics) -> Self {
        Self {
            route_id: stats.segment.route_id,
            line_id: stats.segment.line_id,
            origin_stop_id: stats.segment.origin_stop_id,
            dest_stop_id: stats.segment.dest_stop_id,
            sample_count: stats.sample_count,
            average_kmh: stats.average,
            median_kmh: stats.median,
            min_kmh: stats.min,
            max_kmh: stats.max,
            std_dev_kmh: stats.std_dev,
            p90_kmh: stats.p90,
            p95_kmh: stats.p95,
            reliable: stats.is_reliable(),
        }
    }
}

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends one serializable record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: impl AsRef<Path>, record: &T) -> Result<()> {
    append_rows(path.as_ref(), std::iter::once(record))
}

/// Appends one row per segment, ordered by segment key.
pub fn append_segments(path: impl AsRef<Path>, stats: &[SegmentStatistics]) -> Result<usize> {
    let mut rows: Vec<SegmentRow> = stats.iter().map(SegmentRow::from).collect();
    rows.sort_by_key(|r| (r.route_id, r.line_id, r.origin_stop_id, r.dest_stop_id));
    append_rows(path.as_ref(), rows.iter())?;
    Ok(rows.len())
}

fn append_rows<'a, T, I>(path: &Path, rows: I) -> Result<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV records");

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}
