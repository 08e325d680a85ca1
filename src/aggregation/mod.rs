//! Turns a telemetry file into per-segment speed statistics.
//!
//! The parallel path counts the lines once, splits the data lines into one
//! contiguous chunk per worker and lets each worker parse its chunk through
//! its own file handle. Partial sample maps are merged on the calling thread
//! before statistics are built, so no shared map is written concurrently.

mod chunk;
mod worker;

pub use chunk::{FileChunk, partition};
pub use worker::{ChunkResult, ChunkWorker, SpeedSamples};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AggregationConfig;
use crate::master_worker::{self, MasterError, Worker};
use crate::reader::{self, ReadError};
use crate::stats::SegmentStatisticsBuilder;
use crate::store::StatsMap;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Master(#[from] MasterError),
}

/// Merged raw samples of one run, before statistics are computed.
#[derive(Debug)]
pub struct CollectedSamples {
    pub data_lines: u64,
    pub workers_expected: usize,
    pub workers_completed: usize,
    pub merged: ChunkResult,
}

/// Outcome of an aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    #[serde(skip)]
    pub stats: StatsMap,
    pub data_lines: u64,
    pub processed_lines: u64,
    pub valid_samples: u64,
    pub parse_errors: u64,
    pub unique_segments: usize,
    pub workers_expected: usize,
    pub workers_completed: usize,
    pub duration_ms: u64,
}

impl AggregationReport {
    /// True when every worker handed back a result.
    pub fn is_complete(&self) -> bool {
        self.workers_completed == self.workers_expected
    }

    fn from_samples(samples: CollectedSamples, duration: Duration) -> Self {
        let CollectedSamples {
            data_lines,
            workers_expected,
            workers_completed,
            merged,
        } = samples;

        let stats: StatsMap = merged
            .speeds
            .into_iter()
            .map(|(segment, speeds)| {
                let built = SegmentStatisticsBuilder::new(segment)
                    .add_samples(speeds)
                    .build();
                (segment, built)
            })
            .collect();

        AggregationReport {
            unique_segments: stats.len(),
            stats,
            data_lines,
            processed_lines: merged.processed_lines,
            valid_samples: merged.valid_samples,
            parse_errors: merged.parse_errors,
            workers_expected,
            workers_completed,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

impl fmt::Display for AggregationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aggregation[lines={}, samples={}, errors={}, segments={}, workers={}/{}, {} ms]",
            self.processed_lines,
            self.valid_samples,
            self.parse_errors,
            self.unique_segments,
            self.workers_completed,
            self.workers_expected,
            self.duration_ms
        )
    }
}

/// Aggregates one telemetry file.
#[derive(Debug, Clone)]
pub struct TelemetryAggregator {
    path: PathBuf,
    config: AggregationConfig,
}

impl TelemetryAggregator {
    pub fn new(path: impl AsRef<Path>, config: AggregationConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data lines to consider: everything after the header, capped by
    /// `max_records` when set.
    fn data_lines(&self) -> Result<u64, ReadError> {
        let total = reader::count_lines(&self.path)?;
        let data = total.saturating_sub(1);
        Ok(match self.config.max_records {
            Some(cap) => data.min(cap),
            None => data,
        })
    }

    /// Collects samples with one chunk per configured worker.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read by any worker or the pool cannot start.
    pub fn collect_parallel(&self) -> Result<CollectedSamples, AggregationError> {
        let data_lines = self.data_lines()?;
        let workers = self.config.workers;
        let chunks = partition(data_lines, workers);
        info!(data_lines, workers, "Partitioned telemetry file");

        let path = self.path.clone();
        let (workers_completed, merged) = master_worker::run_once(
            workers,
            chunks,
            |id| ChunkWorker::new(id, path.clone()),
            |partials| {
                let completed = partials.len();
                let merged = partials
                    .into_iter()
                    .fold(ChunkResult::default(), |mut acc, partial| {
                        acc.merge(partial.output);
                        acc
                    });
                (completed, merged)
            },
        )?;

        finish_collection(data_lines, workers, workers_completed, merged)
    }

    /// Single pass on the calling thread over the same lines the parallel
    /// path would read.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn collect_sequential(&self) -> Result<CollectedSamples, AggregationError> {
        let data_lines = self.data_lines()?;
        let mut worker = ChunkWorker::new(0, self.path.clone());
        for chunk in partition(data_lines, 1) {
            worker.process(chunk);
        }
        finish_collection(data_lines, 1, 1, worker.finish())
    }

    /// Runs the parallel aggregation and builds statistics per segment.
    ///
    /// # Errors
    ///
    /// See [`TelemetryAggregator::collect_parallel`].
    #[tracing::instrument(skip(self), fields(path = %self.path.display(), workers = self.config.workers))]
    pub fn aggregate(&self) -> Result<AggregationReport, AggregationError> {
        let start = Instant::now();
        let samples = self.collect_parallel()?;
        let report = AggregationReport::from_samples(samples, start.elapsed());
        log_report(&report);
        Ok(report)
    }

    /// Sequential counterpart of [`TelemetryAggregator::aggregate`].
    ///
    /// # Errors
    ///
    /// See [`TelemetryAggregator::collect_sequential`].
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub fn aggregate_sequential(&self) -> Result<AggregationReport, AggregationError> {
        let start = Instant::now();
        let samples = self.collect_sequential()?;
        let report = AggregationReport::from_samples(samples, start.elapsed());
        log_report(&report);
        Ok(report)
    }
}

fn finish_collection(
    data_lines: u64,
    workers_expected: usize,
    workers_completed: usize,
    mut merged: ChunkResult,
) -> Result<CollectedSamples, AggregationError> {
    if let Some(failure) = merged.failure.take() {
        return Err(failure.into());
    }
    Ok(CollectedSamples {
        data_lines,
        workers_expected,
        workers_completed,
        merged,
    })
}

fn log_report(report: &AggregationReport) {
    if !report.is_complete() {
        warn!(
            completed = report.workers_completed,
            expected = report.workers_expected,
            "Aggregation is missing worker results"
        );
    }
    info!(
        processed = report.processed_lines,
        samples = report.valid_samples,
        errors = report.parse_errors,
        segments = report.unique_segments,
        duration_ms = report.duration_ms,
        "Aggregation finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SegmentId;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,date,vehicleCode,lineId,latitudeMicro,longitudeMicro,speed,routeId,state,eventId,timestamp,sequence";

    fn telemetry_file(rows: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for i in 0..rows {
            let route = 100 + (i % 4) as i32;
            let speed = (i % 37) as i32;
            writeln!(
                file,
                "0,28-MAY-19,{},{route},3451234,-76512345,{speed},{route},1,{i},2019-05-28 18:14:43,{i}",
                1 + i % 9
            )
            .unwrap();
            if i % 50 == 0 {
                writeln!(file, "broken line").unwrap();
            }
        }
        file.flush().unwrap();
        file
    }

    fn config(workers: usize) -> AggregationConfig {
        AggregationConfig {
            workers,
            max_records: None,
        }
    }

    fn sorted_samples(samples: &CollectedSamples) -> Vec<(SegmentId, Vec<f64>)> {
        let mut out: Vec<(SegmentId, Vec<f64>)> = samples
            .merged
            .speeds
            .iter()
            .map(|(k, v)| {
                let mut v = v.clone();
                v.sort_by(f64::total_cmp);
                (*k, v)
            })
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let file = telemetry_file(500);
        let sequential = TelemetryAggregator::new(file.path(), config(1))
            .collect_sequential()
            .unwrap();

        for workers in 1..=6 {
            let parallel = TelemetryAggregator::new(file.path(), config(workers))
                .collect_parallel()
                .unwrap();
            assert_eq!(sorted_samples(&parallel), sorted_samples(&sequential));
            assert_eq!(parallel.merged.parse_errors, sequential.merged.parse_errors);
            assert_eq!(parallel.workers_completed, workers);
        }
    }

    #[test]
    fn test_report_statistics() {
        let file = telemetry_file(200);
        let report = TelemetryAggregator::new(file.path(), config(3))
            .aggregate()
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.parse_errors, 4);
        assert_eq!(report.unique_segments, 4);
        assert_eq!(report.processed_lines, 204);
        let seg = &report.stats[&SegmentId::for_route(100, 100)];
        assert!(seg.is_reliable());
        assert!(seg.min > 0.0);
    }

    #[test]
    fn test_max_records_caps_data_lines() {
        let file = telemetry_file(100);
        let capped = AggregationConfig {
            workers: 2,
            max_records: Some(10),
        };
        let aggregator = TelemetryAggregator::new(file.path(), capped);

        let parallel = aggregator.aggregate().unwrap();
        let sequential = aggregator.aggregate_sequential().unwrap();

        assert_eq!(parallel.data_lines, 10);
        assert_eq!(parallel.processed_lines, 10);
        assert_eq!(sequential.processed_lines, 10);
        assert_eq!(parallel.valid_samples, sequential.valid_samples);
    }

    #[test]
    fn test_header_only_file() {
        let file = telemetry_file(0);
        let report = TelemetryAggregator::new(file.path(), config(4))
            .aggregate()
            .unwrap();

        assert_eq!(report.data_lines, 0);
        assert!(report.stats.is_empty());
        assert!(report.is_complete());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = TelemetryAggregator::new("/no/such/file.csv", config(2))
            .aggregate()
            .unwrap_err();
        assert!(matches!(err, AggregationError::Read(ReadError::Io { .. })));
    }
}
