use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::chunk::FileChunk;
use crate::master_worker::Worker;
use crate::reader::{LineCursor, ReadError};
use crate::stats::SegmentId;
use crate::telemetry::TelemetryRecord;

pub type SpeedSamples = HashMap<SegmentId, Vec<f64>>;

/// What one worker collected from the chunks it was given.
#[derive(Debug, Default)]
pub struct ChunkResult {
    pub chunks: usize,
    /// Non-blank lines looked at.
    pub processed_lines: u64,
    pub valid_samples: u64,
    pub parse_errors: u64,
    pub speeds: SpeedSamples,
    /// Set when a chunk could not be read; the counters above are then partial.
    pub failure: Option<ReadError>,
}

impl ChunkResult {
    /// Folds one line into the result. Only valid records with a positive
    /// speed contribute a sample, keyed by route and line.
    pub(crate) fn absorb_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        self.processed_lines += 1;

        match TelemetryRecord::from_csv_line(line) {
            Ok(record) if record.is_valid() && record.speed > 0 => {
                self.speeds
                    .entry(SegmentId::for_route(record.route_id, record.line_id))
                    .or_default()
                    .push(f64::from(record.speed));
                self.valid_samples += 1;
            }
            Ok(_) => {}
            Err(_) => self.parse_errors += 1,
        }
    }

    pub fn merge(&mut self, other: ChunkResult) {
        self.chunks += other.chunks;
        self.processed_lines += other.processed_lines;
        self.valid_samples += other.valid_samples;
        self.parse_errors += other.parse_errors;
        for (segment, speeds) in other.speeds {
            self.speeds.entry(segment).or_default().extend(speeds);
        }
        if self.failure.is_none() {
            self.failure = other.failure;
        }
    }
}

/// Parses the line ranges it is handed, each through its own file handle.
pub struct ChunkWorker {
    id: usize,
    path: PathBuf,
    result: ChunkResult,
}

impl ChunkWorker {
    pub fn new(id: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            result: ChunkResult::default(),
        }
    }

    fn read_chunk(&mut self, chunk: &FileChunk) -> Result<(), ReadError> {
        let file = File::open(&self.path).map_err(|e| ReadError::io(&self.path, e))?;
        let mut cursor = LineCursor::new(BufReader::new(file));
        cursor
            .skip(chunk.start_line)
            .map_err(|e| ReadError::io(&self.path, e))?;

        while let Some((index, line)) = cursor
            .next_line()
            .map_err(|e| ReadError::io(&self.path, e))?
        {
            if index >= chunk.end_line {
                break;
            }
            self.result.absorb_line(&line);
        }
        Ok(())
    }
}

impl Worker for ChunkWorker {
    type Item = FileChunk;
    type Output = ChunkResult;

    fn process(&mut self, chunk: FileChunk) {
        if chunk.is_empty() {
            return;
        }
        self.result.chunks += 1;
        if let Err(e) = self.read_chunk(&chunk) {
            warn!(worker_id = self.id, %chunk, error = %e, "Chunk read failed");
            if self.result.failure.is_none() {
                self.result.failure = Some(e);
            }
            return;
        }
        debug!(
            worker_id = self.id,
            %chunk,
            processed = self.result.processed_lines,
            segments = self.result.speeds.len(),
            "Chunk done"
        );
    }

    fn finish(self) -> ChunkResult {
        self.result
    }
}
