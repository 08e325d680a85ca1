//! Line-by-line telemetry file reader.
//!
//! Files can be tens of gigabytes, so nothing here holds more than one line in
//! memory. Malformed lines are counted and skipped unless strict mode is on.

use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::telemetry::{TelemetryParseError, TelemetryRecord};

const PROGRESS_EVERY: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("cannot read telemetry file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed telemetry at line {line_number}: {content:?}")]
    Malformed {
        line_number: u64,
        content: String,
        #[source]
        source: TelemetryParseError,
    },
}

impl ReadError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ReadError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Counters collected over one pass through a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Every line seen, header and blank lines included.
    pub total_lines: u64,
    /// Records that passed the filter and reached the consumer.
    pub processed: u64,
    /// Records parsed fine but rejected by the filter.
    pub filtered: u64,
    pub errors: u64,
    /// Blank lines and the header.
    pub skipped: u64,
}

impl ReadStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_lines == 0 {
            0.0
        } else {
            self.errors as f64 * 100.0 / self.total_lines as f64
        }
    }
}

impl fmt::Display for ReadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReadStats[total={}, processed={}, filtered={}, errors={} ({:.2}%), skipped={}]",
            self.total_lines,
            self.processed,
            self.filtered,
            self.errors,
            self.error_rate(),
            self.skipped
        )
    }
}

/// Sequential reader over a telemetry file.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    path: PathBuf,
    strict: bool,
    has_header: bool,
}

impl TelemetryReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            strict: false,
            has_header: true,
        }
    }

    /// In strict mode the first malformed line aborts the read.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn has_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole file, handing every parsed record that passes `filter`
    /// to `consumer`. The consumer may end the read early with
    /// [`ControlFlow::Break`].
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or read, or on the first malformed
    /// line when strict mode is enabled.
    pub fn read_with<F, C>(&self, filter: F, consumer: C) -> Result<ReadStats, ReadError>
    where
        F: FnMut(&TelemetryRecord) -> bool,
        C: FnMut(TelemetryRecord) -> ControlFlow<()>,
    {
        self.read_with_progress(|| {}, filter, consumer)
    }

    /// Like [`read_with`](Self::read_with), but calls `on_line` once for every
    /// line pulled from the file, including the header, blank lines and lines
    /// that fail to parse.
    pub fn read_with_progress<P, F, C>(
        &self,
        mut on_line: P,
        mut filter: F,
        mut consumer: C,
    ) -> Result<ReadStats, ReadError>
    where
        P: FnMut(),
        F: FnMut(&TelemetryRecord) -> bool,
        C: FnMut(TelemetryRecord) -> ControlFlow<()>,
    {
        let file = File::open(&self.path).map_err(|e| ReadError::io(&self.path, e))?;
        let mut cursor = LineCursor::new(BufReader::new(file));
        let mut stats = ReadStats::default();

        while let Some((index, line)) = cursor
            .next_line()
            .map_err(|e| ReadError::io(&self.path, e))?
        {
            stats.total_lines += 1;
            on_line();

            if (index == 0 && self.has_header) || line.trim().is_empty() {
                stats.skipped += 1;
                continue;
            }

            match TelemetryRecord::from_csv_line(&line) {
                Ok(record) => {
                    if filter(&record) {
                        stats.processed += 1;
                        if consumer(record).is_break() {
                            break;
                        }
                    } else {
                        stats.filtered += 1;
                    }
                }
                Err(source) => {
                    stats.errors += 1;
                    if self.strict {
                        return Err(ReadError::Malformed {
                            line_number: index + 1,
                            content: line.into_owned(),
                            source,
                        });
                    }
                }
            }

            if stats.total_lines % PROGRESS_EVERY == 0 {
                debug!(lines = stats.total_lines, "Telemetry read progress");
            }
        }

        Ok(stats)
    }

    /// Reads every record, valid or not.
    pub fn read_all<C>(&self, mut consumer: C) -> Result<ReadStats, ReadError>
    where
        C: FnMut(TelemetryRecord),
    {
        self.read_with(
            |_| true,
            |record| {
                consumer(record);
                ControlFlow::Continue(())
            },
        )
    }

    /// Returns the first `limit` parsable records.
    pub fn read_sample(&self, limit: usize) -> Result<Vec<TelemetryRecord>, ReadError> {
        let mut sample = Vec::with_capacity(limit.min(10_000));
        if limit == 0 {
            return Ok(sample);
        }
        self.read_with(
            |_| true,
            |record| {
                sample.push(record);
                if sample.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )?;
        Ok(sample)
    }
}

/// Counts lines in a file, the last one included even without a trailing newline.
pub fn count_lines(path: impl AsRef<Path>) -> Result<u64, ReadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| ReadError::io(path, e))?;
    let mut cursor = LineCursor::new(BufReader::new(file));
    cursor.skip(u64::MAX).map_err(|e| ReadError::io(path, e))
}

/// Byte-oriented line iterator. Invalid UTF-8 is replaced rather than failing
/// the read, so such a line surfaces as a parse error instead of an I/O error.
pub(crate) struct LineCursor<R> {
    inner: R,
    buf: Vec<u8>,
    consumed: u64,
}

impl<R: BufRead> LineCursor<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(256),
            consumed: 0,
        }
    }

    /// Returns the zero-based index of the next line and its content without
    /// the line terminator.
    pub(crate) fn next_line(&mut self) -> io::Result<Option<(u64, Cow<'_, str>)>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        let index = self.consumed;
        self.consumed += 1;

        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        Ok(Some((index, String::from_utf8_lossy(&self.buf[..end]))))
    }

    /// Skips up to `n` lines, returning how many were actually skipped.
    pub(crate) fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            self.buf.clear();
            if self.inner.read_until(b'\n', &mut self.buf)? == 0 {
                break;
            }
            self.consumed += 1;
            skipped += 1;
        }
        Ok(skipped)
    }
}
