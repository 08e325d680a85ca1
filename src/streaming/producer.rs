use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam::channel::Sender;
use tracing::{debug, info};

use super::{PipelineCounters, StopSignal};
use crate::reader::{ReadError, TelemetryReader};
use crate::telemetry::TelemetryRecord;

const PROGRESS_EVERY: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub lines_read: u64,
    pub records_queued: u64,
    pub parse_errors: u64,
    /// True if the run ended because of a stop request or a closed queue
    /// rather than the end of the file or the record cap.
    pub interrupted: bool,
}

/// Reads valid records from a telemetry file into the pipeline queue.
#[derive(Debug, Clone)]
pub struct Producer {
    path: PathBuf,
    max_records: Option<u64>,
    counters: Arc<PipelineCounters>,
}

impl Producer {
    pub fn new(
        path: impl Into<PathBuf>,
        max_records: Option<u64>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            path: path.into(),
            max_records,
            counters,
        }
    }

    /// Fills `queue` until the file ends, the cap is reached, `stop` fires or
    /// the receiving side goes away. Blocks whenever the queue is full.
    ///
    /// The sender is consumed and dropped on return, which is how the
    /// processor learns that no more records are coming.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn run(
        &self,
        queue: Sender<TelemetryRecord>,
        stop: &StopSignal,
    ) -> Result<ProducerReport, ReadError> {
        let counters = &self.counters;
        counters.producer_active.store(true, Ordering::SeqCst);
        let _active = ActiveFlag(counters);

        let mut report = ProducerReport::default();
        if self.max_records == Some(0) {
            return Ok(report);
        }

        let stats = TelemetryReader::new(&self.path).read_with_progress(
            || {
                counters.lines_read.fetch_add(1, Ordering::Relaxed);
            },
            |record| record.is_valid(),
            |record| {
                if stop.is_triggered() || queue.send(record).is_err() {
                    report.interrupted = true;
                    return ControlFlow::Break(());
                }
                report.records_queued += 1;
                counters.records_queued.fetch_add(1, Ordering::Relaxed);

                if report.records_queued % PROGRESS_EVERY == 0 {
                    debug!(queued = report.records_queued, "Producer progress");
                }
                if self
                    .max_records
                    .is_some_and(|max| report.records_queued >= max)
                {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            },
        )?;

        report.lines_read = stats.total_lines;
        report.parse_errors = stats.errors;

        info!(
            lines_read = report.lines_read,
            records_queued = report.records_queued,
            parse_errors = report.parse_errors,
            interrupted = report.interrupted,
            "Producer finished"
        );
        Ok(report)
    }
}

struct ActiveFlag<'a>(&'a PipelineCounters);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.producer_active.store(false, Ordering::SeqCst);
    }
}
