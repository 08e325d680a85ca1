use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use super::{
    BusPosition, PipelineCounters, PipelineStats, PositionBoard, Processor, ProcessorReport,
    Producer, ProducerReport, StopSignal,
};
use crate::config::{ConfigError, StreamingConfig};
use crate::events::EventStore;
use crate::notify::Notifier;

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("streaming pipeline is already running")]
    AlreadyRunning,
    #[error("cannot open telemetry file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct RunHandle {
    producer: JoinHandle<Option<ProducerReport>>,
    processor: JoinHandle<ProcessorReport>,
    done_rx: Receiver<&'static str>,
}

/// Reports on drop so the service learns about a thread exit even on panic.
struct DoneGuard {
    tx: Sender<&'static str>,
    role: &'static str,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.role);
    }
}

/// Final figures of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub producer: Option<ProducerReport>,
    pub processor: Option<ProcessorReport>,
    pub stats: PipelineStats,
}

/// Runs the producer and the processor on two threads and exposes their
/// shared state.
pub struct StreamingService {
    path: PathBuf,
    config: StreamingConfig,
    events: Arc<EventStore>,
    notifier: Option<Arc<dyn Notifier>>,
    board: Arc<PositionBoard>,
    counters: Arc<PipelineCounters>,
    signal: Mutex<Option<StopSignal>>,
    run: Mutex<Option<RunHandle>>,
}

impl StreamingService {
    pub fn new(path: impl AsRef<Path>, config: StreamingConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            events: Arc::new(EventStore::new()),
            notifier: None,
            board: Arc::new(PositionBoard::new()),
            counters: Arc::new(PipelineCounters::default()),
            signal: Mutex::new(None),
            run: Mutex::new(None),
        }
    }

    /// Publishes derived events into `events` instead of a private store.
    pub fn with_event_store(mut self, events: Arc<EventStore>) -> Self {
        self.events = events;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// Starts both pipeline threads.
    ///
    /// # Errors
    ///
    /// Fails if a run is already in progress, the configuration is invalid,
    /// the telemetry file cannot be opened or a thread cannot be spawned.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub fn start(&self) -> Result<(), StreamingError> {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.is_some() {
            return Err(StreamingError::AlreadyRunning);
        }
        self.config.validate()?;
        File::open(&self.path).map_err(|source| StreamingError::Io {
            path: self.path.clone(),
            source,
        })?;

        self.counters.reset();
        self.board.clear();

        let stop = StopSignal::new();
        let (queue_tx, queue_rx) = channel::bounded(self.config.queue_capacity);
        let (done_tx, done_rx) = channel::bounded(2);

        let producer = Producer::new(&self.path, self.config.max_records, self.counters.clone());
        let producer_handle = {
            let thread_stop = stop.clone();
            let guard = DoneGuard {
                tx: done_tx.clone(),
                role: "producer",
            };
            thread::Builder::new()
                .name("telemetry-producer".into())
                .spawn(move || {
                    let _guard = guard;
                    match producer.run(queue_tx, &thread_stop) {
                        Ok(report) => Some(report),
                        Err(e) => {
                            error!(error = %e, "Producer failed");
                            None
                        }
                    }
                })
                .map_err(StreamingError::Spawn)?
        };

        let mut processor = Processor::new(
            self.config.clone(),
            self.events.clone(),
            self.board.clone(),
            self.counters.clone(),
        );
        if let Some(notifier) = &self.notifier {
            processor = processor.with_notifier(notifier.clone());
        }
        let processor_handle = {
            let thread_stop = stop.clone();
            let guard = DoneGuard {
                tx: done_tx,
                role: "processor",
            };
            thread::Builder::new()
                .name("telemetry-processor".into())
                .spawn(move || {
                    let _guard = guard;
                    processor.run(queue_rx, &thread_stop)
                })
                .map_err(|e| {
                    // Without a processor the producer would block forever.
                    stop.trigger();
                    StreamingError::Spawn(e)
                })?
        };

        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop);
        *run = Some(RunHandle {
            producer: producer_handle,
            processor: processor_handle,
            done_rx,
        });
        info!(
            queue_capacity = self.config.queue_capacity,
            max_records = ?self.config.max_records,
            "Streaming pipeline started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.counters.producer_active.load(Ordering::SeqCst)
            || self.counters.processor_active.load(Ordering::SeqCst)
    }

    /// Asks both threads to stop and waits up to the configured stop timeout
    /// for them. Returns `false` if they did not finish in time; they are then
    /// left to wind down on their own.
    pub fn stop(&self) -> bool {
        if let Some(signal) = self.signal.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            signal.trigger();
        }

        let Some(handle) = self.run.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return true;
        };

        let deadline = Instant::now() + self.config.stop_timeout;
        let mut finished = 0;
        while finished < 2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.done_rx.recv_timeout(remaining) {
                Ok(_) => finished += 1,
                Err(_) => break,
            }
        }

        if finished < 2 {
            warn!(
                finished,
                timeout_secs = self.config.stop_timeout.as_secs_f64(),
                "Pipeline threads did not stop in time"
            );
            return false;
        }
        let _ = handle.producer.join();
        let _ = handle.processor.join();
        info!(stats = %self.stats(), "Streaming pipeline stopped");
        true
    }

    /// Blocks until the current run ends on its own, or returns at once if
    /// nothing is running. [`StreamingService::stop`] may be called from
    /// another thread meanwhile.
    pub fn wait_for_completion(&self) -> RunSummary {
        let handle = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return RunSummary {
                stats: self.stats(),
                ..RunSummary::default()
            };
        };

        let producer = handle.producer.join().ok().flatten();
        let processor = handle.processor.join().ok();
        let summary = RunSummary {
            producer,
            processor,
            stats: self.stats(),
        };
        info!(stats = %summary.stats, "Streaming run complete");
        summary
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            lines_read: self.counters.lines_read.load(Ordering::Relaxed),
            records_queued: self.counters.records_queued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            events_generated: self.counters.events_generated.load(Ordering::Relaxed),
            vehicles_tracked: self.board.len(),
            producer_active: self.counters.producer_active.load(Ordering::SeqCst),
            processor_active: self.counters.processor_active.load(Ordering::SeqCst),
        }
    }

    pub fn latest_position(&self, vehicle_code: i32) -> Option<BusPosition> {
        self.board.get(vehicle_code)
    }

    pub fn all_positions(&self) -> Vec<BusPosition> {
        self.board.all()
    }
}

impl Drop for StreamingService {
    fn drop(&mut self) {
        if self
            .run
            .get_mut()
            .map(|run| run.is_some())
            .unwrap_or(false)
        {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn telemetry_file(rows: i32) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "header").unwrap();
        for i in 0..rows {
            let vehicle = 1 + i % 3;
            let speed = if i == 4 { 95 } else { 30 };
            writeln!(
                file,
                "0,28-MAY-19,{vehicle},131,3451234,-76512345,{speed},131,1,{i},2019-05-28 18:{:02}:00,{i}",
                i % 60
            )
            .unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn fast_config() -> StreamingConfig {
        StreamingConfig {
            pacing: false,
            queue_capacity: 4,
            batch_size: 3,
            max_records: None,
            poll_interval: Duration::from_millis(10),
            ..StreamingConfig::default()
        }
    }

    #[test]
    fn test_run_to_completion() {
        let file = telemetry_file(30);
        let service = StreamingService::new(file.path(), fast_config());

        service.start().unwrap();
        let summary = service.wait_for_completion();

        assert_eq!(summary.stats.records_queued, 30);
        assert_eq!(summary.stats.processed, 30);
        assert_eq!(summary.stats.events_generated, 31);
        assert_eq!(summary.stats.vehicles_tracked, 3);
        assert_eq!(summary.producer.unwrap().records_queued, 30);
        assert!(!service.is_running());

        let counts = service.event_store().count_by_kind();
        assert_eq!(counts[&EventKind::Speeding], 1);
        assert_eq!(service.all_positions().len(), 3);
        assert!(service.latest_position(2).is_some());
    }

    #[test]
    fn test_start_twice_fails() {
        let file = telemetry_file(5);
        let config = StreamingConfig {
            pacing: true,
            acceleration_factor: 1.0,
            ..fast_config()
        };
        let service = StreamingService::new(file.path(), config);

        service.start().unwrap();
        assert!(matches!(service.start(), Err(StreamingError::AlreadyRunning)));
        assert!(service.stop());
    }

    #[test]
    fn test_stop_interrupts_slow_replay() {
        let file = telemetry_file(10);
        let config = StreamingConfig {
            pacing: true,
            acceleration_factor: 1.0,
            ..fast_config()
        };
        let service = StreamingService::new(file.path(), config);
        service.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert!(service.stop());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(service.stats().processed < 10);
    }

    #[test]
    fn test_missing_file_fails_start() {
        let service = StreamingService::new("/no/such/stream.csv", fast_config());
        assert!(matches!(service.start(), Err(StreamingError::Io { .. })));
        assert!(!service.is_running());
    }

    #[test]
    fn test_invalid_config_fails_start() {
        let file = telemetry_file(1);
        let config = StreamingConfig {
            acceleration_factor: -1.0,
            ..fast_config()
        };
        let service = StreamingService::new(file.path(), config);
        assert!(matches!(service.start(), Err(StreamingError::Config(_))));
    }
}
