//! Replay of a telemetry file as if it were a live feed.
//!
//! A [`Producer`] thread reads valid records into a bounded channel and blocks
//! when it is full. A [`Processor`] thread drains it in batches, keeps the
//! latest [`BusPosition`] per vehicle, derives events and, when pacing is on,
//! sleeps between records according to their recorded timestamps.
//! [`StreamingService`] owns both threads.

mod processor;
mod producer;
mod service;

pub use processor::{Processor, ProcessorReport, derive_events, pacing_delay};
pub use producer::{Producer, ProducerReport};
pub use service::{StreamingError, StreamingService};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::telemetry::TelemetryRecord;

/// Speed above which a vehicle counts as moving, in km/h.
pub const MOVING_THRESHOLD_KMH: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusPosition {
    pub vehicle_code: i32,
    pub route_id: i32,
    pub line_id: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    /// Stop ids are not part of the telemetry feed and stay at -1 here.
    pub current_stop_id: i32,
    pub next_stop_id: i32,
    pub timestamp: NaiveDateTime,
}

impl BusPosition {
    pub fn from_record(record: &TelemetryRecord) -> Self {
        Self {
            vehicle_code: record.vehicle_code,
            route_id: record.route_id,
            line_id: record.line_id,
            latitude: record.latitude(),
            longitude: record.longitude(),
            speed: f64::from(record.speed),
            current_stop_id: -1,
            next_stop_id: -1,
            timestamp: record.timestamp,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.speed > MOVING_THRESHOLD_KMH
    }
}

impl fmt::Display for BusPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus[id={}, route={}, line={}, pos=({:.4},{:.4}), speed={:.1} km/h, time={}]",
            self.vehicle_code,
            self.route_id,
            self.line_id,
            self.latitude,
            self.longitude,
            self.speed,
            self.timestamp
        )
    }
}

/// Latest known position per vehicle. Each update replaces the previous one.
#[derive(Debug, Default)]
pub struct PositionBoard {
    positions: RwLock<HashMap<i32, BusPosition>>,
}

impl PositionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, position: BusPosition) {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(position.vehicle_code, position);
    }

    pub fn get(&self, vehicle_code: i32) -> Option<BusPosition> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vehicle_code)
            .cloned()
    }

    /// Snapshot of every tracked vehicle, ordered by vehicle code.
    pub fn all(&self) -> Vec<BusPosition> {
        let mut all: Vec<BusPosition> = self
            .positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|p| p.vehicle_code);
        all
    }

    pub fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Live counters shared by the producer, the processor and the service.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub lines_read: AtomicU64,
    pub records_queued: AtomicU64,
    pub processed: AtomicU64,
    pub events_generated: AtomicU64,
    pub producer_active: AtomicBool,
    pub processor_active: AtomicBool,
}

impl PipelineCounters {
    pub fn reset(&self) {
        self.lines_read.store(0, Ordering::Relaxed);
        self.records_queued.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.events_generated.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub lines_read: u64,
    pub records_queued: u64,
    pub processed: u64,
    pub events_generated: u64,
    pub vehicles_tracked: usize,
    pub producer_active: bool,
    pub processor_active: bool,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline[read={}, queued={}, processed={}, events={}, buses={}]",
            self.lines_read,
            self.records_queued,
            self.processed,
            self.events_generated,
            self.vehicles_tracked
        )
    }
}

/// One-shot cooperative stop shared by both pipeline threads.
///
/// Triggering drops the only sender of an internal channel, which wakes any
/// thread currently parked in [`StopSignal::wait`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug)]
struct StopInner {
    triggered: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(StopInner {
                triggered: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps for `timeout` unless the signal fires first. Returns `true` if
    /// it fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        !matches!(
            self.inner.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const SAMPLE: &str =
        "0,28-MAY-19,1234,131,3451234,-76512345,32,131,1,1559066083,2019-05-28 18:14:43,42";

    #[test]
    fn test_position_from_record() {
        let record = TelemetryRecord::from_csv_line(SAMPLE).unwrap();
        let position = BusPosition::from_record(&record);

        assert_eq!(position.vehicle_code, 1234);
        assert_eq!(position.next_stop_id, -1);
        assert!(position.is_moving());

        let stopped = BusPosition {
            speed: 1.0,
            ..position
        };
        assert!(!stopped.is_moving());
    }

    #[test]
    fn test_board_keeps_latest() {
        let record = TelemetryRecord::from_csv_line(SAMPLE).unwrap();
        let board = PositionBoard::new();

        board.update(BusPosition::from_record(&record));
        let mut newer = BusPosition::from_record(&record);
        newer.speed = 50.0;
        board.update(newer);

        assert_eq!(board.len(), 1);
        assert_eq!(board.get(1234).unwrap().speed, 50.0);
        assert!(board.get(1).is_none());
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let fired = signal.wait(Duration::from_secs(30));
                (fired, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        signal.trigger();
        let (fired, elapsed) = waiter.join().unwrap();

        assert!(fired);
        assert!(elapsed < Duration::from_secs(10));
        assert!(signal.wait(Duration::from_secs(30)));
    }

    #[test]
    fn test_stop_signal_times_out() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
        assert!(!signal.is_triggered());
    }
}
