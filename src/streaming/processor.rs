use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::info;

use super::{BusPosition, PipelineCounters, PositionBoard, StopSignal};
use crate::config::StreamingConfig;
use crate::events::{BusEvent, EventKind, EventSink};
use crate::notify::Notifier;
use crate::telemetry::TelemetryRecord;

/// Speed above which a record raises a speeding event, in km/h.
pub const SPEEDING_THRESHOLD_KMH: i32 = 80;
/// Speed below which a record raises a stopped event, in km/h.
pub const STOPPED_THRESHOLD_KMH: i32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub processed: u64,
    pub events_generated: u64,
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

/// Delay to apply before a record stamped `current` when the previous one was
/// stamped `previous`: the gap scaled down by the acceleration factor and
/// capped at `max_delay`. Zero when pacing is off or time did not move forward.
pub fn pacing_delay(
    previous: NaiveDateTime,
    current: NaiveDateTime,
    config: &StreamingConfig,
) -> Duration {
    if !config.pacing {
        return Duration::ZERO;
    }
    let gap_ms = (current - previous).num_milliseconds();
    if gap_ms <= 0 {
        return Duration::ZERO;
    }
    let secs = gap_ms as f64 / 1_000.0 / config.acceleration_factor;
    Duration::try_from_secs_f64(secs)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Events raised by a single record. Every record yields a position update;
/// speeding and stopped events are added on top when thresholds are crossed.
pub fn derive_events(record: &TelemetryRecord) -> Vec<BusEvent> {
    let mut events = Vec::with_capacity(2);
    let at = |kind: EventKind, description: String| {
        BusEvent::new(record.vehicle_code, kind, description, record.timestamp)
            .with_route(record.route_id, record.line_id)
            .with_location(record.latitude(), record.longitude())
    };

    if record.speed > SPEEDING_THRESHOLD_KMH {
        events.push(at(
            EventKind::Speeding,
            format!("Bus exceeds safe speed: {} km/h", record.speed),
        ));
    }
    if (0..STOPPED_THRESHOLD_KMH).contains(&record.speed) {
        events.push(at(EventKind::Stopped, "Bus stopped or at a stop".to_string()));
    }
    events.push(at(EventKind::PositionUpdate, "Position update".to_string()));
    events
}

/// Drains the pipeline queue and turns records into positions and events.
pub struct Processor {
    config: StreamingConfig,
    sink: Arc<dyn EventSink>,
    notifier: Option<Arc<dyn Notifier>>,
    board: Arc<PositionBoard>,
    counters: Arc<PipelineCounters>,
}

impl Processor {
    pub fn new(
        config: StreamingConfig,
        sink: Arc<dyn EventSink>,
        board: Arc<PositionBoard>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            config,
            sink,
            notifier: None,
            board,
            counters,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Processes records in queue order until the producer has hung up and
    /// the queue is empty, or `stop` fires.
    pub fn run(&self, queue: Receiver<TelemetryRecord>, stop: &StopSignal) -> ProcessorReport {
        self.counters.processor_active.store(true, Ordering::SeqCst);
        info!(
            pacing = self.config.pacing,
            acceleration = self.config.acceleration_factor,
            batch_size = self.config.batch_size,
            "Processor started"
        );

        let started = Instant::now();
        let mut report = ProcessorReport::default();
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let mut last_timestamp: Option<NaiveDateTime> = None;

        'run: while !stop.is_triggered() {
            match queue.recv_timeout(self.config.poll_interval) {
                Ok(record) => batch.push(record),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while batch.len() < self.config.batch_size {
                match queue.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }

            for record in batch.drain(..) {
                if let Some(previous) = last_timestamp {
                    let delay = pacing_delay(previous, record.timestamp, &self.config);
                    if !delay.is_zero() && stop.wait(delay) {
                        break 'run;
                    }
                }
                if stop.is_triggered() {
                    break 'run;
                }
                last_timestamp = Some(record.timestamp);

                report.events_generated += self.process(&record);
                report.processed += 1;

                if self.config.report_every > 0 && report.processed % self.config.report_every == 0
                {
                    let secs = started.elapsed().as_secs_f64().max(1e-3);
                    info!(
                        processed = report.processed,
                        events = report.events_generated,
                        per_sec = report.processed as f64 / secs,
                        "Processor progress"
                    );
                }
            }
        }

        report.stopped_early = stop.is_triggered();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters.processor_active.store(false, Ordering::SeqCst);
        info!(
            processed = report.processed,
            events = report.events_generated,
            elapsed_ms = report.elapsed_ms,
            stopped_early = report.stopped_early,
            "Processor finished"
        );
        report
    }

    fn process(&self, record: &TelemetryRecord) -> u64 {
        self.board.update(BusPosition::from_record(record));

        let mut generated = 0;
        for event in derive_events(record) {
            if let Some(notifier) = &self.notifier {
                notifier.announce(&event);
            }
            self.sink.publish(event);
            generated += 1;
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_generated
            .fetch_add(generated, Ordering::Relaxed);
        generated
    }
}
