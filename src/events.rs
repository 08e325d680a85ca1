//! Operational bus events and the bounded store that keeps the latest ones.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

/// Events kept by [`EventStore::new`] before the oldest are evicted.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Speeding,
    Stopped,
    PositionUpdate,
}

impl EventKind {
    pub fn category(self) -> EventCategory {
        EventCategory::Operational
    }

    pub fn priority(self) -> EventPriority {
        match self {
            EventKind::Speeding => EventPriority::High,
            EventKind::Stopped | EventKind::PositionUpdate => EventPriority::Low,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventKind::Speeding => "BUS_SPEEDING",
            EventKind::Stopped => "BUS_STOPPED",
            EventKind::PositionUpdate => "POSITION_UPDATE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Operational,
    Mechanical,
    Traffic,
    Safety,
    Emergency,
}

/// Declared most urgent first, so `Critical < Low` in the derived ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl EventPriority {
    pub fn is_higher_than(self, other: EventPriority) -> bool {
        self < other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub id: Uuid,
    pub vehicle_code: i32,
    pub kind: EventKind,
    pub category: EventCategory,
    pub priority: EventPriority,
    pub description: String,
    pub timestamp: NaiveDateTime,
    pub route_id: i32,
    pub line_id: i32,
    pub latitude: f64,
    pub longitude: f64,
}

impl BusEvent {
    /// Creates an event with the kind's default category and priority.
    pub fn new(
        vehicle_code: i32,
        kind: EventKind,
        description: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vehicle_code,
            kind,
            category: kind.category(),
            priority: kind.priority(),
            description: description.into(),
            timestamp,
            route_id: -1,
            line_id: -1,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    pub fn with_route(mut self, route_id: i32, line_id: i32) -> Self {
        self.route_id = route_id;
        self.line_id = line_id;
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    pub fn is_high_priority(&self) -> bool {
        matches!(self.priority, EventPriority::Critical | EventPriority::High)
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} bus={} {} at {}",
            self.priority, self.kind, self.vehicle_code, self.description, self.timestamp
        )
    }
}

/// Anything that accepts published events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// Keeps the most recent events, evicting the oldest once full.
#[derive(Debug)]
pub struct EventStore {
    capacity: usize,
    events: Mutex<VecDeque<BusEvent>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, DEFAULT_EVENT_CAPACITY))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: BusEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<BusEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    /// The last `n` events raised by one vehicle, oldest first.
    pub fn recent_for_vehicle(&self, vehicle_code: i32, n: usize) -> Vec<BusEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<BusEvent> = events
            .iter()
            .rev()
            .filter(|e| e.vehicle_code == vehicle_code)
            .take(n)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = HashMap::new();
        for event in events.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for EventStore {
    fn publish(&self, event: BusEvent) {
        self.push(event);
    }
}
