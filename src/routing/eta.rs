//! Arrival estimates for a bus heading towards its next stops.
//!
//! Unlike route costs, estimates look statistics up by route and line
//! ([`SegmentId::for_route`]), which is the key the aggregator produces.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::cost::{DEFAULT_SPEED_KMH, HISTORICAL_WEIGHT, travel_minutes};
use crate::graph::{Graph, Orientation, Stop, StopArc, haversine_meters};
use crate::stats::{SegmentId, SegmentStatistics};
use crate::store::SegmentStatsStore;
use crate::streaming::BusPosition;

/// Estimates under this many minutes count as arriving soon.
pub const ARRIVING_SOON_MIN: f64 = 5.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EtaError {
    #[error("next stop {0} is not in the graph")]
    UnknownStop(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// High needs at least 100 samples with a standard deviation under
    /// 10 km/h, medium at least 30. Missing or unreliable statistics are low.
    pub fn for_stats(stats: Option<&SegmentStatistics>) -> Self {
        match stats {
            Some(s) if s.is_reliable() && s.sample_count >= 100 && s.std_dev < 10.0 => {
                Confidence::High
            }
            Some(s) if s.is_reliable() && s.sample_count >= 30 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEta {
    pub vehicle_code: i32,
    pub route_id: i32,
    pub line_id: i32,
    pub stop_id: i32,
    pub stop_name: String,
    pub time_min: f64,
    pub distance_m: f64,
    pub speed_kmh: f64,
    pub confidence: Confidence,
    pub calculated_at: NaiveDateTime,
    pub estimated_arrival: NaiveDateTime,
}

impl BusEta {
    pub fn is_arriving_soon(&self) -> bool {
        self.time_min < ARRIVING_SOON_MIN
    }

    pub fn is_reliable(&self) -> bool {
        self.confidence == Confidence::High
    }
}

impl fmt::Display for BusEta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ETA[bus {} -> {}: {:.1} min ({:.0} m), arrives {}, confidence {}]",
            self.vehicle_code,
            self.stop_name,
            self.time_min,
            self.distance_m,
            self.estimated_arrival.time(),
            self.confidence
        )
    }
}

/// Estimates arrival times from a bus position, the stop graph and the
/// published segment statistics.
#[derive(Debug, Clone)]
pub struct EtaCalculator {
    graph: Arc<Graph>,
    store: Arc<SegmentStatsStore>,
}

impl EtaCalculator {
    pub fn new(graph: Arc<Graph>, store: Arc<SegmentStatsStore>) -> Self {
        Self { graph, store }
    }

    /// Speed to assume for a bus on a segment described by `stats`.
    ///
    /// A reliable historical median is blended with the bus's own speed when
    /// it is moving. Without reliable statistics a moving bus keeps its own
    /// speed, and a stopped one gets [`DEFAULT_SPEED_KMH`].
    pub fn expected_speed(stats: Option<&SegmentStatistics>, position: &BusPosition) -> f64 {
        let live = (position.is_moving() && position.speed > 0.0).then_some(position.speed);
        match (stats.filter(|s| s.is_reliable() && s.median > 0.0), live) {
            (Some(s), Some(live)) => {
                HISTORICAL_WEIGHT * s.median + (1.0 - HISTORICAL_WEIGHT) * live
            }
            (Some(s), None) => s.median,
            (None, Some(live)) => live,
            (None, None) => DEFAULT_SPEED_KMH,
        }
    }

    /// Estimate for the position's next stop.
    ///
    /// # Errors
    ///
    /// Returns [`EtaError::UnknownStop`] if the next stop is not in the graph.
    pub fn calculate_eta(&self, position: &BusPosition) -> Result<BusEta, EtaError> {
        let next = self.next_stop(position)?;
        let stats = self.route_stats(position);
        let speed = Self::expected_speed(stats.as_ref(), position);
        let confidence = Confidence::for_stats(stats.as_ref());

        let distance = distance_from(position, next);
        Ok(self.eta(position, next, distance, speed, confidence))
    }

    /// Estimates for up to `max_stops` stops, starting with the next stop and
    /// following the bus's line from there. Times and distances accumulate
    /// along the way.
    ///
    /// # Errors
    ///
    /// Returns [`EtaError::UnknownStop`] if the next stop is not in the graph.
    pub fn calculate_multiple_etas(
        &self,
        position: &BusPosition,
        max_stops: usize,
    ) -> Result<Vec<BusEta>, EtaError> {
        let next = self.next_stop(position)?;
        if max_stops == 0 {
            return Ok(Vec::new());
        }

        let stats = self.route_stats(position);
        let speed = Self::expected_speed(stats.as_ref(), position);
        let confidence = Confidence::for_stats(stats.as_ref());

        let mut distance = distance_from(position, next);
        let mut etas = vec![self.eta(position, next, distance, speed, confidence)];

        let Some(orientation) = self.heading(position, next) else {
            return Ok(etas);
        };
        let mut visited = HashSet::from([next.id]);
        let mut current = next.id;

        while etas.len() < max_stops {
            let Some(arc) = self.line_arcs(position.line_id).find(|a| {
                a.orientation == orientation && a.origin == current
            }) else {
                break;
            };
            if !visited.insert(arc.destination) {
                break;
            }
            let Some(stop) = self.graph.stop(arc.destination) else {
                break;
            };
            distance += arc.distance_m;
            etas.push(self.eta(position, stop, distance, speed, confidence));
            current = arc.destination;
        }

        debug!(
            vehicle = position.vehicle_code,
            line = position.line_id,
            stops = etas.len(),
            "Arrival estimates calculated"
        );
        Ok(etas)
    }

    fn next_stop(&self, position: &BusPosition) -> Result<&Stop, EtaError> {
        self.graph
            .stop(position.next_stop_id)
            .ok_or(EtaError::UnknownStop(position.next_stop_id))
    }

    fn route_stats(&self, position: &BusPosition) -> Option<SegmentStatistics> {
        self.store
            .find(&SegmentId::for_route(position.route_id, position.line_id))
    }

    fn line_arcs(&self, line_id: i32) -> impl Iterator<Item = &StopArc> {
        self.graph.arcs().iter().filter(move |a| a.line_id == line_id)
    }

    /// Direction the bus travels on its line: the orientation of the arc into
    /// the next stop whose origin lies closest to the bus. When no arc leads
    /// into the next stop, the first orientation leaving it.
    fn heading(&self, position: &BusPosition, next: &Stop) -> Option<Orientation> {
        let incoming = self
            .line_arcs(position.line_id)
            .filter(|a| a.destination == next.id)
            .filter_map(|a| {
                self.graph
                    .stop(a.origin)
                    .map(|origin| (a.orientation, distance_from(position, origin)))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(orientation, _)| orientation);

        incoming.or_else(|| {
            self.line_arcs(position.line_id)
                .filter(|a| a.origin == next.id)
                .map(|a| a.orientation)
                .min()
        })
    }

    fn eta(
        &self,
        position: &BusPosition,
        stop: &Stop,
        distance_m: f64,
        speed_kmh: f64,
        confidence: Confidence,
    ) -> BusEta {
        let time_min = travel_minutes(distance_m, speed_kmh);
        let estimated_arrival = TimeDelta::try_milliseconds((time_min * 60_000.0) as i64)
            .and_then(|delta| position.timestamp.checked_add_signed(delta))
            .unwrap_or(position.timestamp);

        BusEta {
            vehicle_code: position.vehicle_code,
            route_id: position.route_id,
            line_id: position.line_id,
            stop_id: stop.id,
            stop_name: stop.short_name.clone(),
            time_min,
            distance_m,
            speed_kmh,
            confidence,
            calculated_at: position.timestamp,
            estimated_arrival,
        }
    }
}

fn distance_from(position: &BusPosition, stop: &Stop) -> f64 {
    haversine_meters(position.latitude, position.longitude, stop.latitude, stop.longitude)
}
