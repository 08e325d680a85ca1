//! Edge costs for the pathfinder.
//!
//! Every strategy prices arcs through the same [`SpeedModel`], so route
//! segments always report an estimated time and speed even when the search
//! itself minimised distance.

use std::sync::Arc;

use crate::graph::StopArc;
use crate::stats::SegmentId;
use crate::store::StatsMap;

use super::RouteSegment;

/// Speed assumed for arcs without statistics, in km/h.
pub const DEFAULT_SPEED_KMH: f64 = 25.0;
/// Minutes added when consecutive relaxations switch lines.
pub const TRANSFER_PENALTY_MIN: f64 = 3.0;
/// Share of the historical median when blending with a live speed.
pub const HISTORICAL_WEIGHT: f64 = 0.7;

/// Minutes needed to cover `distance_m` at `speed_kmh`.
pub fn travel_minutes(distance_m: f64, speed_kmh: f64) -> f64 {
    (distance_m / 1_000.0) / speed_kmh * 60.0
}

/// Expected speed per arc, from published statistics.
#[derive(Debug, Clone, Default)]
pub struct SpeedModel {
    stats: Arc<StatsMap>,
    live_speed_kmh: Option<f64>,
}

impl SpeedModel {
    pub fn new(stats: Arc<StatsMap>) -> Self {
        Self {
            stats,
            live_speed_kmh: None,
        }
    }

    /// Speed currently observed by the caller. Non-positive values are ignored.
    pub fn with_live_speed(mut self, speed_kmh: Option<f64>) -> Self {
        self.live_speed_kmh = speed_kmh.filter(|s| s.is_finite() && *s > 0.0);
        self
    }

    /// Statistics key for an arc. The line id fills both the route and line
    /// fields, and the stop pair is always set.
    pub fn segment_key(arc: &StopArc) -> SegmentId {
        SegmentId::for_stops(arc.line_id, arc.line_id, arc.origin, arc.destination)
    }

    /// Median speed of the arc, blended with the live speed when the
    /// statistics are reliable, or [`DEFAULT_SPEED_KMH`] without statistics.
    pub fn expected_speed(&self, arc: &StopArc) -> f64 {
        let Some(stats) = self
            .stats
            .get(&Self::segment_key(arc))
            .filter(|s| s.typical_speed() > 0.0)
        else {
            return DEFAULT_SPEED_KMH;
        };

        let historical = stats.typical_speed();
        match self.live_speed_kmh {
            Some(live) if stats.is_reliable() => {
                HISTORICAL_WEIGHT * historical + (1.0 - HISTORICAL_WEIGHT) * live
            }
            _ => historical,
        }
    }

    pub fn travel_minutes(&self, arc: &StopArc) -> f64 {
        travel_minutes(arc.distance_m, self.expected_speed(arc))
    }

    pub fn segment(&self, arc: &StopArc) -> RouteSegment {
        let speed_kmh = self.expected_speed(arc);
        RouteSegment {
            arc: arc.clone(),
            time_min: travel_minutes(arc.distance_m, speed_kmh),
            distance_m: arc.distance_m,
            speed_kmh,
        }
    }
}

/// Prices arcs during a search and turns the chosen ones into segments.
///
/// `arc_cost` takes `&mut self` because a strategy may carry state across
/// relaxations. A fresh instance is used for every query.
pub trait CostStrategy {
    fn arc_cost(&mut self, arc: &StopArc) -> f64;

    fn segment(&self, arc: &StopArc) -> RouteSegment;
}

/// Minimises estimated travel time.
#[derive(Debug, Clone)]
pub struct FastestCost {
    model: SpeedModel,
}

impl FastestCost {
    pub fn new(model: SpeedModel) -> Self {
        Self { model }
    }
}

impl CostStrategy for FastestCost {
    fn arc_cost(&mut self, arc: &StopArc) -> f64 {
        self.model.travel_minutes(arc)
    }

    fn segment(&self, arc: &StopArc) -> RouteSegment {
        self.model.segment(arc)
    }
}

/// Minimises physical distance.
#[derive(Debug, Clone)]
pub struct ShortestCost {
    model: SpeedModel,
}

impl ShortestCost {
    pub fn new(model: SpeedModel) -> Self {
        Self { model }
    }
}

impl CostStrategy for ShortestCost {
    fn arc_cost(&mut self, arc: &StopArc) -> f64 {
        arc.distance_m
    }

    fn segment(&self, arc: &StopArc) -> RouteSegment {
        self.model.segment(arc)
    }
}

/// Travel time plus [`TRANSFER_PENALTY_MIN`] whenever the arc being priced is
/// on a different line from the one priced just before it.
///
/// The comparison follows relaxation order, not the order of the final path,
/// so the penalty only approximates the transfers of the returned route.
#[derive(Debug, Clone)]
pub struct FewestTransfersCost {
    model: SpeedModel,
    previous_line: Option<i32>,
}

impl FewestTransfersCost {
    pub fn new(model: SpeedModel) -> Self {
        Self {
            model,
            previous_line: None,
        }
    }
}

impl CostStrategy for FewestTransfersCost {
    fn arc_cost(&mut self, arc: &StopArc) -> f64 {
        let mut cost = self.model.travel_minutes(arc);
        if self.previous_line.is_some_and(|line| line != arc.line_id) {
            cost += TRANSFER_PENALTY_MIN;
        }
        self.previous_line = Some(arc.line_id);
        cost
    }

    fn segment(&self, arc: &StopArc) -> RouteSegment {
        self.model.segment(arc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Orientation;
    use crate::stats::SegmentStatisticsBuilder;

    fn arc(origin: i32, destination: i32, line_id: i32, distance_m: f64) -> StopArc {
        StopArc {
            origin,
            destination,
            line_id,
            line_short_name: format!("L{line_id}"),
            orientation: Orientation::Outbound,
            origin_sequence: 1,
            destination_sequence: 2,
            distance_m,
        }
    }

    fn model_with(key: SegmentId, samples: &[f64]) -> SpeedModel {
        let stats = SegmentStatisticsBuilder::new(key)
            .add_samples(samples.iter().copied())
            .build();
        SpeedModel::new(Arc::new(StatsMap::from([(key, stats)])))
    }

    #[test]
    fn test_default_speed_without_statistics() {
        let model = SpeedModel::default();
        let hop = arc(1, 2, 10, 2_500.0);

        assert_eq!(model.expected_speed(&hop), DEFAULT_SPEED_KMH);
        // 2.5 km at 25 km/h.
        assert!((model.travel_minutes(&hop) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_speed_from_statistics() {
        let hop = arc(1, 2, 10, 1_000.0);
        let model = model_with(SpeedModel::segment_key(&hop), &[20.0, 30.0, 90.0]);

        assert_eq!(model.expected_speed(&hop), 30.0);
        let segment = model.segment(&hop);
        assert_eq!(segment.speed_kmh, 30.0);
        assert!((segment.time_min - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_live_speed_blends_only_with_reliable_statistics() {
        let hop = arc(1, 2, 10, 1_000.0);
        let key = SpeedModel::segment_key(&hop);

        let reliable = model_with(key, &[40.0; 12]).with_live_speed(Some(10.0));
        assert!((reliable.expected_speed(&hop) - 31.0).abs() < 1e-9);

        let sparse = model_with(key, &[40.0; 3]).with_live_speed(Some(10.0));
        assert_eq!(sparse.expected_speed(&hop), 40.0);

        let ignored = model_with(key, &[40.0; 12]).with_live_speed(Some(0.0));
        assert_eq!(ignored.expected_speed(&hop), 40.0);
    }

    #[test]
    fn test_route_level_statistics_never_match_arc_lookup() {
        // Aggregated statistics are keyed by route and line only, while arcs
        // look up by stop pair. The two key forms never meet.
        for line_id in [1, 131, 999] {
            let hop = arc(500, 501, line_id, 1_000.0);
            let model = model_with(SegmentId::for_route(line_id, line_id), &[60.0; 20]);

            assert_ne!(SegmentId::for_route(line_id, line_id), SpeedModel::segment_key(&hop));
            assert_eq!(model.expected_speed(&hop), DEFAULT_SPEED_KMH);
        }
    }

    #[test]
    fn test_shortest_costs_distance() {
        let hop = arc(1, 2, 10, 750.0);
        let mut shortest = ShortestCost::new(SpeedModel::default());

        assert_eq!(shortest.arc_cost(&hop), 750.0);
        assert_eq!(shortest.segment(&hop).speed_kmh, DEFAULT_SPEED_KMH);
    }

    #[test]
    fn test_transfer_penalty_follows_relaxation_order() {
        let mut fewest = FewestTransfersCost::new(SpeedModel::default());
        let base = travel_minutes(2_500.0, DEFAULT_SPEED_KMH);

        assert!((fewest.arc_cost(&arc(1, 2, 10, 2_500.0)) - base).abs() < 1e-9);
        assert!((fewest.arc_cost(&arc(2, 3, 10, 2_500.0)) - base).abs() < 1e-9);
        assert!(
            (fewest.arc_cost(&arc(2, 4, 20, 2_500.0)) - (base + TRANSFER_PENALTY_MIN)).abs() < 1e-9
        );
        assert!(
            (fewest.arc_cost(&arc(1, 5, 10, 2_500.0)) - (base + TRANSFER_PENALTY_MIN)).abs() < 1e-9
        );
    }
}
