use std::fmt;

use serde::Serialize;

use super::RouteStrategy;
use crate::graph::StopArc;

/// One hop of a calculated route with the figures used to cost it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSegment {
    pub arc: StopArc,
    /// Estimated travel time in minutes.
    pub time_min: f64,
    pub distance_m: f64,
    /// Speed the estimate was based on, in km/h.
    pub speed_kmh: f64,
}

impl RouteSegment {
    pub fn origin(&self) -> i32 {
        self.arc.origin
    }

    pub fn destination(&self) -> i32 {
        self.arc.destination
    }

    pub fn line_id(&self) -> i32 {
        self.arc.line_id
    }

    pub fn line_name(&self) -> &str {
        &self.arc.line_short_name
    }
}

impl fmt::Display for RouteSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} on {} ({:.1} min, {:.0} m, {:.1} km/h)",
            self.origin(),
            self.destination(),
            self.line_name(),
            self.time_min,
            self.distance_m,
            self.speed_kmh
        )
    }
}

/// Result of a single route query. Totals are fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculatedRoute {
    origin: i32,
    destination: i32,
    strategy: RouteStrategy,
    segments: Vec<RouteSegment>,
    total_time_min: f64,
    total_distance_m: f64,
    transfers: usize,
}

impl CalculatedRoute {
    pub fn new(
        origin: i32,
        destination: i32,
        strategy: RouteStrategy,
        segments: Vec<RouteSegment>,
    ) -> Self {
        let total_time_min = segments.iter().map(|s| s.time_min).sum();
        let total_distance_m = segments.iter().map(|s| s.distance_m).sum();
        let transfers = segments
            .windows(2)
            .filter(|pair| pair[0].line_id() != pair[1].line_id())
            .count();

        Self {
            origin,
            destination,
            strategy,
            segments,
            total_time_min,
            total_distance_m,
            transfers,
        }
    }

    pub fn not_found(origin: i32, destination: i32, strategy: RouteStrategy) -> Self {
        Self::new(origin, destination, strategy, Vec::new())
    }

    pub fn is_found(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn origin(&self) -> i32 {
        self.origin
    }

    pub fn destination(&self) -> i32 {
        self.destination
    }

    pub fn strategy(&self) -> RouteStrategy {
        self.strategy
    }

    pub fn segments(&self) -> &[RouteSegment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_time_min(&self) -> f64 {
        self.total_time_min
    }

    pub fn total_distance_m(&self) -> f64 {
        self.total_distance_m
    }

    pub fn transfers(&self) -> usize {
        self.transfers
    }

    /// Overall speed in km/h, or 0 for a route that takes no time.
    pub fn average_speed_kmh(&self) -> f64 {
        if self.total_time_min <= 0.0 {
            return 0.0;
        }
        (self.total_distance_m / self.total_time_min) * 60.0 / 1_000.0
    }

    /// Stop ids from origin to destination, empty when no route was found.
    pub fn stops_in_order(&self) -> Vec<i32> {
        let Some(first) = self.segments.first() else {
            return Vec::new();
        };
        std::iter::once(first.origin())
            .chain(self.segments.iter().map(RouteSegment::destination))
            .collect()
    }

    /// Line short names in riding order, with consecutive repeats collapsed.
    pub fn lines_used(&self) -> Vec<&str> {
        let mut lines: Vec<&str> = self.segments.iter().map(RouteSegment::line_name).collect();
        lines.dedup();
        lines
    }
}

impl fmt::Display for CalculatedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_found() {
            return write!(f, "No route from {} to {}", self.origin, self.destination);
        }

        writeln!(
            f,
            "Route {} -> {} ({})",
            self.origin, self.destination, self.strategy
        )?;
        writeln!(f, "  time:      {:.1} min", self.total_time_min)?;
        writeln!(
            f,
            "  distance:  {:.0} m ({:.2} km)",
            self.total_distance_m,
            self.total_distance_m / 1_000.0
        )?;
        writeln!(f, "  speed:     {:.1} km/h", self.average_speed_kmh())?;
        writeln!(f, "  stops:     {}", self.segments.len() + 1)?;
        writeln!(f, "  transfers: {}", self.transfers)?;
        writeln!(f, "  lines:     {}", self.lines_used().join(", "))?;
        for (i, segment) in self.segments.iter().enumerate() {
            writeln!(f, "  {:>3}. {segment}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Orientation;

    fn segment(origin: i32, destination: i32, line_id: i32, distance_m: f64, time_min: f64) -> RouteSegment {
        RouteSegment {
            arc: StopArc {
                origin,
                destination,
                line_id,
                line_short_name: format!("L{line_id}"),
                orientation: Orientation::Outbound,
                origin_sequence: 1,
                destination_sequence: 2,
                distance_m,
            },
            time_min,
            distance_m,
            speed_kmh: distance_m / 1_000.0 / (time_min / 60.0),
        }
    }

    #[test]
    fn test_totals_and_transfers() {
        let route = CalculatedRoute::new(
            1,
            5,
            RouteStrategy::Fastest,
            vec![
                segment(1, 2, 10, 1_000.0, 2.0),
                segment(2, 3, 10, 500.0, 1.0),
                segment(3, 4, 20, 1_500.0, 3.0),
                segment(4, 5, 10, 1_000.0, 2.0),
            ],
        );

        assert!(route.is_found());
        assert_eq!(route.total_distance_m(), 4_000.0);
        assert_eq!(route.total_time_min(), 8.0);
        assert_eq!(route.transfers(), 2);
        assert_eq!(route.stops_in_order(), vec![1, 2, 3, 4, 5]);
        assert_eq!(route.lines_used(), vec!["L10", "L20", "L10"]);
        assert!((route.average_speed_kmh() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_found_has_zero_metrics() {
        let route = CalculatedRoute::not_found(1, 2, RouteStrategy::Shortest);

        assert!(!route.is_found());
        assert_eq!(route.total_time_min(), 0.0);
        assert_eq!(route.total_distance_m(), 0.0);
        assert_eq!(route.transfers(), 0);
        assert_eq!(route.average_speed_kmh(), 0.0);
        assert!(route.stops_in_order().is_empty());
        assert_eq!(route.to_string(), "No route from 1 to 2");
    }

    #[test]
    fn test_display_lists_segments() {
        let route = CalculatedRoute::new(
            1,
            3,
            RouteStrategy::Fastest,
            vec![segment(1, 2, 10, 1_000.0, 2.0), segment(2, 3, 10, 1_000.0, 2.0)],
        );
        let text = route.to_string();

        assert!(text.starts_with("Route 1 -> 3 (fastest)"));
        assert!(text.contains("transfers: 0"));
        assert!(text.contains("  1. 1 -> 2 on L10"));
        assert!(text.contains("  2. 2 -> 3 on L10"));
    }
}
