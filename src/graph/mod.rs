//! Static network: stops, lines and the directed arcs between consecutive
//! stops of each line.
//!
//! A [`Graph`] is built once through [`GraphBuilder`] and never mutated
//! afterwards, so it can be shared behind an `Arc` by any number of readers.

pub mod loader;

pub use loader::{load_graph, load_graph_from_readers};

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres between two points in decimal degrees.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stop {
    pub id: i32,
    pub plan_version: i32,
    pub short_name: String,
    pub long_name: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl Stop {
    pub fn distance_to(&self, other: &Stop) -> f64 {
        haversine_meters(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Line {
    pub id: i32,
    pub plan_version: i32,
    pub short_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Orientation {
    Outbound,
    Inbound,
}

impl Orientation {
    /// `0` is outbound; any other code is inbound.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            Orientation::Outbound
        } else {
            Orientation::Inbound
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Orientation::Outbound => 0,
            Orientation::Inbound => 1,
        }
    }
}

/// Directed hop between two consecutive stops of one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopArc {
    pub origin: i32,
    pub destination: i32,
    pub line_id: i32,
    pub line_short_name: String,
    pub orientation: Orientation,
    pub origin_sequence: i32,
    pub destination_sequence: i32,
    pub distance_m: f64,
}

impl fmt::Display for StopArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {:?}] {} -> {} ({:.0} m)",
            self.line_short_name,
            self.line_id,
            self.orientation,
            self.origin,
            self.destination,
            self.distance_m
        )
    }
}

/// One row of the line-stops table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineStop {
    pub sequence: i32,
    pub orientation: Orientation,
    pub line_id: i32,
    pub stop_id: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub stops: usize,
    pub lines: usize,
    pub arcs: usize,
    pub lines_with_arcs: usize,
}

impl fmt::Display for GraphSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Graph[stops={}, lines={}, arcs={}, lines with arcs={}]",
            self.stops, self.lines, self.arcs, self.lines_with_arcs
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    stops: HashMap<i32, Stop>,
    lines: HashMap<i32, Line>,
    arcs: Vec<StopArc>,
}

impl Graph {
    pub fn stop(&self, id: i32) -> Option<&Stop> {
        self.stops.get(&id)
    }

    pub fn line(&self, id: i32) -> Option<&Line> {
        self.lines.get(&id)
    }

    pub fn stops(&self) -> impl Iterator<Item = &Stop> {
        self.stops.values()
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.values()
    }

    pub fn arcs(&self) -> &[StopArc] {
        &self.arcs
    }

    pub fn arcs_for_line(&self, short_name: &str) -> Vec<&StopArc> {
        self.arcs
            .iter()
            .filter(|a| a.line_short_name == short_name)
            .collect()
    }

    pub fn summary(&self) -> GraphSummary {
        let mut lines_with_arcs: Vec<i32> = self.arcs.iter().map(|a| a.line_id).collect();
        lines_with_arcs.sort_unstable();
        lines_with_arcs.dedup();

        GraphSummary {
            stops: self.stops.len(),
            lines: self.lines.len(),
            arcs: self.arcs.len(),
            lines_with_arcs: lines_with_arcs.len(),
        }
    }
}

/// Collects table rows and derives arcs on [`GraphBuilder::build`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    stops: HashMap<i32, Stop>,
    lines: HashMap<i32, Line>,
    line_stops: HashMap<i32, Vec<LineStop>>,
    skipped: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stop(&mut self, stop: Stop) -> &mut Self {
        self.stops.insert(stop.id, stop);
        self
    }

    pub fn add_line(&mut self, line: Line) -> &mut Self {
        self.lines.insert(line.id, line);
        self
    }

    /// Records a stop's position on a line. Rows naming a stop or line that
    /// has not been added are skipped, since plan data is often incomplete.
    pub fn add_line_stop(&mut self, line_stop: LineStop) -> &mut Self {
        if !self.stops.contains_key(&line_stop.stop_id)
            || !self.lines.contains_key(&line_stop.line_id)
        {
            self.skipped += 1;
            return self;
        }
        self.line_stops
            .entry(line_stop.line_id)
            .or_default()
            .push(line_stop);
        self
    }

    /// Line-stop rows dropped for referring to unknown stops or lines.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn build(self) -> Graph {
        let mut arcs = Vec::new();

        let mut line_ids: Vec<i32> = self.line_stops.keys().copied().collect();
        line_ids.sort_unstable();

        for line_id in line_ids {
            let (Some(line), Some(entries)) =
                (self.lines.get(&line_id), self.line_stops.get(&line_id))
            else {
                continue;
            };
            let mut entries = entries.clone();
            entries.sort_by_key(|e| (e.orientation, e.sequence));

            for pair in entries.windows(2) {
                let (from, to) = (pair[0], pair[1]);
                if from.orientation != to.orientation {
                    continue;
                }
                let (Some(origin), Some(destination)) =
                    (self.stops.get(&from.stop_id), self.stops.get(&to.stop_id))
                else {
                    continue;
                };
                arcs.push(StopArc {
                    origin: origin.id,
                    destination: destination.id,
                    line_id,
                    line_short_name: line.short_name.clone(),
                    orientation: from.orientation,
                    origin_sequence: from.sequence,
                    destination_sequence: to.sequence,
                    distance_m: origin.distance_to(destination),
                });
            }
        }

        debug!(
            stops = self.stops.len(),
            lines = self.lines.len(),
            arcs = arcs.len(),
            skipped_line_stops = self.skipped,
            "Graph built"
        );
        Graph {
            stops: self.stops,
            lines: self.lines,
            arcs,
        }
    }
}
