//! Route calculation over the stop graph, with travel times taken from the
//! published segment statistics.

pub mod cost;
pub mod dijkstra;
pub mod eta;
pub mod mass;
pub mod route;

pub use cost::{
    CostStrategy, DEFAULT_SPEED_KMH, FastestCost, FewestTransfersCost, ShortestCost, SpeedModel,
    TRANSFER_PENALTY_MIN,
};
pub use dijkstra::Pathfinder;
pub use eta::{BusEta, Confidence, EtaCalculator, EtaError};
pub use mass::{BatchStatistics, MassRouteCalculator, MassRouteReport, RouteOutcome, RoutePair};
pub use route::{CalculatedRoute, RouteSegment};

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use serde::Serialize;
use tracing::debug;

use crate::graph::Graph;
use crate::store::SegmentStatsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    #[default]
    Fastest,
    Shortest,
    FewestTransfers,
}

impl RouteStrategy {
    pub fn cost_strategy(self, model: SpeedModel) -> Box<dyn CostStrategy> {
        match self {
            RouteStrategy::Fastest => Box::new(FastestCost::new(model)),
            RouteStrategy::Shortest => Box::new(ShortestCost::new(model)),
            RouteStrategy::FewestTransfers => Box::new(FewestTransfersCost::new(model)),
        }
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteStrategy::Fastest => "fastest",
            RouteStrategy::Shortest => "shortest",
            RouteStrategy::FewestTransfers => "fewest-transfers",
        };
        f.write_str(name)
    }
}

/// Conditions known at query time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RouteContext {
    /// Speed currently observed by the rider's bus, in km/h.
    pub live_speed_kmh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub stops: usize,
    pub lines: usize,
    pub arcs: usize,
    /// Segments in the published statistics.
    pub stats_segments: usize,
    /// Arcs whose lookup key has published statistics.
    pub arcs_with_stats: usize,
}

impl ServiceInfo {
    pub fn coverage_percent(&self) -> f64 {
        self.arcs_with_stats as f64 * 100.0 / self.arcs.max(1) as f64
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Route calculator")?;
        writeln!(f, "  stops:           {}", self.stops)?;
        writeln!(f, "  lines:           {}", self.lines)?;
        writeln!(f, "  arcs:            {}", self.arcs)?;
        writeln!(f, "  stats segments:  {}", self.stats_segments)?;
        write!(
            f,
            "  arcs with stats: {} ({:.1}%)",
            self.arcs_with_stats,
            self.coverage_percent()
        )
    }
}

/// Answers route queries against a shared graph and statistics store.
///
/// Each query reads one snapshot of the store, so a statistics run published
/// mid-query does not mix into its costs.
#[derive(Debug, Clone)]
pub struct RouteCalculator {
    pathfinder: Pathfinder,
    store: Arc<SegmentStatsStore>,
}

impl RouteCalculator {
    pub fn new(graph: Arc<Graph>, store: Arc<SegmentStatsStore>) -> Self {
        Self {
            pathfinder: Pathfinder::new(graph),
            store,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        self.pathfinder.graph()
    }

    pub fn store(&self) -> &Arc<SegmentStatsStore> {
        &self.store
    }

    pub fn calculate(&self, origin: i32, destination: i32, strategy: RouteStrategy) -> CalculatedRoute {
        self.calculate_with(origin, destination, strategy, &RouteContext::default())
    }

    pub fn calculate_with(
        &self,
        origin: i32,
        destination: i32,
        strategy: RouteStrategy,
        context: &RouteContext,
    ) -> CalculatedRoute {
        let model = SpeedModel::new(self.store.snapshot()).with_live_speed(context.live_speed_kmh);
        let mut cost = strategy.cost_strategy(model);
        let route = self
            .pathfinder
            .find_route(origin, destination, strategy, cost.as_mut());
        debug!(
            origin,
            destination,
            %strategy,
            found = route.is_found(),
            segments = route.segment_count(),
            "Route calculated"
        );
        route
    }

    pub fn fastest(&self, origin: i32, destination: i32) -> CalculatedRoute {
        self.calculate(origin, destination, RouteStrategy::Fastest)
    }

    pub fn shortest(&self, origin: i32, destination: i32) -> CalculatedRoute {
        self.calculate(origin, destination, RouteStrategy::Shortest)
    }

    pub fn fewest_transfers(&self, origin: i32, destination: i32) -> CalculatedRoute {
        self.calculate(origin, destination, RouteStrategy::FewestTransfers)
    }

    pub fn service_info(&self) -> ServiceInfo {
        let graph = self.graph();
        let stats = self.store.snapshot();
        let summary = graph.summary();
        let arcs_with_stats = graph
            .arcs()
            .iter()
            .filter(|arc| stats.contains_key(&SpeedModel::segment_key(arc)))
            .count();

        ServiceInfo {
            stops: summary.stops,
            lines: summary.lines,
            arcs: summary.arcs,
            stats_segments: stats.len(),
            arcs_with_stats,
        }
    }
}
