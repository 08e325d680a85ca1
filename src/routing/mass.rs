//! Many route queries at once, spread over a private worker pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use tracing::info;

use super::{CalculatedRoute, RouteCalculator, RouteStrategy};
use crate::master_worker::{self, MasterError, PartialResult, Worker};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RoutePair {
    pub origin: i32,
    pub destination: i32,
    pub description: Option<String>,
}

impl RoutePair {
    pub fn new(origin: i32, destination: i32) -> Self {
        Self {
            origin,
            destination,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Key used in batch results, `"origin->destination"`.
    pub fn pair_id(&self) -> String {
        format!("{}->{}", self.origin, self.destination)
    }
}

/// Outcome of one pair. `route` is only set when a route was found.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub worker_id: usize,
    pub pair: RoutePair,
    pub route: Option<CalculatedRoute>,
    pub error: Option<String>,
    pub calc_time_ms: u64,
}

impl RouteOutcome {
    pub fn is_success(&self) -> bool {
        self.route.is_some()
    }
}

struct RouteWorker {
    id: usize,
    calculator: Arc<RouteCalculator>,
    strategy: RouteStrategy,
    outcomes: Vec<RouteOutcome>,
}

impl Worker for RouteWorker {
    type Item = RoutePair;
    type Output = Vec<RouteOutcome>;

    fn process(&mut self, pair: RoutePair) {
        let started = Instant::now();
        let route = self
            .calculator
            .calculate(pair.origin, pair.destination, self.strategy);
        let calc_time_ms = started.elapsed().as_millis() as u64;

        let (route, error) = if route.is_found() {
            (Some(route), None)
        } else {
            (None, Some("no route found".to_string()))
        };
        self.outcomes.push(RouteOutcome {
            worker_id: self.id,
            pair,
            route,
            error,
            calc_time_ms,
        });
    }

    fn finish(self) -> Vec<RouteOutcome> {
        self.outcomes
    }
}

/// Aggregate figures over the successful routes of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub routes: usize,
    pub avg_time_min: f64,
    pub avg_distance_m: f64,
    pub avg_transfers: f64,
    pub avg_segments: f64,
    pub max_time_min: f64,
    pub max_distance_m: f64,
    pub max_transfers: usize,
    pub max_segments: usize,
}

impl fmt::Display for BatchStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "routes={} avg_time={:.1}min avg_distance={:.0}m avg_transfers={:.2} avg_segments={:.1} \
             max_time={:.1}min max_distance={:.0}m max_transfers={} max_segments={}",
            self.routes,
            self.avg_time_min,
            self.avg_distance_m,
            self.avg_transfers,
            self.avg_segments,
            self.max_time_min,
            self.max_distance_m,
            self.max_transfers,
            self.max_segments
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MassRouteReport {
    /// Outcomes keyed by [`RoutePair::pair_id`].
    pub results: HashMap<String, RouteOutcome>,
    pub successes: usize,
    pub failures: usize,
    pub avg_calc_time_ms: f64,
    pub workers_expected: usize,
    pub workers_completed: usize,
    pub duration_ms: u64,
}

impl MassRouteReport {
    fn from_partials(partials: Vec<PartialResult<Vec<RouteOutcome>>>, workers_expected: usize) -> Self {
        let workers_completed = partials.len();
        let mut results = HashMap::new();
        let mut total_calc_ms = 0;
        let mut calculated = 0usize;

        // A repeated pair keeps its last outcome.
        for outcome in partials.into_iter().flat_map(|p| p.output) {
            total_calc_ms += outcome.calc_time_ms;
            calculated += 1;
            results.insert(outcome.pair.pair_id(), outcome);
        }
        let successes = results.values().filter(|o| o.is_success()).count();
        let avg_calc_time_ms = if calculated == 0 {
            0.0
        } else {
            total_calc_ms as f64 / calculated as f64
        };

        Self {
            failures: results.len() - successes,
            successes,
            results,
            avg_calc_time_ms,
            workers_expected,
            workers_completed,
            duration_ms: 0,
        }
    }

    pub fn get(&self, origin: i32, destination: i32) -> Option<&RouteOutcome> {
        self.results.get(&RoutePair::new(origin, destination).pair_id())
    }

    pub fn statistics(&self) -> BatchStatistics {
        let routes: Vec<&CalculatedRoute> = self
            .results
            .values()
            .filter_map(|o| o.route.as_ref())
            .collect();
        if routes.is_empty() {
            return BatchStatistics::default();
        }

        let n = routes.len() as f64;
        let sum = |f: fn(&CalculatedRoute) -> f64| routes.iter().map(|r| f(r)).sum::<f64>();
        BatchStatistics {
            routes: routes.len(),
            avg_time_min: sum(CalculatedRoute::total_time_min) / n,
            avg_distance_m: sum(CalculatedRoute::total_distance_m) / n,
            avg_transfers: sum(|r| r.transfers() as f64) / n,
            avg_segments: sum(|r| r.segment_count() as f64) / n,
            max_time_min: routes.iter().map(|r| r.total_time_min()).fold(0.0, f64::max),
            max_distance_m: routes.iter().map(|r| r.total_distance_m()).fold(0.0, f64::max),
            max_transfers: routes.iter().map(|r| r.transfers()).max().unwrap_or(0),
            max_segments: routes.iter().map(|r| r.segment_count()).max().unwrap_or(0),
        }
    }
}

/// Runs batches of route queries across `workers` threads.
pub struct MassRouteCalculator {
    calculator: Arc<RouteCalculator>,
    workers: usize,
    strategy: RouteStrategy,
}

impl MassRouteCalculator {
    pub fn new(calculator: Arc<RouteCalculator>, workers: usize) -> Self {
        Self {
            calculator,
            workers,
            strategy: RouteStrategy::Fastest,
        }
    }

    pub fn with_strategy(mut self, strategy: RouteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Calculates every pair. Pairs appearing twice keep the later outcome.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot be started.
    #[tracing::instrument(skip(self, pairs), fields(pairs = pairs.len(), workers = self.workers, strategy = %self.strategy))]
    pub fn calculate(&self, pairs: Vec<RoutePair>) -> Result<MassRouteReport, MasterError> {
        let started = Instant::now();
        let workers = self.workers;

        let mut report = master_worker::run_once(
            workers,
            pairs,
            |id| RouteWorker {
                id,
                calculator: Arc::clone(&self.calculator),
                strategy: self.strategy,
                outcomes: Vec::new(),
            },
            |partials| MassRouteReport::from_partials(partials, workers),
        )?;
        report.duration_ms = started.elapsed().as_millis() as u64;

        let secs = (report.duration_ms as f64 / 1_000.0).max(1e-3);
        info!(
            routes = report.results.len(),
            successes = report.successes,
            failures = report.failures,
            avg_calc_ms = report.avg_calc_time_ms,
            routes_per_sec = report.results.len() as f64 / secs,
            duration_ms = report.duration_ms,
            "Mass route calculation complete"
        );
        Ok(report)
    }

    /// All ordered pairs `(a, b)` with `a` ranked before `b` among the
    /// `top_n` stops touched by the most arcs. Ties rank the lower stop id
    /// first.
    pub fn popular_pairs(&self, top_n: usize) -> Vec<RoutePair> {
        let graph = self.calculator.graph();
        let mut connections: HashMap<i32, usize> = graph.stops().map(|s| (s.id, 0)).collect();
        for arc in graph.arcs() {
            for stop in [arc.origin, arc.destination] {
                if let Some(count) = connections.get_mut(&stop) {
                    *count += 1;
                }
            }
        }

        let mut ranked: Vec<(i32, usize)> = connections.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let popular: Vec<i32> = ranked.into_iter().take(top_n).map(|(id, _)| id).collect();

        let name = |id: i32| {
            graph
                .stop(id)
                .map_or_else(|| id.to_string(), |s| s.short_name.clone())
        };
        let mut pairs = Vec::new();
        for (i, &origin) in popular.iter().enumerate() {
            for &destination in &popular[i + 1..] {
                pairs.push(
                    RoutePair::new(origin, destination)
                        .with_description(format!("{} -> {}", name(origin), name(destination))),
                );
            }
        }
        pairs
    }

    /// `count` pairs of distinct stops drawn uniformly from the graph.
    /// Pairs may repeat. Empty when the graph has fewer than two stops.
    pub fn random_pairs<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<RoutePair> {
        let mut stop_ids: Vec<i32> = self.calculator.graph().stops().map(|s| s.id).collect();
        if stop_ids.len() < 2 {
            return Vec::new();
        }
        stop_ids.sort_unstable();

        (0..count)
            .map(|i| {
                let origin = rng.random_range(0..stop_ids.len());
                // Draw from the remaining stops so the pair is never a loop.
                let mut destination = rng.random_range(0..stop_ids.len() - 1);
                if destination >= origin {
                    destination += 1;
                }
                RoutePair::new(stop_ids[origin], stop_ids[destination])
                    .with_description(format!("Random pair {}", i + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_support::diamond_graph;
    use crate::store::SegmentStatsStore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn calculator() -> Arc<RouteCalculator> {
        Arc::new(RouteCalculator::new(
            diamond_graph(),
            Arc::new(SegmentStatsStore::new()),
        ))
    }

    #[test]
    fn test_random_pairs_are_distinct_known_stops() {
        let mass = MassRouteCalculator::new(calculator(), 2);
        let known = [1, 2, 3, 4, 9];

        let pairs = mass.random_pairs(200, &mut StdRng::seed_from_u64(42));
        assert_eq!(pairs.len(), 200);
        for pair in &pairs {
            assert_ne!(pair.origin, pair.destination);
            assert!(known.contains(&pair.origin));
            assert!(known.contains(&pair.destination));
        }

        let again = mass.random_pairs(200, &mut StdRng::seed_from_u64(42));
        assert_eq!(pairs, again);

        let report = mass.calculate(pairs).unwrap();
        assert_eq!(report.successes + report.failures, report.results.len());
    }

    #[test]
    fn test_random_pairs_need_two_stops() {
        let mut builder = crate::graph::GraphBuilder::new();
        builder.add_stop(crate::graph::test_support::stop(1, 3.40, -76.50));
        let calculator = Arc::new(RouteCalculator::new(
            Arc::new(builder.build()),
            Arc::new(SegmentStatsStore::new()),
        ));

        let mass = MassRouteCalculator::new(calculator, 1);
        assert!(mass.random_pairs(5, &mut StdRng::seed_from_u64(1)).is_empty());
        assert!(mass.random_pairs(0, &mut StdRng::seed_from_u64(1)).is_empty());
    }

    #[test]
    fn test_pair_id() {
        assert_eq!(RoutePair::new(12, 340).pair_id(), "12->340");
    }

    #[test]
    fn test_batch_counts_successes_and_failures() {
        let mass = MassRouteCalculator::new(calculator(), 3);
        let pairs = vec![
            RoutePair::new(1, 3),
            RoutePair::new(1, 4),
            RoutePair::new(2, 3),
            RoutePair::new(4, 1),
            RoutePair::new(1, 9),
        ];

        let report = mass.calculate(pairs).unwrap();

        assert_eq!(report.results.len(), 5);
        assert_eq!(report.successes, 3);
        assert_eq!(report.failures, 2);
        assert_eq!(report.workers_completed, 3);
        assert!(report.get(1, 4).unwrap().is_success());
        let failed = report.get(4, 1).unwrap();
        assert!(failed.route.is_none());
        assert_eq!(failed.error.as_deref(), Some("no route found"));
        // Round-robin: the fourth pair goes to worker 0.
        assert_eq!(failed.worker_id, 0);
    }

    #[test]
    fn test_batch_statistics() {
        let mass = MassRouteCalculator::new(calculator(), 2);
        let report = mass
            .calculate(vec![RoutePair::new(1, 3), RoutePair::new(1, 4)])
            .unwrap();
        let stats = report.statistics();

        let direct = report.get(1, 3).unwrap().route.as_ref().unwrap();
        let longer = report.get(1, 4).unwrap().route.as_ref().unwrap();
        assert_eq!(stats.routes, 2);
        assert_eq!(stats.max_segments, 2);
        assert_eq!(stats.max_transfers, 1);
        assert!((stats.avg_segments - 1.5).abs() < 1e-9);
        assert!((stats.avg_transfers - 0.5).abs() < 1e-9);
        assert!((stats.max_distance_m - longer.total_distance_m()).abs() < 1e-9);
        assert!(
            (stats.avg_time_min - (direct.total_time_min() + longer.total_time_min()) / 2.0).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_empty_batch() {
        let report = MassRouteCalculator::new(calculator(), 2)
            .calculate(Vec::new())
            .unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.avg_calc_time_ms, 0.0);
        assert_eq!(report.statistics(), BatchStatistics::default());
    }

    #[test]
    fn test_popular_pairs() {
        let mass = MassRouteCalculator::new(calculator(), 1);
        let pairs = mass.popular_pairs(3);

        // Stop 3 touches 3 arcs, stops 1 and 2 touch 2, stop 4 one.
        let ids: Vec<(i32, i32)> = pairs.iter().map(|p| (p.origin, p.destination)).collect();
        assert_eq!(ids, vec![(3, 1), (3, 2), (1, 2)]);
        assert_eq!(pairs[0].description.as_deref(), Some("S3 -> S1"));

        assert!(mass.popular_pairs(1).is_empty());
    }
}
