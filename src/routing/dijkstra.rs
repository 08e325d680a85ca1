use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use ordered_float::OrderedFloat;

use super::{CalculatedRoute, CostStrategy, RouteStrategy};
use crate::graph::Graph;

#[derive(Copy, Clone, Eq, PartialEq)]
struct State {
    cost: OrderedFloat<f64>,
    stop: i32,
}

// Reversed on cost so the BinaryHeap pops the cheapest state first.
impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| self.stop.cmp(&other.stop))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-source shortest path over a shared graph.
///
/// The outgoing-arc index is built once and reused by every query, whatever
/// the cost strategy.
#[derive(Debug, Clone)]
pub struct Pathfinder {
    graph: Arc<Graph>,
    outgoing: HashMap<i32, Vec<usize>>,
}

impl Pathfinder {
    pub fn new(graph: Arc<Graph>) -> Self {
        let mut outgoing: HashMap<i32, Vec<usize>> = HashMap::new();
        for (index, arc) in graph.arcs().iter().enumerate() {
            outgoing.entry(arc.origin).or_default().push(index);
        }
        Self { graph, outgoing }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Cheapest route from `origin` to `destination` under `cost`.
    ///
    /// Unknown stops, identical endpoints and unreachable destinations all
    /// yield a route with no segments.
    pub fn find_route(
        &self,
        origin: i32,
        destination: i32,
        strategy: RouteStrategy,
        cost: &mut dyn CostStrategy,
    ) -> CalculatedRoute {
        if self.graph.stop(origin).is_none() || self.graph.stop(destination).is_none() {
            return CalculatedRoute::not_found(origin, destination, strategy);
        }

        let arcs = self.graph.arcs();
        let mut best: HashMap<i32, f64> = HashMap::from([(origin, 0.0)]);
        let mut previous: HashMap<i32, usize> = HashMap::new();
        let mut visited: HashSet<i32> = HashSet::new();
        let mut heap = BinaryHeap::new();
        heap.push(State {
            cost: OrderedFloat(0.0),
            stop: origin,
        });

        while let Some(State { cost: reached, stop }) = heap.pop() {
            if !visited.insert(stop) {
                continue;
            }
            if stop == destination {
                break;
            }

            let Some(out) = self.outgoing.get(&stop) else {
                continue;
            };
            for &index in out {
                let arc = &arcs[index];
                if visited.contains(&arc.destination) {
                    continue;
                }
                let candidate = reached.0 + cost.arc_cost(arc);
                if best
                    .get(&arc.destination)
                    .is_none_or(|&known| candidate < known)
                {
                    best.insert(arc.destination, candidate);
                    previous.insert(arc.destination, index);
                    heap.push(State {
                        cost: OrderedFloat(candidate),
                        stop: arc.destination,
                    });
                }
            }
        }

        let segments = self
            .path_to(origin, destination, &previous)
            .into_iter()
            .map(|index| cost.segment(&arcs[index]))
            .collect();
        CalculatedRoute::new(origin, destination, strategy, segments)
    }

    /// Arc indices from origin to destination, or empty if the destination
    /// was never reached.
    fn path_to(&self, origin: i32, destination: i32, previous: &HashMap<i32, usize>) -> Vec<usize> {
        let arcs = self.graph.arcs();
        let mut path = Vec::new();
        let mut current = destination;
        while current != origin {
            let Some(&index) = previous.get(&current) else {
                return Vec::new();
            };
            path.push(index);
            current = arcs[index].origin;
            if path.len() > previous.len() {
                return Vec::new();
            }
        }
        path.reverse();
        path
    }
}
