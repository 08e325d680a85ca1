//! Published segment statistics.
//!
//! An aggregation run produces a complete map which is swapped in as a whole.
//! Readers take a cheap snapshot and never see a half-written run.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::info;

use crate::stats::{SegmentId, SegmentStatistics};

pub type StatsMap = HashMap<SegmentId, SegmentStatistics>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub segments: usize,
    pub reliable_segments: usize,
    pub total_samples: usize,
    /// Mean of the averages of reliable segments, 0 when there are none.
    pub mean_reliable_speed: f64,
}

#[derive(Debug, Default)]
pub struct SegmentStatsStore {
    current: RwLock<Arc<StatsMap>>,
}

impl SegmentStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(stats: StatsMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(stats)),
        }
    }

    /// Replaces the published statistics with the result of a new run.
    pub fn publish(&self, stats: StatsMap) {
        let segments = stats.len();
        let next = Arc::new(stats);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
        info!(segments, "Segment statistics published");
    }

    pub fn snapshot(&self) -> Arc<StatsMap> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn clear(&self) {
        self.publish(StatsMap::new());
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn find(&self, id: &SegmentId) -> Option<SegmentStatistics> {
        self.snapshot().get(id).cloned()
    }

    pub fn find_by_route(&self, route_id: i32) -> Vec<SegmentStatistics> {
        self.collect_sorted(|s| s.segment.route_id == route_id)
    }

    pub fn find_by_line(&self, line_id: i32) -> Vec<SegmentStatistics> {
        self.collect_sorted(|s| s.segment.line_id == line_id)
    }

    pub fn reliable(&self) -> Vec<SegmentStatistics> {
        self.collect_sorted(SegmentStatistics::is_reliable)
    }

    /// Reliable segments with the highest average speed first.
    pub fn fastest(&self, limit: usize) -> Vec<SegmentStatistics> {
        let mut reliable = self.reliable();
        reliable.sort_by(|a, b| b.average.total_cmp(&a.average));
        reliable.truncate(limit);
        reliable
    }

    /// Reliable segments with the lowest average speed first.
    pub fn slowest(&self, limit: usize) -> Vec<SegmentStatistics> {
        let mut reliable = self.reliable();
        reliable.sort_by(|a, b| a.average.total_cmp(&b.average));
        reliable.truncate(limit);
        reliable
    }

    /// Reliable segments with the largest standard deviation first.
    pub fn most_variable(&self, limit: usize) -> Vec<SegmentStatistics> {
        let mut reliable = self.reliable();
        reliable.sort_by(|a, b| b.std_dev.total_cmp(&a.std_dev));
        reliable.truncate(limit);
        reliable
    }

    pub fn summary(&self) -> StoreSummary {
        let snapshot = self.snapshot();
        let reliable: Vec<f64> = snapshot
            .values()
            .filter(|s| s.is_reliable())
            .map(|s| s.average)
            .collect();

        StoreSummary {
            segments: snapshot.len(),
            reliable_segments: reliable.len(),
            total_samples: snapshot.values().map(|s| s.sample_count).sum(),
            mean_reliable_speed: crate::stats::mean(&reliable),
        }
    }

    // Ordered by key so results are stable between calls.
    fn collect_sorted<P>(&self, mut predicate: P) -> Vec<SegmentStatistics>
    where
        P: FnMut(&SegmentStatistics) -> bool,
    {
        let snapshot = self.snapshot();
        let mut found: Vec<SegmentStatistics> =
            snapshot.values().filter(|s| predicate(*s)).cloned().collect();
        found.sort_by_key(|s| s.segment);
        found
    }
}
