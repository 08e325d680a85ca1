use serde::Serialize;
use std::fmt;

/// Sentinel used for the stop fields of a route-level [`SegmentId`].
pub const UNSET_STOP: i32 = -1;

/// Minimum sample count for statistics to be considered reliable.
pub const RELIABLE_SAMPLE_COUNT: usize = 10;

/// Key for speed statistics.
///
/// Producers either key by route and line alone ([`SegmentId::for_route`]) or
/// by the concrete stop pair as well ([`SegmentId::for_stops`]). The two forms
/// never compare equal, even for the same route and line, so a lookup has to
/// use the same form the statistics were written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId {
    pub route_id: i32,
    pub line_id: i32,
    pub origin_stop_id: i32,
    pub dest_stop_id: i32,
}

impl SegmentId {
    pub fn for_route(route_id: i32, line_id: i32) -> Self {
        Self {
            route_id,
            line_id,
            origin_stop_id: UNSET_STOP,
            dest_stop_id: UNSET_STOP,
        }
    }

    pub fn for_stops(route_id: i32, line_id: i32, origin_stop_id: i32, dest_stop_id: i32) -> Self {
        Self {
            route_id,
            line_id,
            origin_stop_id,
            dest_stop_id,
        }
    }

    pub fn has_stops(&self) -> bool {
        self.origin_stop_id >= 0 && self.dest_stop_id >= 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_stops() {
            write!(
                f,
                "Segment[route={}, line={}, {}->{}]",
                self.route_id, self.line_id, self.origin_stop_id, self.dest_stop_id
            )
        } else {
            write!(f, "Segment[route={}, line={}]", self.route_id, self.line_id)
        }
    }
}

/// Immutable speed statistics for one segment, in km/h.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStatistics {
    pub segment: SegmentId,
    pub sample_count: usize,
    pub average: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub p90: f64,
    pub p95: f64,
}

impl SegmentStatistics {
    /// Statistics for a segment with no samples: every metric is zero.
    pub fn empty(segment: SegmentId) -> Self {
        SegmentStatistics {
            segment,
            sample_count: 0,
            average: 0.0,
            median: 0.0,
            min: 0.0,
            max: 0.0,
            std_dev: 0.0,
            p90: 0.0,
            p95: 0.0,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.sample_count >= RELIABLE_SAMPLE_COUNT
    }

    /// The median, which is less sensitive to outliers than the mean.
    pub fn typical_speed(&self) -> f64 {
        self.median
    }
}

impl fmt::Display for SegmentStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples={} avg={:.1} median={:.1} range=[{:.1}-{:.1}]",
            self.segment, self.sample_count, self.average, self.median, self.min, self.max
        )
    }
}

/// Accumulates speed samples for one segment.
///
/// Non-positive samples are discarded on the way in.
#[derive(Debug, Clone)]
pub struct SegmentStatisticsBuilder {
    segment: SegmentId,
    samples: Vec<f64>,
}

impl SegmentStatisticsBuilder {
    pub fn new(segment: SegmentId) -> Self {
        Self {
            segment,
            samples: Vec::new(),
        }
    }

    pub fn add_sample(mut self, speed: f64) -> Self {
        if speed > 0.0 {
            self.samples.push(speed);
        }
        self
    }

    pub fn add_samples<I: IntoIterator<Item = f64>>(mut self, speeds: I) -> Self {
        self.samples.extend(speeds.into_iter().filter(|s| *s > 0.0));
        self
    }

    pub fn build(self) -> SegmentStatistics {
        let mut sorted = self.samples;
        if sorted.is_empty() {
            return SegmentStatistics::empty(self.segment);
        }
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let average = mean(&sorted);

        SegmentStatistics {
            segment: self.segment,
            sample_count: n,
            average,
            median: median(&sorted),
            min: sorted[0],
            max: sorted[n - 1],
            std_dev: stddev(&sorted, average),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
        }
    }
}

/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Computes the population standard deviation given a pre-computed mean.
/// Returns 0.0 for empty input.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    variance.sqrt()
}

/// Median of an already sorted, non-empty slice.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Nearest-rank percentile of an already sorted, non-empty slice: index
/// `ceil(p * n) - 1`, clamped to the slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    sorted[index]
}
