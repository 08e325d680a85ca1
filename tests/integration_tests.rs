use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use brt_telemetry::aggregation::TelemetryAggregator;
use brt_telemetry::config::{AggregationConfig, AppConfig, StreamingConfig};
use brt_telemetry::events::EventKind;
use brt_telemetry::graph::{Graph, load_graph};
use brt_telemetry::notify::NotificationHub;
use brt_telemetry::output::append_segments;
use brt_telemetry::reader::{ReadError, TelemetryReader};
use brt_telemetry::routing::{
    Confidence, EtaCalculator, MassRouteCalculator, RouteCalculator, RouteStrategy,
};
use brt_telemetry::stats::SegmentId;
use brt_telemetry::store::SegmentStatsStore;
use brt_telemetry::streaming::{BusPosition, StreamingService};
use chrono::NaiveDate;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn telemetry() -> PathBuf {
    fixture("telemetry_sample.csv")
}

fn graph() -> Arc<Graph> {
    Arc::new(
        load_graph(
            &fixture("stops.csv"),
            &fixture("lines.csv"),
            &fixture("linestops.csv"),
        )
        .expect("Failed to load graph fixtures"),
    )
}

fn unlimited(workers: usize) -> AggregationConfig {
    AggregationConfig {
        workers,
        max_records: None,
    }
}

fn sorted_samples(map: HashMap<SegmentId, Vec<f64>>) -> HashMap<SegmentId, Vec<f64>> {
    map.into_iter()
        .map(|(k, mut v)| {
            v.sort_by(f64::total_cmp);
            (k, v)
        })
        .collect()
}

#[test]
fn test_reader_counts_fixture() {
    let mut vehicles = Vec::new();
    let stats = TelemetryReader::new(telemetry())
        .read_all(|record| vehicles.push(record.vehicle_code))
        .unwrap();

    assert_eq!(stats.total_lines, 54);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errors, 2);
    assert_eq!(stats.processed, 51);
    assert_eq!(vehicles.len(), 51);
}

#[test]
fn test_strict_reader_stops_at_first_bad_line() {
    let err = TelemetryReader::new(telemetry())
        .strict(true)
        .read_all(|_| {})
        .unwrap_err();

    match err {
        ReadError::Malformed { content, .. } => assert_eq!(content, "bad,row"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_parallel_and_sequential_aggregation_agree() {
    let sequential = TelemetryAggregator::new(telemetry(), unlimited(1))
        .collect_sequential()
        .unwrap();
    let expected = sorted_samples(sequential.merged.speeds);

    for workers in 1..=5 {
        let parallel = TelemetryAggregator::new(telemetry(), unlimited(workers))
            .collect_parallel()
            .unwrap();
        assert_eq!(parallel.workers_completed, workers);
        assert_eq!(
            sorted_samples(parallel.merged.speeds),
            expected,
            "workers = {workers}"
        );
    }
}

#[test]
fn test_aggregation_report_matches_fixture() {
    let report = TelemetryAggregator::new(telemetry(), unlimited(3))
        .aggregate()
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.data_lines, 53);
    assert_eq!(report.processed_lines, 53);
    assert_eq!(report.parse_errors, 2);
    assert_eq!(report.valid_samples, 49);
    assert_eq!(report.unique_segments, 3);

    let trunk = &report.stats[&SegmentId::for_route(131, 131)];
    assert_eq!(trunk.sample_count, 17);
    assert_eq!(trunk.min, 20.0);
    assert_eq!(trunk.max, 95.0);
    assert!(trunk.is_reliable());
    assert_eq!(report.stats[&SegmentId::for_route(8, 8)].sample_count, 16);
}

#[test]
fn test_aggregated_statistics_to_csv() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("segments.csv");
    let report = TelemetryAggregator::new(telemetry(), unlimited(2))
        .aggregate()
        .unwrap();

    let stats: Vec<_> = report.stats.values().cloned().collect();
    assert_eq!(append_segments(&path, &stats).unwrap(), 3);

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 4);
    assert!(content.lines().nth(1).unwrap().starts_with("8,8,-1,-1,16,"));
}

#[test]
fn test_streaming_replay_of_fixture() {
    let config = StreamingConfig {
        pacing: false,
        max_records: None,
        queue_capacity: 8,
        batch_size: 5,
        poll_interval: Duration::from_millis(10),
        ..StreamingConfig::default()
    };
    let hub = Arc::new(NotificationHub::new());
    let service = StreamingService::new(telemetry(), config).with_notifier(hub.clone());

    service.start().unwrap();
    let summary = service.wait_for_completion();

    assert_eq!(summary.stats.records_queued, 50);
    assert_eq!(summary.stats.processed, 50);
    assert_eq!(summary.stats.events_generated, 52);
    assert_eq!(summary.stats.vehicles_tracked, 6);
    assert_eq!(summary.producer.unwrap().parse_errors, 2);

    let counts = service.event_store().count_by_kind();
    assert_eq!(counts[&EventKind::Speeding], 1);
    assert_eq!(counts[&EventKind::Stopped], 1);
    assert_eq!(counts[&EventKind::PositionUpdate], 50);

    // Only the speeding event is high priority.
    assert_eq!(hub.notification_count(), 1);
    assert!(hub.recent(1)[0].message.contains("on bus 105"));

    let stopped = service.latest_position(106).unwrap();
    assert!(!stopped.is_moving());
}

#[test]
fn test_streaming_respects_record_cap() {
    let config = StreamingConfig {
        pacing: false,
        max_records: Some(10),
        poll_interval: Duration::from_millis(10),
        ..StreamingConfig::default()
    };
    let service = StreamingService::new(telemetry(), config);

    service.start().unwrap();
    let summary = service.wait_for_completion();
    assert_eq!(summary.stats.processed, 10);
}

#[test]
fn test_graph_fixture_summary() {
    let summary = graph().summary();

    assert_eq!(summary.stops, 7);
    assert_eq!(summary.lines, 3);
    assert_eq!(summary.arcs, 8);
    assert_eq!(summary.lines_with_arcs, 2);
}

#[test]
fn test_route_with_transfer() {
    let calculator = RouteCalculator::new(graph(), Arc::new(SegmentStatsStore::new()));
    let route = calculator.fastest(500, 505);

    assert!(route.is_found());
    assert_eq!(route.stops_in_order(), vec![500, 501, 502, 504, 505]);
    assert_eq!(route.lines_used(), vec!["T31", "E21"]);
    assert_eq!(route.transfers(), 1);

    let distance: f64 = route.segments().iter().map(|s| s.distance_m).sum();
    assert!((route.total_distance_m() - distance).abs() < 1e-6);
    assert!(route.total_distance_m() > 4_000.0);

    let shortest = calculator.shortest(500, 505);
    assert_eq!(shortest.stops_in_order(), route.stops_in_order());

    let fewest = calculator.calculate(500, 505, RouteStrategy::FewestTransfers);
    assert!(fewest.total_time_min() >= route.total_time_min() - 1e-9);
}

#[test]
fn test_unreachable_and_unknown_stops() {
    let calculator = RouteCalculator::new(graph(), Arc::new(SegmentStatsStore::new()));

    assert!(!calculator.fastest(500, 506).is_found());
    assert!(!calculator.fastest(505, 500).is_found());
    assert!(!calculator.fastest(500, 999).is_found());
}

#[test]
fn test_aggregated_statistics_do_not_reach_arc_lookups() {
    let store = Arc::new(SegmentStatsStore::new());
    let calculator = RouteCalculator::new(graph(), store.clone());
    let before = calculator.fastest(500, 503);

    let report = TelemetryAggregator::new(telemetry(), unlimited(2))
        .aggregate()
        .unwrap();
    store.publish(report.stats);

    let info = calculator.service_info();
    assert_eq!(info.stats_segments, 3);
    assert_eq!(info.arcs_with_stats, 0);
    assert_eq!(calculator.fastest(500, 503), before);
}

#[test]
fn test_mass_routes_over_popular_pairs() {
    let calculator = Arc::new(RouteCalculator::new(
        graph(),
        Arc::new(SegmentStatsStore::new()),
    ));
    let mass = MassRouteCalculator::new(calculator, 2);

    let pairs = mass.popular_pairs(3);
    let ids: Vec<(i32, i32)> = pairs.iter().map(|p| (p.origin, p.destination)).collect();
    assert_eq!(ids, vec![(502, 501), (502, 500), (501, 500)]);

    let report = mass.calculate(pairs).unwrap();
    assert_eq!(report.successes, 3);
    assert_eq!(report.failures, 0);
    assert!(report.results.contains_key("502->500"));
    assert_eq!(report.statistics().max_segments, 2);
}

#[test]
fn test_random_mass_routes_are_repeatable() {
    let calculator = Arc::new(RouteCalculator::new(
        graph(),
        Arc::new(SegmentStatsStore::new()),
    ));
    let mass = MassRouteCalculator::new(calculator, 3);

    let pairs = mass.random_pairs(30, &mut StdRng::seed_from_u64(7));
    assert_eq!(pairs, mass.random_pairs(30, &mut StdRng::seed_from_u64(7)));
    assert!(pairs.iter().all(|p| p.origin != p.destination));
    assert!(pairs.iter().all(|p| (500..=506).contains(&p.origin)));

    let report = mass.calculate(pairs).unwrap();
    assert_eq!(report.successes + report.failures, report.results.len());
    assert_eq!(report.workers_completed, 3);
}

fn bus_at(latitude: f64, longitude: f64, next_stop_id: i32) -> BusPosition {
    BusPosition {
        vehicle_code: 101,
        route_id: 131,
        line_id: 131,
        latitude,
        longitude,
        speed: 0.0,
        current_stop_id: -1,
        next_stop_id,
        timestamp: NaiveDate::from_ymd_opt(2019, 5, 28)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap(),
    }
}

#[test]
fn test_eta_uses_aggregated_route_statistics() {
    let store = Arc::new(SegmentStatsStore::new());
    let report = TelemetryAggregator::new(telemetry(), unlimited(2))
        .aggregate()
        .unwrap();
    store.publish(report.stats);
    let trunk = store.find(&SegmentId::for_route(131, 131)).unwrap();

    let calculator = EtaCalculator::new(graph(), store);

    // Leaving Universidades towards Capri, outbound.
    let outbound = bus_at(3.34, -76.53, 501);
    let eta = calculator.calculate_eta(&outbound).unwrap();
    assert_eq!(eta.stop_name, "CAPRI");
    assert_eq!(eta.speed_kmh, trunk.median);
    assert_eq!(eta.confidence, Confidence::Low);
    assert!(eta.distance_m > 1_000.0);

    let ahead: Vec<i32> = calculator
        .calculate_multiple_etas(&outbound, 5)
        .unwrap()
        .iter()
        .map(|e| e.stop_id)
        .collect();
    assert_eq!(ahead, vec![501, 502, 503]);

    // Leaving Tequendama towards Lido, inbound.
    let inbound = bus_at(3.37, -76.53, 502);
    let ahead: Vec<i32> = calculator
        .calculate_multiple_etas(&inbound, 5)
        .unwrap()
        .iter()
        .map(|e| e.stop_id)
        .collect();
    assert_eq!(ahead, vec![502, 501, 500]);

    assert!(calculator.calculate_eta(&bus_at(3.34, -76.53, 999)).is_err());
}

#[test]
fn test_config_file_overrides_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "aggregation": { "workers": 3 }, "streaming": { "acceleration_factor": 60.0, "max_delay": 250 } }"#,
    )
    .unwrap();

    let config = AppConfig::from_file(&path).unwrap();
    assert_eq!(config.aggregation.workers, 3);
    assert_eq!(config.aggregation.max_records, Some(15_000));
    assert_eq!(config.streaming.acceleration_factor, 60.0);
    assert_eq!(config.streaming.max_delay, Duration::from_millis(250));
    assert_eq!(config.streaming.queue_capacity, 10_000);
}
