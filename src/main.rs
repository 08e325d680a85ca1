//! CLI entry point for the BRT telemetry tool.
//!
//! Provides subcommands for aggregating telemetry into segment speed
//! statistics, replaying telemetry through the streaming pipeline,
//! calculating routes over the stop graph and estimating bus arrivals.

use anyhow::{Context, Result};
use brt_telemetry::{
    aggregation::{AggregationReport, TelemetryAggregator},
    config::{AggregationConfig, AppConfig},
    graph::{Graph, load_graph},
    notify::{Notification, NotificationHub, NotificationListener},
    output::{append_segments, print_json, print_pretty},
    routing::{EtaCalculator, MassRouteCalculator, RouteCalculator, RouteContext, RouteStrategy},
    store::SegmentStatsStore,
    streaming::{BusPosition, StreamingService},
};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "brt_telemetry")]
#[command(about = "Bus telemetry aggregation, replay and routing", long_about = None)]
struct Cli {
    /// JSON configuration file; command-line flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GraphArgs {
    /// Stops table (CSV)
    #[arg(long, default_value = "data/stops.csv")]
    stops: PathBuf,

    /// Lines table (CSV)
    #[arg(long, default_value = "data/lines.csv")]
    lines: PathBuf,

    /// Line-stops table (CSV)
    #[arg(long, default_value = "data/linestops.csv")]
    line_stops: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate a telemetry file into per-segment speed statistics
    Aggregate {
        /// Telemetry CSV file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Worker threads (one file chunk each)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Data lines to read (0 = whole file)
        #[arg(short, long)]
        max_records: Option<u64>,

        /// Run the single-threaded variant
        #[arg(long, default_value_t = false)]
        sequential: bool,

        /// CSV file to append segment statistics to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Segments to list in the fastest/slowest rankings
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Replay a telemetry file through the streaming pipeline
    Stream {
        /// Telemetry CSV file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Records to replay (0 = whole file)
        #[arg(short, long)]
        max_records: Option<u64>,

        /// Replay speed relative to recorded time
        #[arg(short, long)]
        acceleration: Option<f64>,

        /// Replay as fast as possible, ignoring timestamps
        #[arg(long, default_value_t = false)]
        no_pacing: bool,

        /// Recent events to list at the end
        #[arg(long, default_value_t = 10)]
        recent: usize,

        /// Only list recent events of this vehicle
        #[arg(long)]
        vehicle: Option<i32>,
    },
    /// Calculate a route between two stops
    Route {
        #[command(flatten)]
        graph: GraphArgs,

        /// Origin stop id
        origin: i32,

        /// Destination stop id
        destination: i32,

        #[arg(short, long, value_enum, default_value_t = RouteStrategy::Fastest)]
        strategy: RouteStrategy,

        /// Telemetry file to aggregate into speed statistics first
        #[arg(short, long)]
        telemetry: Option<PathBuf>,

        /// Currently observed bus speed in km/h
        #[arg(long)]
        live_speed: Option<f64>,

        /// Print the route as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Calculate routes between the most connected stops in parallel
    MassRoutes {
        #[command(flatten)]
        graph: GraphArgs,

        /// Most connected stops to pair up
        #[arg(short = 'n', long, default_value_t = 10)]
        top_stops: usize,

        /// Use this many random stop pairs instead of the most connected stops
        #[arg(long)]
        random: Option<usize>,

        /// Seed for --random, for repeatable batches
        #[arg(long, requires = "random")]
        seed: Option<u64>,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(short, long, value_enum, default_value_t = RouteStrategy::Fastest)]
        strategy: RouteStrategy,

        /// Telemetry file to aggregate into speed statistics first
        #[arg(short, long)]
        telemetry: Option<PathBuf>,
    },
    /// Estimate arrival times for a bus heading to its next stop
    Eta {
        #[command(flatten)]
        graph: GraphArgs,

        /// Route the bus is serving
        #[arg(long)]
        route: i32,

        /// Line the bus is serving
        #[arg(long)]
        line: i32,

        /// Stop the bus is heading to
        #[arg(long)]
        next_stop: i32,

        /// Current latitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Current longitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Current speed in km/h
        #[arg(long, default_value_t = 0.0)]
        speed: f64,

        /// Vehicle code
        #[arg(long, default_value_t = 0)]
        vehicle: i32,

        /// Stops ahead to estimate, the next stop included
        #[arg(short = 'n', long, default_value_t = 1)]
        ahead: usize,

        /// Telemetry file to aggregate into speed statistics first
        #[arg(short, long)]
        telemetry: Option<PathBuf>,

        /// Print the estimates as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Load the stop graph and print its summary
    GraphInfo {
        #[command(flatten)]
        graph: GraphArgs,

        /// Also list the arcs of this line (short name)
        #[arg(long)]
        line: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/brt_telemetry.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("brt_telemetry.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Aggregate {
            file,
            workers,
            max_records,
            sequential,
            output,
            json,
            top,
        } => {
            if let Some(workers) = workers {
                config.aggregation.workers = workers;
            }
            config.aggregation.max_records = record_cap(max_records, config.aggregation.max_records);
            config.validate()?;

            tokio::task::spawn_blocking(move || {
                run_aggregate(&file, config.aggregation, sequential, output.as_deref(), json, top)
            })
            .await??;
        }
        Commands::Stream {
            file,
            max_records,
            acceleration,
            no_pacing,
            recent,
            vehicle,
        } => {
            config.streaming.max_records = record_cap(max_records, config.streaming.max_records);
            if let Some(acceleration) = acceleration {
                config.streaming.acceleration_factor = acceleration;
            }
            if no_pacing {
                config.streaming.pacing = false;
            }
            config.validate()?;

            run_stream(file, config, recent, vehicle).await?;
        }
        Commands::Route {
            graph,
            origin,
            destination,
            strategy,
            telemetry,
            live_speed,
            json,
        } => {
            config.validate()?;
            tokio::task::spawn_blocking(move || -> Result<()> {
                let calculator = build_calculator(&graph, telemetry.as_deref(), &config.aggregation)?;
                info!("\n{}", calculator.service_info());

                let context = RouteContext {
                    live_speed_kmh: live_speed,
                };
                let route = calculator.calculate_with(origin, destination, strategy, &context);
                if json {
                    print_json(&route)?;
                } else {
                    info!("\n{route}");
                }
                Ok(())
            })
            .await??;
        }
        Commands::MassRoutes {
            graph,
            top_stops,
            random,
            seed,
            workers,
            strategy,
            telemetry,
        } => {
            if let Some(workers) = workers {
                config.aggregation.workers = workers;
            }
            config.validate()?;
            tokio::task::spawn_blocking(move || -> Result<()> {
                let calculator = build_calculator(&graph, telemetry.as_deref(), &config.aggregation)?;
                let mass = MassRouteCalculator::new(Arc::new(calculator), config.aggregation.workers)
                    .with_strategy(strategy);

                let pairs = match random {
                    Some(count) => {
                        let mut rng = match seed {
                            Some(seed) => StdRng::seed_from_u64(seed),
                            None => StdRng::from_rng(&mut rand::rng()),
                        };
                        let pairs = mass.random_pairs(count, &mut rng);
                        info!(count, seed, pairs = pairs.len(), "Generated random stop pairs");
                        pairs
                    }
                    None => {
                        let pairs = mass.popular_pairs(top_stops);
                        info!(top_stops, pairs = pairs.len(), "Generated popular stop pairs");
                        pairs
                    }
                };

                let report = mass.calculate(pairs)?;
                info!(
                    successes = report.successes,
                    failures = report.failures,
                    avg_calc_ms = report.avg_calc_time_ms,
                    "Batch finished"
                );
                info!(statistics = %report.statistics(), "Route statistics");
                Ok(())
            })
            .await??;
        }
        Commands::Eta {
            graph,
            route,
            line,
            next_stop,
            lat,
            lon,
            speed,
            vehicle,
            ahead,
            telemetry,
            json,
        } => {
            config.validate()?;
            tokio::task::spawn_blocking(move || -> Result<()> {
                let (graph, store) = load_network(&graph, telemetry.as_deref(), &config.aggregation)?;
                let calculator = EtaCalculator::new(graph, store);

                let position = BusPosition {
                    vehicle_code: vehicle,
                    route_id: route,
                    line_id: line,
                    latitude: lat,
                    longitude: lon,
                    speed,
                    current_stop_id: -1,
                    next_stop_id: next_stop,
                    timestamp: Local::now().naive_local(),
                };
                info!(%position, "Estimating arrivals");

                let etas = calculator.calculate_multiple_etas(&position, ahead.max(1))?;
                if json {
                    print_json(&etas)?;
                } else {
                    for eta in &etas {
                        info!(soon = eta.is_arriving_soon(), "{eta}");
                    }
                }
                Ok(())
            })
            .await??;
        }
        Commands::GraphInfo { graph, line } => {
            tokio::task::spawn_blocking(move || -> Result<()> {
                let graph = load_graph_tables(&graph)?;
                let summary = graph.summary();
                info!(%summary, "Graph summary");
                print_pretty(&summary);

                if let Some(line) = line {
                    let arcs = graph.arcs_for_line(&line);
                    if arcs.is_empty() {
                        warn!(line = %line, "No arcs for line");
                    }
                    for arc in arcs {
                        info!("{arc}");
                    }
                }
                Ok(())
            })
            .await??;
        }
    }

    Ok(())
}

/// Resolves a record-cap flag against the configured cap. `0` lifts the cap.
fn record_cap(flag: Option<u64>, configured: Option<u64>) -> Option<u64> {
    match flag {
        Some(0) => None,
        Some(cap) => Some(cap),
        None => configured,
    }
}

/// Aggregates a telemetry file, logs the rankings and optionally writes the
/// statistics to CSV.
#[tracing::instrument(skip_all, fields(file = %file.display(), sequential = sequential))]
fn run_aggregate(
    file: &Path,
    config: AggregationConfig,
    sequential: bool,
    output: Option<&Path>,
    json: bool,
    top: usize,
) -> Result<()> {
    let aggregator = TelemetryAggregator::new(file, config);
    let report = if sequential {
        aggregator.aggregate_sequential()?
    } else {
        aggregator.aggregate()?
    };
    if !report.is_complete() {
        warn!(
            completed = report.workers_completed,
            expected = report.workers_expected,
            "Some workers failed, statistics are partial"
        );
    }

    if json {
        print_json(&report)?;
    }
    if let Some(output) = output {
        let stats: Vec<_> = report.stats.values().cloned().collect();
        let written = append_segments(output, &stats)?;
        info!(path = %output.display(), rows = written, "Segment statistics written");
    }

    let store = SegmentStatsStore::from_map(report.stats);
    let summary = store.summary();
    info!(
        segments = summary.segments,
        reliable = summary.reliable_segments,
        samples = summary.total_samples,
        mean_reliable_speed = summary.mean_reliable_speed,
        "Statistics summary"
    );
    print_pretty(&summary);

    for stats in store.fastest(top) {
        info!("fastest: {stats}");
    }
    for stats in store.slowest(top) {
        info!("slowest: {stats}");
    }
    for stats in store.most_variable(top) {
        info!(std_dev = stats.std_dev, "most variable: {stats}");
    }
    Ok(())
}

/// Logs every delivered notification.
struct LogListener;

impl NotificationListener for LogListener {
    fn listener_id(&self) -> &str {
        "cli-log"
    }

    fn on_notification(&self, notification: &Notification) {
        warn!(vehicle = notification.event.vehicle_code, "{}", notification.message);
    }
}

/// Runs the replay pipeline until the file is exhausted or Ctrl-C arrives.
#[tracing::instrument(skip_all, fields(file = %file.display()))]
async fn run_stream(
    file: PathBuf,
    config: AppConfig,
    recent: usize,
    vehicle: Option<i32>,
) -> Result<()> {
    let hub = Arc::new(NotificationHub::new());
    hub.register(Arc::new(LogListener));

    let service = Arc::new(StreamingService::new(&file, config.streaming.clone()).with_notifier(hub.clone()));
    service.start()?;
    info!("Streaming started. Press Ctrl+C to stop.");

    let mut waiter = {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.wait_for_completion())
    };

    let finished = tokio::select! {
        joined = &mut waiter => Some(joined?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let summary = match finished {
        Some(summary) => summary,
        None => {
            info!("Ctrl-C received, stopping pipeline");
            let stopping = service.clone();
            if !tokio::task::spawn_blocking(move || stopping.stop()).await? {
                warn!("Pipeline did not stop cleanly");
            }
            tokio::time::timeout(config.streaming.stop_timeout, waiter)
                .await
                .context("pipeline threads did not finish after stop")??
        }
    };

    info!(stats = %summary.stats, "Final pipeline stats");
    if let Some(producer) = summary.producer {
        info!(
            lines_read = producer.lines_read,
            queued = producer.records_queued,
            parse_errors = producer.parse_errors,
            "Producer report"
        );
    }

    let events = service.event_store();
    for (kind, count) in events.count_by_kind() {
        info!(%kind, count, "Events by kind");
    }
    let listed = match vehicle {
        Some(vehicle) => events.recent_for_vehicle(vehicle, recent),
        None => events.recent(recent),
    };
    for event in listed {
        info!("{event}");
    }
    info!(
        notifications = hub.notification_count(),
        critical = hub.critical(usize::MAX).len(),
        "Notifications delivered"
    );
    Ok(())
}

fn load_graph_tables(args: &GraphArgs) -> Result<Graph> {
    load_graph(&args.stops, &args.lines, &args.line_stops).context("loading stop graph")
}

/// Loads the graph and, when a telemetry file is given, publishes its
/// aggregated statistics before anything is calculated.
fn load_network(
    graph: &GraphArgs,
    telemetry: Option<&Path>,
    aggregation: &AggregationConfig,
) -> Result<(Arc<Graph>, Arc<SegmentStatsStore>)> {
    let graph = Arc::new(load_graph_tables(graph)?);
    let store = Arc::new(SegmentStatsStore::new());

    if let Some(telemetry) = telemetry {
        let AggregationReport { stats, .. } =
            TelemetryAggregator::new(telemetry, aggregation.clone()).aggregate()?;
        store.publish(stats);
    }
    Ok((graph, store))
}

fn build_calculator(
    graph: &GraphArgs,
    telemetry: Option<&Path>,
    aggregation: &AggregationConfig,
) -> Result<RouteCalculator> {
    let (graph, store) = load_network(graph, telemetry, aggregation)?;
    Ok(RouteCalculator::new(graph, store))
}
