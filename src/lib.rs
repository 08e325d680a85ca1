pub mod aggregation;
pub mod config;
pub mod events;
pub mod graph;
pub mod master_worker;
pub mod notify;
pub mod output;
pub mod reader;
pub mod routing;
pub mod stats;
pub mod store;
pub mod streaming;
pub mod telemetry;
