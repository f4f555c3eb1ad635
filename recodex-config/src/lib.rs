//! Configuration for the Recodex binaries.
//!
//! Every knob is a clap flag with an environment fallback (prefix `RECODEX_`),
//! so the same binary runs from systemd units, containers, and the command
//! line without a config file. Durations use humantime syntax (`5m`, `24h`).

pub mod broker;
pub mod database;
pub mod scheduler;
pub mod telemetry;
pub mod web;
pub mod worker;

pub use broker::BrokerConfig;
pub use database::DatabaseConfig;
pub use scheduler::SchedulerConfig;
pub use web::WebConfig;
pub use worker::{ClockTime, JobType, WorkerConfig};

use std::time::Duration;

/// Clap value parser for humantime-style durations.
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}
