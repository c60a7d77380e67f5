//! Runs operator-defined SQL on a schedule against a set of databases and
//! exports every result column as a Prometheus gauge.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod exporter;
pub mod metrics;
pub mod pool;
pub mod reconciler;
pub mod scheduler;
pub mod source;
