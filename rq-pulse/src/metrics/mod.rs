//! Metrics exposition.

pub mod prometheus;

pub use prometheus::PrometheusExporter;
