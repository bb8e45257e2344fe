//! rq-pulse library crate.
//!
//! Samples an RQ deployment into a SQLite time-series store and answers
//! bucketed queries over it.

pub mod analytics;
pub mod collector;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod source;

pub use error::{Error, Result};
