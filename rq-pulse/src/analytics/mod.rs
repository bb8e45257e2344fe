//! Query engine: time windows, series reconstruction and the service facade.

pub mod period;
pub mod series;
pub mod service;

pub use period::{Granularity, PeriodPreset, TimePeriod, TimeWindow};
pub use series::{MetricType, QueueDepthPoint, TimeSeriesPoint, WorkerThroughputPoint};
pub use service::{AnalyticsService, DashboardSummary};
