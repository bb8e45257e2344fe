//! Time windows, lookback presets and bucket granularity.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::database::time::{datetime_to_ms, ms_to_datetime};

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `lookback` immediately preceding `now`.
    pub fn ending_at(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start: now - lookback,
            end: now,
        }
    }

    /// The `lookback` immediately preceding the current instant.
    pub fn last(lookback: Duration) -> Self {
        Self::ending_at(Utc::now(), lookback)
    }

    pub fn start_ms(&self) -> i64 {
        datetime_to_ms(self.start)
    }

    pub fn end_ms(&self) -> i64 {
        datetime_to_ms(self.end)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Named lookback presets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum PeriodPreset {
    #[strum(serialize = "5m")]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[strum(serialize = "15m")]
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[strum(serialize = "30m")]
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[strum(serialize = "1h")]
    #[serde(rename = "1h")]
    OneHour,
    #[strum(serialize = "3h")]
    #[serde(rename = "3h")]
    ThreeHours,
    #[strum(serialize = "6h")]
    #[serde(rename = "6h")]
    SixHours,
    #[strum(serialize = "12h")]
    #[serde(rename = "12h")]
    TwelveHours,
    #[strum(serialize = "24h")]
    #[serde(rename = "24h")]
    TwentyFourHours,
    #[strum(serialize = "7d")]
    #[serde(rename = "7d")]
    SevenDays,
    #[strum(serialize = "30d")]
    #[serde(rename = "30d")]
    ThirtyDays,
}

impl PeriodPreset {
    pub fn lookback(&self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::ThreeHours => Duration::hours(3),
            Self::SixHours => Duration::hours(6),
            Self::TwelveHours => Duration::hours(12),
            Self::TwentyFourHours => Duration::hours(24),
            Self::SevenDays => Duration::days(7),
            Self::ThirtyDays => Duration::days(30),
        }
    }
}

/// Bucket width used to downsample a series.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Granularity {
    #[default]
    #[strum(serialize = "1s")]
    #[serde(rename = "1s")]
    OneSecond,
    #[strum(serialize = "5s")]
    #[serde(rename = "5s")]
    FiveSeconds,
    #[strum(serialize = "1m")]
    #[serde(rename = "1m")]
    OneMinute,
    #[strum(serialize = "5m")]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[strum(serialize = "1h")]
    #[serde(rename = "1h")]
    OneHour,
}

impl Granularity {
    /// Bucket width in milliseconds.
    pub fn width_ms(&self) -> i64 {
        match self {
            Self::OneSecond => 1_000,
            Self::FiveSeconds => 5_000,
            Self::OneMinute => 60_000,
            Self::FiveMinutes => 300_000,
            Self::OneHour => 3_600_000,
        }
    }

    /// Parse a token, falling back to one-second buckets for anything unknown.
    pub fn parse_or_default(token: &str) -> Self {
        Self::from_str(token.trim()).unwrap_or_default()
    }

    /// Truncate an epoch-millisecond timestamp to the start of its bucket.
    pub fn truncate_ms(&self, ts_ms: i64) -> i64 {
        let width = self.width_ms();
        ts_ms - ts_ms.rem_euclid(width)
    }

    /// Truncate a timestamp to the start of its bucket.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ms_to_datetime(self.truncate_ms(datetime_to_ms(ts)))
    }
}

/// Caller-supplied period: a preset lookback or an explicit range, plus bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub period: PeriodPreset,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub granularity: Granularity,
}

impl TimePeriod {
    pub fn preset(period: PeriodPreset) -> Self {
        Self {
            period,
            start: None,
            end: None,
            granularity: Granularity::default(),
        }
    }

    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            period: PeriodPreset::TwentyFourHours,
            start: Some(start),
            end: Some(end),
            granularity: Granularity::default(),
        }
    }

    /// Parse loosely-typed request parameters. An unknown preset token falls
    /// back to `default_preset`; an unknown granularity to one second.
    pub fn from_tokens(
        period: Option<&str>,
        default_preset: PeriodPreset,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        granularity: Option<&str>,
    ) -> Self {
        let period = period
            .and_then(|p| PeriodPreset::from_str(p.trim()).ok())
            .unwrap_or(default_preset);
        Self {
            period,
            start,
            end,
            granularity: granularity
                .map(Granularity::parse_or_default)
                .unwrap_or_default(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Resolve to a concrete window relative to `now`.
    ///
    /// An explicit start wins over the preset (its end defaults to `now`).
    /// An end without a start anchors the preset lookback at that end.
    pub fn resolve_at(&self, now: DateTime<Utc>) -> TimeWindow {
        match (self.start, self.end) {
            (Some(start), Some(end)) => TimeWindow::new(start, end),
            (Some(start), None) => TimeWindow::new(start, now),
            (None, Some(end)) => TimeWindow::ending_at(end, self.period.lookback()),
            (None, None) => TimeWindow::ending_at(now, self.period.lookback()),
        }
    }

    pub fn resolve(&self) -> TimeWindow {
        self.resolve_at(Utc::now())
    }
}

impl Default for TimePeriod {
    fn default() -> Self {
        Self::preset(PeriodPreset::TwentyFourHours)
    }
}
