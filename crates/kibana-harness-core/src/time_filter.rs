//! Time filter parsing and legacy parameter resolution.
//!
//! Clients describe the time window of a query in one of several shapes:
//!
//! | Shape | Example | Meaning |
//! |-------|---------|---------|
//! | Relative | `"24h"`, `"7d"`, `"2w"` | the last N hours / days / weeks |
//! | Absolute | `["2024-01-15T10:00:00Z", "2024-01-15T14:00:00+02:00"]` | explicit `[start, end]` |
//!
//! plus a set of deprecated discrete parameters (`start_time`/`end_time`,
//! `time_range`, `hours`). [`resolve_time_params`] picks exactly one of them
//! by a fixed priority and returns a single [`TimeFilter`].
//!
//! A relative filter is converted to concrete instants only by
//! [`TimeFilter::resolve`], which takes the resolution instant explicitly.
//! Callers resolve once per logical query and reuse the resulting
//! [`TimeWindow`] for fingerprinting and the backend call.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use kibana_harness_core::time_filter::{parse_time_filter, RawTimeFilter};
//!
//! let filter = parse_time_filter(&RawTimeFilter::Relative("24h".into())).unwrap();
//! let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
//! let window = filter.resolve(now);
//! assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
//! assert_eq!(window.end, now);
//! ```

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or resolving time parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeFilterError {
    #[error("invalid time filter '{input}': {reason}")]
    InvalidTimeFilter { input: String, reason: String },

    #[error("invalid timestamp '{value}': expected ISO-8601, e.g. '2024-01-15T10:00:00Z'")]
    InvalidTimestamp { value: String },

    #[error("invalid time range: start '{start}' must be before end '{end}'")]
    InvalidRange { start: String, end: String },
}

impl TimeFilterError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTimeFilter {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Unit of a relative time filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    fn from_suffix(c: char) -> Option<Self> {
        match c {
            'h' => Some(Self::Hours),
            'd' => Some(Self::Days),
            'w' => Some(Self::Weeks),
            _ => None,
        }
    }

    /// Number of hours in one unit.
    pub fn hours(self) -> i64 {
        match self {
            Self::Hours => 1,
            Self::Days => 24,
            Self::Weeks => 24 * 7,
        }
    }

    pub fn suffix(self) -> char {
        match self {
            Self::Hours => 'h',
            Self::Days => 'd',
            Self::Weeks => 'w',
        }
    }
}

/// A validated time filter.
///
/// Immutable once constructed. `Relative` always has `amount > 0`;
/// `Absolute` always has `start < end`, both in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilter {
    Relative { amount: u32, unit: TimeUnit },
    Absolute { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl TimeFilter {
    /// Convert the filter into a concrete window.
    ///
    /// For `Relative`, the window is `[now - amount·unit, now]`; for
    /// `Absolute`, `now` is ignored.
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeWindow {
        match *self {
            TimeFilter::Relative { amount, unit } => {
                let span = Duration::hours(i64::from(amount) * unit.hours());
                let start = now
                    .checked_sub_signed(span)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                TimeWindow { start, end: now }
            }
            TimeFilter::Absolute { start, end } => TimeWindow { start, end },
        }
    }
}

impl std::fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeFilter::Relative { amount, unit } => write!(f, "{}{}", amount, unit.suffix()),
            TimeFilter::Absolute { start, end } => {
                write!(f, "[{}, {}]", start.to_rfc3339(), end.to_rfc3339())
            }
        }
    }
}

/// A concrete UTC time window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// A unified time filter exactly as a client supplied it.
///
/// Deserializes from either a JSON string (`"24h"`) or an array of
/// timestamps (`["2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimeFilter {
    Relative(String),
    Absolute(Vec<String>),
}

/// Parse a raw unified time filter.
pub fn parse_time_filter(raw: &RawTimeFilter) -> Result<TimeFilter, TimeFilterError> {
    match raw {
        RawTimeFilter::Relative(s) => parse_relative(s),
        RawTimeFilter::Absolute(parts) => match parts.as_slice() {
            [start, end] => parse_absolute(start, end),
            _ => Err(TimeFilterError::invalid(
                &format!("{:?}", parts),
                format!(
                    "absolute filter must have exactly 2 timestamps (start, end), got {}",
                    parts.len()
                ),
            )),
        },
    }
}

/// Parse a relative time string matching `^\d+[hdw]$`.
///
/// Surrounding whitespace and upper-case units are tolerated.
pub fn parse_relative(input: &str) -> Result<TimeFilter, TimeFilterError> {
    let normalized = input.trim().to_ascii_lowercase();
    let expected = "expected a number followed by h, d or w, e.g. '1h', '24h', '7d', '2w'";

    let mut chars = normalized.chars();
    let unit = chars
        .next_back()
        .and_then(TimeUnit::from_suffix)
        .ok_or_else(|| TimeFilterError::invalid(input, expected))?;
    let digits = chars.as_str();

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimeFilterError::invalid(input, expected));
    }

    let amount: u32 = digits
        .parse()
        .map_err(|_| TimeFilterError::invalid(input, "amount is too large"))?;

    if amount == 0 {
        return Err(TimeFilterError::invalid(input, "amount must be greater than zero"));
    }

    Ok(TimeFilter::Relative { amount, unit })
}

/// Parse an absolute `[start, end]` pair. Both must parse and `start < end`.
pub fn parse_absolute(start: &str, end: &str) -> Result<TimeFilter, TimeFilterError> {
    let start_dt = parse_timestamp(start)?;
    let end_dt = parse_timestamp(end)?;

    if start_dt >= end_dt {
        return Err(TimeFilterError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }

    Ok(TimeFilter::Absolute {
        start: start_dt,
        end: end_dt,
    })
}

/// Parse an ISO-8601 timestamp, normalizing to UTC.
///
/// Accepts RFC 3339 (`Z` or `±HH:MM`), offsets without a colon,
/// offset-less date-times (taken as UTC), and bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimeFilterError> {
    let v = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(v, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(naive) = NaiveDate::parse_from_str(v, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(naive.and_utc());
    }

    Err(TimeFilterError::InvalidTimestamp {
        value: value.to_string(),
    })
}

/// Every time-related parameter a request may carry.
///
/// `time_filter` is the current, unified parameter; the others are
/// deprecated but still honored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeParams {
    #[serde(default)]
    pub time_filter: Option<RawTimeFilter>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default)]
    pub hours: Option<i64>,
}

/// Which parameter [`resolve_time_params`] ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    Unified,
    StartEnd,
    TimeRange,
    Hours,
    Default,
}

/// Result of [`resolve_time_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimeFilter {
    pub filter: TimeFilter,
    pub source: TimeSource,
}

fn supplied(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Pick the single highest-priority time parameter and parse it.
///
/// Priority: unified `time_filter` > `start_time` + `end_time` (both
/// required) > `time_range` > `hours` > `default_range`. Lower-priority
/// parameters are ignored, never combined with the chosen one.
pub fn resolve_time_params(
    params: &TimeParams,
    default_range: &str,
) -> Result<ResolvedTimeFilter, TimeFilterError> {
    let (filter, source) = if let Some(raw) = &params.time_filter {
        (parse_time_filter(raw)?, TimeSource::Unified)
    } else if let (Some(start), Some(end)) = (supplied(&params.start_time), supplied(&params.end_time)) {
        (parse_absolute(start, end)?, TimeSource::StartEnd)
    } else if let Some(range) = supplied(&params.time_range) {
        (parse_relative(range)?, TimeSource::TimeRange)
    } else if let Some(hours) = params.hours {
        let amount = u32::try_from(hours)
            .ok()
            .filter(|h| *h > 0)
            .ok_or_else(|| {
                TimeFilterError::invalid(&hours.to_string(), "hours must be a positive integer")
            })?;
        (
            TimeFilter::Relative {
                amount,
                unit: TimeUnit::Hours,
            },
            TimeSource::Hours,
        )
    } else {
        (parse_relative(default_range)?, TimeSource::Default)
    };

    Ok(ResolvedTimeFilter { filter, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_relative_24h_window() {
        let filter = parse_relative("24h").unwrap();
        let window = filter.resolve(utc(2024, 1, 2, 12));
        assert_eq!(window.start, utc(2024, 1, 1, 12));
        assert_eq!(window.end, utc(2024, 1, 2, 12));
    }

    #[test]
    fn test_relative_units() {
        assert_eq!(
            parse_relative("7d").unwrap(),
            TimeFilter::Relative { amount: 7, unit: TimeUnit::Days }
        );
        assert_eq!(
            parse_relative("2w").unwrap(),
            TimeFilter::Relative { amount: 2, unit: TimeUnit::Weeks }
        );
        assert_eq!(
            parse_relative(" 3H ").unwrap(),
            TimeFilter::Relative { amount: 3, unit: TimeUnit::Hours }
        );
    }

    #[test]
    fn test_relative_rejects_malformed() {
        for bad in ["", "h", "24", "24x", "-1h", "1.5h", "1m", "h24", "1 h", "0h"] {
            let err = parse_relative(bad).unwrap_err();
            match err {
                TimeFilterError::InvalidTimeFilter { input, .. } => assert_eq!(input, bad),
                other => panic!("unexpected error for {:?}: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_relative_same_instant_is_stable() {
        let filter = parse_relative("6h").unwrap();
        let now = utc(2024, 3, 10, 8);
        assert_eq!(filter.resolve(now), filter.resolve(now));
    }

    #[test]
    fn test_relative_length_constant_across_instants() {
        for raw in ["1h", "36h", "3d", "1w"] {
            let filter = parse_relative(raw).unwrap();
            let a = filter.resolve(utc(2024, 1, 1, 0));
            let b = filter.resolve(utc(2024, 6, 15, 17));
            assert_eq!(a.duration(), b.duration());
            assert_eq!(b.end, utc(2024, 6, 15, 17));
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_absolute_end_before_start() {
        let err = parse_time_filter(&RawTimeFilter::Absolute(vec![
            "2024-01-02T00:00:00Z".into(),
            "2024-01-01T00:00:00Z".into(),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            TimeFilterError::InvalidRange {
                start: "2024-01-02T00:00:00Z".into(),
                end: "2024-01-01T00:00:00Z".into(),
            }
        );
    }

    #[test]
    fn test_absolute_equal_bounds_rejected() {
        let err = parse_absolute("2024-01-01T00:00:00Z", "2024-01-01T00:00:00Z").unwrap_err();
        assert!(matches!(err, TimeFilterError::InvalidRange { .. }));
    }

    #[test]
    fn test_absolute_names_bad_timestamp() {
        let err = parse_absolute("2024-01-01T00:00:00Z", "yesterday").unwrap_err();
        assert_eq!(
            err,
            TimeFilterError::InvalidTimestamp {
                value: "yesterday".into()
            }
        );
    }

    #[test]
    fn test_absolute_wrong_arity() {
        let err =
            parse_time_filter(&RawTimeFilter::Absolute(vec!["2024-01-01T00:00:00Z".into()])).unwrap_err();
        assert!(matches!(err, TimeFilterError::InvalidTimeFilter { .. }));
    }

    #[test]
    fn test_offsets_normalized_to_utc() {
        let filter = parse_absolute("2024-01-01T12:00:00+02:00", "2024-01-01T12:00:00-0100").unwrap();
        assert_eq!(
            filter,
            TimeFilter::Absolute {
                start: utc(2024, 1, 1, 10),
                end: utc(2024, 1, 1, 13),
            }
        );
    }

    #[test]
    fn test_timestamp_shapes() {
        assert_eq!(parse_timestamp("2024-01-01T05:00:00").unwrap(), utc(2024, 1, 1, 5));
        assert_eq!(parse_timestamp("2024-01-01").unwrap(), utc(2024, 1, 1, 0));
        assert_eq!(
            parse_timestamp("2024-01-01T05:00:00.250Z").unwrap(),
            utc(2024, 1, 1, 5) + Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_raw_filter_deserializes_both_shapes() {
        let rel: RawTimeFilter = serde_json::from_str("\"24h\"").unwrap();
        assert_eq!(rel, RawTimeFilter::Relative("24h".into()));
        let abs: RawTimeFilter =
            serde_json::from_str(r#"["2024-01-01T00:00:00Z","2024-01-02T00:00:00Z"]"#).unwrap();
        assert_eq!(
            abs,
            RawTimeFilter::Absolute(vec!["2024-01-01T00:00:00Z".into(), "2024-01-02T00:00:00Z".into()])
        );
    }

    // Priority order regression tests: one per level.

    fn all_params() -> TimeParams {
        TimeParams {
            time_filter: Some(RawTimeFilter::Relative("2h".into())),
            start_time: Some("2024-01-01T00:00:00Z".into()),
            end_time: Some("2024-01-02T00:00:00Z".into()),
            time_range: Some("3d".into()),
            hours: Some(5),
        }
    }

    #[test]
    fn test_priority_unified_wins() {
        let resolved = resolve_time_params(&all_params(), "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::Unified);
        assert_eq!(
            resolved.filter,
            TimeFilter::Relative { amount: 2, unit: TimeUnit::Hours }
        );
    }

    #[test]
    fn test_priority_start_end_over_range() {
        let params = TimeParams {
            time_filter: None,
            ..all_params()
        };
        let resolved = resolve_time_params(&params, "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::StartEnd);
        assert_eq!(
            resolved.filter,
            TimeFilter::Absolute {
                start: utc(2024, 1, 1, 0),
                end: utc(2024, 1, 2, 0)
            }
        );
    }

    #[test]
    fn test_priority_range_over_hours() {
        let params = TimeParams {
            time_filter: None,
            start_time: None,
            ..all_params()
        };
        let resolved = resolve_time_params(&params, "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::TimeRange);
        assert_eq!(
            resolved.filter,
            TimeFilter::Relative { amount: 3, unit: TimeUnit::Days }
        );
    }

    #[test]
    fn test_priority_hours_over_default() {
        let params = TimeParams {
            hours: Some(5),
            ..Default::default()
        };
        let resolved = resolve_time_params(&params, "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::Hours);
        assert_eq!(
            resolved.filter,
            TimeFilter::Relative { amount: 5, unit: TimeUnit::Hours }
        );
    }

    #[test]
    fn test_priority_default() {
        let resolved = resolve_time_params(&TimeParams::default(), "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::Default);
        assert_eq!(
            resolved.filter,
            TimeFilter::Relative { amount: 1, unit: TimeUnit::Days }
        );
    }

    #[test]
    fn test_lone_start_time_is_ignored() {
        let params = TimeParams {
            start_time: Some("2024-01-01T00:00:00Z".into()),
            hours: Some(4),
            ..Default::default()
        };
        let resolved = resolve_time_params(&params, "1d").unwrap();
        assert_eq!(resolved.source, TimeSource::Hours);
    }

    #[test]
    fn test_invalid_higher_priority_is_not_skipped() {
        let params = TimeParams {
            time_filter: Some(RawTimeFilter::Relative("soon".into())),
            hours: Some(4),
            ..Default::default()
        };
        assert!(resolve_time_params(&params, "1d").is_err());
    }

    #[test]
    fn test_zero_hours_rejected() {
        let params = TimeParams {
            hours: Some(0),
            ..Default::default()
        };
        let err = resolve_time_params(&params, "1d").unwrap_err();
        assert!(matches!(err, TimeFilterError::InvalidTimeFilter { ref input, .. } if input == "0"));
    }
}
