//! Version timestamps.
//!
//! Every timestamp that crosses a system boundary (checkpoint file, search
//! query, subscription payload) is rendered as ISO-8601 with an explicit
//! offset and millisecond precision, e.g. `2024-01-01T00:00:00.000+00:00`.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// The version marker of a resource (`meta.lastUpdated`).
pub type Version = DateTime<Utc>;

/// The earliest instant a poll can start from: `1970-01-01T00:00:00Z`.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Truncates a timestamp to millisecond precision.
pub fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Formats a timestamp as ISO-8601 with an explicit `+00:00` offset.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Parses an ISO-8601 timestamp carrying any offset (or `Z`).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s.trim()).map(|dt| dt.with_timezone(&Utc))
}
