use std::time::Duration;

use chrono::{DateTime, Utc};

/// Parses an HTTP `Retry-After` header value.
///
/// Accepts non-negative delta-seconds or an HTTP-date (RFC 1123, with either a
/// named or a numeric zone). Past dates, negative values, and anything
/// unparseable yield `Duration::ZERO`, which callers treat as "no hint".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let remaining = date.with_timezone(&Utc) - now;
        return remaining.to_std().unwrap_or(Duration::ZERO);
    }

    Duration::ZERO
}
