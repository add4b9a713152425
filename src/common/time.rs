use std::time::Duration;

use crate::error::{PsdError, PsdResult};

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parses a `5m` / `1h30m` style duration as used by the `resolutions`
/// config entries.
pub fn parse_duration(s: &str) -> PsdResult<Duration> {
    humantime::parse_duration(s.trim()).map_err(|e| PsdError::InvalidDuration(format!("{s}: {e}")))
}

/// Formats whole seconds the way Go's `Duration.String()` does, which is the
/// form the backend accepts for `step` and `lookback_delta` parameters:
/// `90s` becomes `1m30s`, `300s` becomes `5m0s`, `3600s` becomes `1h0m0s`.
pub fn go_duration_string(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Formats a unix-seconds query parameter as RFC-3339 UTC with second
/// precision, e.g. `2024-03-01T12:00:00Z`.
pub fn format_query_time(unix_secs: f64) -> String {
    let secs = unix_secs as i64;
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => "1970-01-01T00:00:00Z".to_string(),
    }
}
