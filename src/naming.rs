//! The metric-name mangling scheme shared by the downsampler and the proxy.
//! Both sides must agree on it bit-for-bit: a raw metric `up` downsampled at
//! resolution `5m` with aggregation `sum` is stored as `up:downsample_5m_sum`.

use crate::common::types::Label;
use crate::common::METRIC_NAME_LABEL;

/// Reserved infix; raw ingestion must never contain it.
pub static DOWNSAMPLE_INFIX: &str = ":downsample_";

/// Matches any already-downsampled metric name.
pub static DOWNSAMPLE_METRIC_PATTERN: &str = ".+:downsample_.+";

/// Matrix ranges are widened to this multiple of the sample interval so
/// rate-style functions always see at least two points.
pub const EXTRAPOLATED_MULTIPLE: u32 = 4;

/// Returns `<metric>:downsample_<interval>_<agg>`.
pub fn mangle(metric: &str, interval: &str, agg: &str) -> String {
    format!("{metric}{DOWNSAMPLE_INFIX}{interval}_{agg}")
}

/// Returns the bare `:downsample_<interval>_<agg>` suffix.
pub fn downsample_suffix(interval: &str, agg: &str) -> String {
    format!("{DOWNSAMPLE_INFIX}{interval}_{agg}")
}

/// Moves an already-mangled name one resolution up:
/// `up:downsample_5m_sum` with prev `5m`, curr `20m` becomes
/// `up:downsample_20m_sum`. Exactly one replacement must occur.
pub fn recascade(mangled: &str, prev_interval: &str, curr_interval: &str, agg: &str) -> String {
    let from = format!("_{prev_interval}_{agg}");
    let to = format!("_{curr_interval}_{agg}");
    debug_assert_eq!(
        mangled.matches(&from).count(),
        1,
        "recascade expects exactly one `{from}` in `{mangled}`"
    );
    mangled.replacen(&from, &to, 1)
}

/// Rebuilds a series label set with `__name__` mangled for the given
/// resolution and aggregation. With `prev_interval` set the series is an
/// already-downsampled one and only the interval part moves.
pub fn mangle_series_labels(
    labels: &[Label],
    prev_interval: Option<&str>,
    curr_interval: &str,
    agg: &str,
) -> Vec<Label> {
    labels
        .iter()
        .map(|label| {
            if label.name != METRIC_NAME_LABEL {
                return label.clone();
            }
            let metric = match prev_interval {
                None => mangle(&label.value, curr_interval, agg),
                Some(prev) => recascade(&label.value, prev, curr_interval, agg),
            };
            Label::new(METRIC_NAME_LABEL, metric)
        })
        .collect()
}
