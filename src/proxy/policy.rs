//! Resolution policy: which downsampling resolution, if any, should serve a
//! query. Candidates are iterated from the coarsest eligibility range down,
//! so the coarsest adequate resolution wins.

use std::time::Duration;

use crate::config::Resolution;

/// Range queries qualify on the queried span: the first resolution whose
/// `time_range` is below the span is chosen.
pub fn pick_range_resolution(
    resolutions_desc: &[Resolution],
    span: Duration,
) -> Option<&Resolution> {
    resolutions_desc.iter().find(|r| span > r.time_range)
}

/// Instant queries qualify per matrix selector on its range window: the
/// first resolution whose `sample_interval` is below the window is chosen.
pub fn pick_instant_resolution(
    resolutions_desc: &[Resolution],
    window: Duration,
) -> Option<&Resolution> {
    resolutions_desc.iter().find(|r| window > r.sample_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolutions() -> Vec<Resolution> {
        // sorted descending by time_range, as the proxy holds them
        vec!["20m,1d".parse().unwrap(), "5m,1h".parse().unwrap()]
    }

    #[test]
    fn test_pick_range_resolution() {
        let rs = resolutions();
        // 90m span: only the 1h range is below it
        let r = pick_range_resolution(&rs, Duration::from_secs(90 * 60)).unwrap();
        assert_eq!(r.interval_text, "5m");

        // 2d span: the 1d range wins first
        let r = pick_range_resolution(&rs, Duration::from_secs(2 * 86400)).unwrap();
        assert_eq!(r.interval_text, "20m");

        // spans at or below every range select nothing
        assert!(pick_range_resolution(&rs, Duration::from_secs(3600)).is_none());
        assert!(pick_range_resolution(&rs, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_pick_instant_resolution() {
        let rs = resolutions();
        // a 30m window fits the 20m interval
        let r = pick_instant_resolution(&rs, Duration::from_secs(30 * 60)).unwrap();
        assert_eq!(r.interval_text, "20m");

        // a 10m window only fits the 5m interval
        let r = pick_instant_resolution(&rs, Duration::from_secs(10 * 60)).unwrap();
        assert_eq!(r.interval_text, "5m");

        assert!(pick_instant_resolution(&rs, Duration::from_secs(60)).is_none());
    }
}
