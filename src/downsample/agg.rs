//! The closed registry of aggregation functions applied to the points of a
//! trailing read window. Every function maps a sample slice to a single
//! value and returns 0 on empty input.

use std::fmt::{self, Display};
use std::str::FromStr;

use ahash::AHashMap;
use rand::Rng;

use crate::common::types::Sample;
use crate::error::PsdError;

/// One symbol per supported aggregation; dispatch is static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Median,
    Stddev,
    SumSq,
    First,
    Last,
    Random,
    Mode,
    Rate,
    P50,
    P90,
    P95,
    P99,
    P999,
}

impl Aggregation {
    pub const fn name(&self) -> &'static str {
        use Aggregation::*;
        match self {
            Sum => "sum",
            Avg => "avg",
            Count => "count",
            Min => "min",
            Max => "max",
            Median => "median",
            Stddev => "stddev",
            SumSq => "sumsq",
            First => "first",
            Last => "last",
            Random => "random",
            Mode => "mode",
            Rate => "rate",
            P50 => "p50",
            P90 => "p90",
            P95 => "p95",
            P99 => "p99",
            P999 => "p999",
        }
    }

    pub fn aggregate(&self, samples: &[Sample]) -> f64 {
        use Aggregation::*;
        match self {
            Sum => sum(samples),
            Avg => avg(samples),
            Count => count(samples),
            Min => min(samples),
            Max => max(samples),
            Median => median(samples),
            Stddev => stddev(samples),
            SumSq => sumsq(samples),
            First => first(samples),
            Last => last(samples),
            Random => random(samples),
            Mode => mode(samples),
            Rate => rate(samples),
            P50 => quantile(samples, 0.5),
            P90 => quantile(samples, 0.9),
            P95 => quantile(samples, 0.95),
            P99 => quantile(samples, 0.99),
            P999 => quantile(samples, 0.999),
        }
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Aggregation {
    type Err = PsdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Aggregation::*;
        match s {
            "sum" => Ok(Sum),
            "avg" => Ok(Avg),
            "count" => Ok(Count),
            "min" => Ok(Min),
            "max" => Ok(Max),
            "median" => Ok(Median),
            "stddev" => Ok(Stddev),
            "sumsq" => Ok(SumSq),
            "first" => Ok(First),
            "last" => Ok(Last),
            "random" => Ok(Random),
            "mode" => Ok(Mode),
            "rate" => Ok(Rate),
            "p50" => Ok(P50),
            "p90" => Ok(P90),
            "p95" => Ok(P95),
            "p99" => Ok(P99),
            "p999" => Ok(P999),
            _ => Err(PsdError::UnknownAggregation(s.to_string())),
        }
    }
}

fn sum(samples: &[Sample]) -> f64 {
    samples.iter().map(|s| s.value).sum()
}

fn avg(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    sum(samples) / samples.len() as f64
}

fn count(samples: &[Sample]) -> f64 {
    samples.len() as f64
}

fn min(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples
        .iter()
        .fold(f64::INFINITY, |acc, s| if s.value < acc { s.value } else { acc })
}

fn max(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples
        .iter()
        .fold(f64::NEG_INFINITY, |acc, s| if s.value > acc { s.value } else { acc })
}

/// Input order is time-ascending by construction of the reader, so `first`
/// and `last` are positional.
fn first(samples: &[Sample]) -> f64 {
    samples.first().map(|s| s.value).unwrap_or_default()
}

fn last(samples: &[Sample]) -> f64 {
    samples.last().map(|s| s.value).unwrap_or_default()
}

/// Change per millisecond between the first and the last point. Returns 0
/// for fewer than two points or a zero timespan.
fn rate(samples: &[Sample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let (head, tail) = (samples[0], samples[samples.len() - 1]);
    let elapsed = tail.timestamp - head.timestamp;
    if elapsed == 0 {
        return 0.0;
    }
    (tail.value - head.value) / elapsed as f64
}

fn sumsq(samples: &[Sample]) -> f64 {
    samples.iter().map(|s| s.value * s.value).sum()
}

/// Population standard deviation.
fn stddev(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean = avg(samples);
    let var = samples
        .iter()
        .map(|s| (s.value - mean) * (s.value - mean))
        .sum::<f64>()
        / samples.len() as f64;
    var.sqrt()
}

/// The most frequent value; ties keep the value seen earliest in the input.
fn mode(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut freq: AHashMap<u64, (usize, usize)> = AHashMap::with_capacity(samples.len());
    for (idx, s) in samples.iter().enumerate() {
        let entry = freq.entry(s.value.to_bits()).or_insert((0, idx));
        entry.0 += 1;
    }

    let mut best_count = 0usize;
    let mut best_seen = usize::MAX;
    let mut mode = 0.0;
    for (&bits, &(count, first_seen)) in freq.iter() {
        if count > best_count || (count == best_count && first_seen < best_seen) {
            best_count = count;
            best_seen = first_seen;
            mode = f64::from_bits(bits);
        }
    }
    mode
}

/// One value selected uniformly. The thread-local generator is freshly
/// seeded per thread, so invocations are not correlated.
fn random(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let idx = rand::thread_rng().gen_range(0..samples.len());
    samples[idx].value
}

/// Sorts a copy of the values; the shared sample slice is left untouched so
/// positional aggregations in the same tick still see time order.
fn sorted_values(samples: &[Sample]) -> Vec<f64> {
    let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    values.sort_by(f64::total_cmp);
    values
}

fn median(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let values = sorted_values(samples);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// The value at position `⌊q · n⌋` of the value-sorted input, `q ∈ [0,1)`.
fn quantile(samples: &[Sample], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let values = sorted_values(samples);
    let mut idx = (values.len() as f64 * q) as usize;
    if idx >= values.len() {
        idx = values.len() - 1;
    }
    values[idx]
}
