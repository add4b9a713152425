use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::METRIC_NAME_LABEL;

/// Label is a key/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Label {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single raw or aggregated point, ordered by timestamp within a series.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Sample {
        Sample { timestamp, value }
    }
}

/// TimeSeries is the basic entity returned by remote read and handed to
/// remote write. Identity is the label set; `__name__` carries the metric name.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

const LABEL_SEP: char = '\u{f8ff}';

impl TimeSeries {
    pub fn new(labels: Vec<Label>, samples: Vec<Sample>) -> TimeSeries {
        TimeSeries { labels, samples }
    }

    /// Returns the given label value, or the empty string when missing.
    pub fn label(&self, name: &str) -> &str {
        for l in self.labels.iter() {
            if l.name == name {
                return &l.value;
            }
        }
        ""
    }

    pub fn metric_name(&self) -> &str {
        self.label(METRIC_NAME_LABEL)
    }

    /// A canonical key over the label set, insensitive to insertion order.
    pub fn signature(&self) -> String {
        let mut pairs: Vec<&Label> = self.labels.iter().collect();
        pairs.sort();
        let mut out = String::with_capacity(self.labels.len() * 16);
        for l in pairs {
            out.push_str(&l.name);
            out.push(LABEL_SEP);
            out.push_str(&l.value);
            out.push(LABEL_SEP);
        }
        out
    }
}

/// Matcher kind, spelled the way the config file and PromQL spell them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    #[default]
    Equal,
    NotEqual,
    Re,
    NotRe,
}

impl MatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Re => "=~",
            MatchOp::NotRe => "!~",
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, MatchOp::NotEqual | MatchOp::NotRe)
    }
}

impl Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(MatchOp::Equal),
            "!=" => Ok(MatchOp::NotEqual),
            "=~" => Ok(MatchOp::Re),
            "!~" => Ok(MatchOp::NotRe),
            _ => Err(format!("unknown matcher type: {}", s)),
        }
    }
}

/// A single label matcher of a series selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Matcher {
    pub op: MatchOp,
    pub name: String,
    pub value: String,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Matcher {
        Matcher {
            op,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_metric_name(&self) -> bool {
        self.name == METRIC_NAME_LABEL
    }
}

impl Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, self.op, self.value)
    }
}

/// Canonical `name+op+value,...` join of a matcher set, used as the
/// `matcher` label of the read self-metrics.
pub fn canonical_matchers(matchers: &[Matcher]) -> String {
    matchers
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_signature_ignores_label_order() {
        let a = TimeSeries::new(
            vec![Label::new("__name__", "up"), Label::new("job", "node")],
            vec![],
        );
        let b = TimeSeries::new(
            vec![Label::new("job", "node"), Label::new("__name__", "up")],
            vec![],
        );
        assert_eq!(a.signature(), b.signature());

        let c = TimeSeries::new(
            vec![Label::new("job", "node2"), Label::new("__name__", "up")],
            vec![],
        );
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_canonical_matchers() {
        let ms = vec![
            Matcher::new(MatchOp::Equal, "__name__", "cpu"),
            Matcher::new(MatchOp::NotRe, "instance", ".+:9100"),
        ];
        assert_eq!(canonical_matchers(&ms), "__name__=cpu,instance!~.+:9100");
    }

    #[test]
    fn test_match_op_round_trip() {
        for op in [MatchOp::Equal, MatchOp::NotEqual, MatchOp::Re, MatchOp::NotRe] {
            assert_eq!(op.as_str().parse::<MatchOp>().unwrap(), op);
        }
        assert!("==".parse::<MatchOp>().is_err());
    }
}
