//! Configuration file loading, validation and reload. The running
//! configuration is an immutable snapshot behind a read/write lock; reload
//! parses the file again and swaps the snapshot, leaving the old one in
//! place when anything is wrong.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::common::types::{Matcher, MatchOp};
use crate::common::{parse_duration, METRIC_NAME_LABEL};
use crate::error::{PsdError, PsdResult};

pub const DEFAULT_CONFIG_PATH: &str = "./prom-stream-downsample.yaml";

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global_config: GlobalConfig,
    #[serde(default)]
    pub downsample_config: Vec<DownsampleJob>,
    #[serde(default)]
    pub proxy_config: ProxyConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub enabled_stream: bool,
    #[serde(default)]
    pub enabled_proxy: bool,
    #[serde(default)]
    pub enabled_downsample: bool,
    #[serde(default)]
    pub enabled_metric_reuse: bool,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub resolutions: Resolutions,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub remote_read_group: Vec<String>,
    #[serde(default)]
    pub remote_write_url: String,
}

/// One downsampling resolution: the sample interval drives both the worker
/// cadence and the read window; the time range is the minimum query span at
/// which the proxy considers the resolution eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The interval exactly as written in the config (`5m`), reused verbatim
    /// inside mangled metric names.
    pub interval_text: String,
    pub sample_interval: Duration,
    pub time_range: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolutions(pub Vec<Resolution>);

impl Resolutions {
    /// Ascending by sample interval; the worker cascade relies on this order.
    pub fn sorted_by_interval(&self) -> Vec<Resolution> {
        let mut rs = self.0.clone();
        rs.sort_by_key(|r| r.sample_interval);
        rs
    }

    /// Descending by time range; the proxy's resolution policy iterates this.
    pub fn sorted_by_time_range_desc(&self) -> Vec<Resolution> {
        let mut rs = self.0.clone();
        rs.sort_by(|a, b| b.time_range.cmp(&a.time_range));
        rs
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Resolution {
    type Err = PsdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 2 {
            return Err(PsdError::InvalidConfiguration(format!(
                "invalid resolution format, must be like 1m,1h: {s}"
            )));
        }
        Ok(Resolution {
            interval_text: parts[0].trim().to_string(),
            sample_interval: parse_duration(parts[0])?,
            time_range: parse_duration(parts[1])?,
        })
    }
}

impl<'de> Deserialize<'de> for Resolutions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        let mut rs = Vec::with_capacity(raw.len());
        for entry in raw {
            rs.push(entry.parse().map_err(serde::de::Error::custom)?);
        }
        Ok(Resolutions(rs))
    }
}

#[derive(Debug, Deserialize)]
struct RawMatcher {
    #[serde(default)]
    matcher_type: Option<String>,
    #[serde(default)]
    label_name: Option<String>,
    label_value: String,
}

#[derive(Debug, Deserialize)]
struct RawDownsampleJob {
    #[serde(default)]
    job_name: String,
    #[serde(default)]
    matchers: Vec<RawMatcher>,
    #[serde(default)]
    aggregations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownsampleJob {
    pub job_name: String,
    pub matchers: Vec<Matcher>,
    pub aggregations: Vec<String>,
}

impl TryFrom<RawDownsampleJob> for DownsampleJob {
    type Error = PsdError;

    fn try_from(raw: RawDownsampleJob) -> Result<Self, Self::Error> {
        if raw.matchers.is_empty() {
            return Err(PsdError::InvalidConfiguration(
                "matchers can not be empty".into(),
            ));
        }

        let mut matchers = Vec::with_capacity(raw.matchers.len());
        let mut all_negative = true;
        for m in raw.matchers {
            let op = match m.matcher_type.as_deref() {
                None | Some("") => MatchOp::Equal,
                Some(t) => t
                    .parse::<MatchOp>()
                    .map_err(PsdError::InvalidConfiguration)?,
            };
            let name = match m.label_name.as_deref() {
                None | Some("") => METRIC_NAME_LABEL.to_string(),
                Some(n) => n.to_string(),
            };

            // A negated __name__ matcher can never select the downsampled
            // series it produces; the backend rejects all-negative selectors.
            if name == METRIC_NAME_LABEL && op.is_negative() {
                return Err(PsdError::InvalidConfiguration(
                    "can not match __name__ with != or !~".into(),
                ));
            }
            if !op.is_negative() {
                all_negative = false;
            }
            matchers.push(Matcher::new(op, name, m.label_value));
        }
        if all_negative {
            return Err(PsdError::InvalidConfiguration(
                "matchers can not be all negative".into(),
            ));
        }

        let aggregations = if raw.aggregations.is_empty() {
            vec!["avg".to_string()]
        } else {
            raw.aggregations
        };

        Ok(DownsampleJob {
            job_name: raw.job_name,
            matchers,
            aggregations,
        })
    }
}

impl<'de> Deserialize<'de> for DownsampleJob {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawDownsampleJob::deserialize(deserializer)?;
        DownsampleJob::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub prometheus_addr: String,
    #[serde(default)]
    pub proxy_metrics: Vec<ProxyMetric>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyMetric {
    pub metric_name: String,
    pub aggregation: String,
}

/// The loaded configuration plus the path it came from. Readers take the
/// current snapshot by value; reload swaps it atomically.
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn load(path: impl AsRef<Path>) -> PsdResult<ConfigHandle> {
        let path = path.as_ref().to_path_buf();
        let config = load_file(&path)?;
        Ok(ConfigHandle {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn get(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-reads the file; on any error the running snapshot stays in place.
    pub fn reload(&self) -> PsdResult<()> {
        let config = load_file(&self.path)?;
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
        Ok(())
    }
}

fn load_file(path: &Path) -> PsdResult<Config> {
    let bytes = std::fs::read(path)?;
    parse(&bytes)
}

pub fn parse(bytes: &[u8]) -> PsdResult<Config> {
    serde_yaml::from_slice(bytes).map_err(|e| PsdError::InvalidConfiguration(e.to_string()))
}
