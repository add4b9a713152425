//! Backend build-info and flags lookup. Supplies the version gates for
//! streamed remote read (>= 2.13.0) and dynamic lookback-delta (>= 2.43.0)
//! plus the backend's configured default lookback delta.

use std::time::Duration;

use semver::Version;
use serde::Deserialize;

use crate::common::parse_duration;
use crate::error::{PsdError, PsdResult};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOOKBACK_DELTA: Duration = Duration::from_secs(5 * 60);

const LOOKBACK_DELTA_FLAG: &str = "query.lookback-delta";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[allow(dead_code)]
    status: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct BuildInfo {
    version: String,
}

#[derive(Debug, Clone)]
pub struct MetaInfo {
    pub version: String,
    pub lookback_delta: Duration,
}

impl MetaInfo {
    /// Fetches `/api/v1/status/buildinfo` and `/api/v1/status/flags` from the
    /// backend at `base` (scheme://host[:port]).
    pub async fn fetch(client: &reqwest::Client, base: &str) -> PsdResult<MetaInfo> {
        let base = base.trim_end_matches('/');

        let buildinfo: ApiResponse<BuildInfo> = client
            .get(format!("{base}/api/v1/status/buildinfo"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let flags: ApiResponse<ahash::AHashMap<String, String>> = client
            .get(format!("{base}/api/v1/status/flags"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let lookback_delta = match flags.data.get(LOOKBACK_DELTA_FLAG) {
            Some(raw) => parse_duration(raw).unwrap_or_else(|_| {
                tracing::warn!(flag = %raw, "unparseable lookback-delta flag, using default");
                DEFAULT_LOOKBACK_DELTA
            }),
            None => DEFAULT_LOOKBACK_DELTA,
        };

        Ok(MetaInfo {
            version: buildinfo.data.version,
            lookback_delta,
        })
    }

    fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        match Version::parse(self.version.trim_start_matches('v')) {
            Ok(v) => v >= Version::new(major, minor, patch),
            Err(_) => false,
        }
    }

    /// Streamed XOR-chunk remote read is always advertised from 2.13.0 on.
    pub fn supports_streamed_remote_read(&self) -> bool {
        self.at_least(2, 13, 0)
    }

    /// The `lookback_delta` query parameter is accepted from 2.43.0 on.
    pub fn supports_lookback_delta(&self) -> bool {
        self.at_least(2, 43, 0)
    }
}

/// Strips path and query from an endpoint url, leaving `scheme://host[:port]`.
pub fn base_url(endpoint: &str) -> PsdResult<String> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| PsdError::InvalidUrl(format!("{endpoint}: {e}")))?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: &str) -> MetaInfo {
        MetaInfo {
            version: version.to_string(),
            lookback_delta: DEFAULT_LOOKBACK_DELTA,
        }
    }

    #[test]
    fn test_version_gates() {
        assert!(!info("2.12.0").supports_streamed_remote_read());
        assert!(info("2.13.0").supports_streamed_remote_read());
        assert!(info("2.45.1").supports_streamed_remote_read());

        assert!(!info("2.42.9").supports_lookback_delta());
        assert!(info("2.43.0").supports_lookback_delta());
        assert!(info("v2.50.0").supports_lookback_delta());

        // unparseable versions gate everything off
        assert!(!info("next").supports_lookback_delta());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            base_url("http://prom:9090/api/v1/read").unwrap(),
            "http://prom:9090"
        );
        assert_eq!(base_url("https://prom.example.com/").unwrap(), "https://prom.example.com");
        assert!(base_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_fetch() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status/buildinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"version": "2.45.0", "revision": "deadbeef"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"query.lookback-delta": "5m", "query.timeout": "2m"}
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let meta = MetaInfo::fetch(&client, &server.uri()).await.unwrap();
        assert_eq!(meta.version, "2.45.0");
        assert_eq!(meta.lookback_delta, Duration::from_secs(300));
        assert!(meta.supports_streamed_remote_read());
        assert!(meta.supports_lookback_delta());
    }
}
