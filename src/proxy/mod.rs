//! Query-rewriting reverse proxy. Only `/api/v1/query` and
//! `/api/v1/query_range` are interpreted; everything else under `/api/v1/`
//! passes through to the backend untouched. `/metrics` and `POST /-/reload`
//! are served locally.

pub mod policy;
pub mod rewrite;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::common::{format_query_time, go_duration_string};
use crate::config::{ConfigHandle, Resolution};
use crate::error::{PsdError, PsdResult};
use crate::proxy::policy::pick_range_resolution;
use crate::proxy::rewrite::{
    rewrite_instant_query, rewrite_range_query, MetricProxyTable, RewriteOutcome,
};
use crate::remote::metainfo::MetaInfo;

const INSTANT_QUERY_PATH: &str = "query";
const RANGE_QUERY_PATH: &str = "query_range";

const INSTANT_Q: &str = "instant";
const RANGE_Q: &str = "range";

/// A reload request: the dispatcher answers on the enclosed channel.
pub type ReloadRequest = oneshot::Sender<PsdResult<()>>;

/// The bound query parameters shared by instant and range queries.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default)]
    pub step: Option<i64>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub timeout: Option<String>,
}

pub struct Proxy {
    state: Arc<ProxyState>,
}

struct ProxyState {
    backend: String,
    resolutions: Vec<Resolution>,
    table: Mutex<Arc<MetricProxyTable>>,
    supports_lookback_delta: bool,
    default_lookback_delta: Duration,
    http: reqwest::Client,
    config: Arc<ConfigHandle>,
    reload_tx: mpsc::Sender<ReloadRequest>,
    registry: Registry,
    proxy_total: IntCounter,
    proxy_downsample_total: IntCounterVec,
}

impl Proxy {
    /// Queries the backend's build info once; backends from 2.43.0 on get
    /// the widened `lookback_delta` parameter attached to rewritten range
    /// queries.
    pub async fn new(
        config: Arc<ConfigHandle>,
        reload_tx: mpsc::Sender<ReloadRequest>,
    ) -> PsdResult<Proxy> {
        let snapshot = config.get();
        let backend = snapshot
            .proxy_config
            .prometheus_addr
            .trim_end_matches('/')
            .to_string();
        if backend.is_empty() {
            return Err(PsdError::InvalidConfiguration(
                "proxy_config.prometheus_addr is empty".into(),
            ));
        }

        let http = reqwest::Client::new();
        let meta = MetaInfo::fetch(&http, &backend).await?;
        tracing::warn!(
            backend = %backend,
            version = %meta.version,
            lookback_delta = ?meta.lookback_delta,
            "proxy backend probed"
        );

        let registry = Registry::new();
        let proxy_total = IntCounter::with_opts(Opts::new(
            "psd_proxy_total",
            "The total number of requests to proxy",
        ))
        .map_err(|e| PsdError::General(e.to_string()))?;
        let proxy_downsample_total = IntCounterVec::new(
            Opts::new(
                "psd_proxy_downsample_total",
                "The total number of requests downsample to proxy",
            ),
            &["query_type"],
        )
        .map_err(|e| PsdError::General(e.to_string()))?;
        registry
            .register(Box::new(proxy_total.clone()))
            .map_err(|e| PsdError::General(e.to_string()))?;
        registry
            .register(Box::new(proxy_downsample_total.clone()))
            .map_err(|e| PsdError::General(e.to_string()))?;

        let table = MetricProxyTable::from_config(&snapshot.proxy_config.proxy_metrics);
        let state = ProxyState {
            backend,
            resolutions: snapshot.global_config.resolutions.sorted_by_time_range_desc(),
            table: Mutex::new(Arc::new(table)),
            supports_lookback_delta: meta.supports_lookback_delta(),
            default_lookback_delta: meta.lookback_delta,
            http,
            config,
            reload_tx,
            registry,
            proxy_total,
            proxy_downsample_total,
        };
        Ok(Proxy {
            state: Arc::new(state),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(handle_metrics))
            .route("/-/reload", post(handle_reload))
            .route("/api/v1/*path", any(handle_api))
            .with_state(Arc::clone(&self.state))
    }

    /// Swaps the metric table from the current config snapshot. In-flight
    /// requests finish with the table they already took.
    pub fn reload(&self) -> PsdResult<()> {
        let snapshot = self.state.config.get();
        let table = MetricProxyTable::from_config(&snapshot.proxy_config.proxy_metrics);
        match self.state.table.lock() {
            Ok(mut guard) => *guard = Arc::new(table),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(table),
        }
        tracing::warn!("reload proxy success");
        Ok(())
    }
}

impl ProxyState {
    fn current_table(&self) -> Arc<MetricProxyTable> {
        match self.table.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

async fn handle_metrics(State(state): State<Arc<ProxyState>>) -> Response {
    let encoder = TextEncoder::new();
    let mut out = Vec::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut out) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    ([("content-type", encoder.format_type().to_string())], out).into_response()
}

async fn handle_reload(State(state): State<Arc<ProxyState>>) -> Response {
    let (tx, rx) = oneshot::channel();
    if state.reload_tx.send(tx).await.is_err() {
        return reload_failed("reload dispatcher is gone");
    }
    match rx.await {
        Ok(Ok(())) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({"status": "reload success"})),
        )
            .into_response(),
        Ok(Err(err)) => reload_failed(&err.to_string()),
        Err(_) => reload_failed("reload dispatcher dropped the request"),
    }
}

fn reload_failed(reason: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({"status": format!("reload failed: {reason}")})),
    )
        .into_response()
}

async fn handle_api(
    State(state): State<Arc<ProxyState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    state.proxy_total.inc();

    if path != INSTANT_QUERY_PATH && path != RANGE_QUERY_PATH {
        return forward_raw(&state, &method, &path, &uri, &headers, body).await;
    }

    // Bind the common query parameters from the query string or form body.
    let raw_params = if method == Method::POST {
        String::from_utf8_lossy(&body).into_owned()
    } else {
        uri.query().unwrap_or_default().to_string()
    };
    let params: QueryParams = match serde_urlencoded::from_str(&raw_params) {
        Ok(params) => params,
        Err(err) => {
            tracing::error!(path = %path, error = %err, "bind query params error");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let table = state.current_table();
    let is_range = path == RANGE_QUERY_PATH;
    let outcome = if is_range {
        let span = Duration::from_secs_f64(
            (params.end.unwrap_or_default() - params.start.unwrap_or_default()).max(0.0),
        );
        match pick_range_resolution(&state.resolutions, span) {
            Some(resolution) => rewrite_range_query(&params.query, resolution, &table),
            None => RewriteOutcome {
                query: params.query.clone(),
                rewritten: false,
                lookback_interval: None,
            },
        }
    } else {
        rewrite_instant_query(&params.query, &state.resolutions, &table)
    };

    if outcome.rewritten {
        let query_type = if is_range { RANGE_Q } else { INSTANT_Q };
        state
            .proxy_downsample_total
            .with_label_values(&[query_type])
            .inc();
    }

    // Re-encode the parameters: times in RFC-3339, the step as a duration.
    let mut pairs: Vec<(&str, String)> = vec![("query", outcome.query)];
    if let Some(timeout) = &params.timeout {
        pairs.push(("timeout", timeout.clone()));
    }
    if is_range {
        if let Some(start) = params.start {
            pairs.push(("start", format_query_time(start)));
        }
        if let Some(end) = params.end {
            pairs.push(("end", format_query_time(end)));
        }
        if let Some(step) = params.step {
            pairs.push((
                "step",
                go_duration_string(Duration::from_secs(step.max(0) as u64)),
            ));
        }
        if let Some(interval) = outcome.lookback_interval {
            if state.supports_lookback_delta {
                let expanded = state.default_lookback_delta * 2;
                pairs.push(("lookback_delta", go_duration_string(expanded)));
                tracing::warn!(
                    from = %go_duration_string(state.default_lookback_delta),
                    to = %go_duration_string(expanded),
                    interval = %go_duration_string(interval),
                    "auto expanding lookback_delta"
                );
            }
        }
    } else if let Some(time) = params.time {
        pairs.push(("time", format_query_time(time)));
    }
    let encoded = match serde_urlencoded::to_string(&pairs) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::error!(error = %err, "encode query params error");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let url = format!("{}/api/v1/{}", state.backend, path);
    let request = if method == Method::POST {
        state
            .http
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(encoded)
    } else {
        state.http.get(format!("{url}?{encoded}"))
    };

    match request.send().await {
        Ok(response) => into_axum_response(response).await,
        Err(err) => {
            tracing::error!(error = %err, "proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Pass-through for every other `/api/v1/` path: same method, query string,
/// body and content headers against the backend host.
async fn forward_raw(
    state: &ProxyState,
    method: &Method,
    path: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let mut url = format!("{}/api/v1/{}", state.backend, path);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut request = state.http.request(method.clone(), url).body(body);
    for name in ["content-type", "accept", "authorization"] {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value.clone());
        }
    }

    match request.send().await {
        Ok(response) => into_axum_response(response).await,
        Err(err) => {
            tracing::error!(error = %err, "proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn into_axum_response(response: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for name in ["content-type", "content-encoding"] {
        if let Some(value) = response.headers().get(name) {
            builder = builder.header(name, value.clone());
        }
    }
    match response.bytes().await {
        Ok(bytes) => builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(err) => {
            tracing::error!(error = %err, "reading backend response failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::io::Write;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn proxy_fixture(backend: &MockServer) -> (Proxy, mpsc::Receiver<ReloadRequest>) {
        Mock::given(method("GET"))
            .and(path("/api/v1/status/buildinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success", "data": {"version": "2.45.0"}
            })))
            .mount(backend)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success", "data": {"query.lookback-delta": "5m"}
            })))
            .mount(backend)
            .await;

        let yaml = format!(
            r#"
global_config:
  resolutions: ["5m,1h", "20m,1d"]
proxy_config:
  listen_addr: 127.0.0.1:0
  prometheus_addr: {}
  proxy_metrics:
    - metric_name: cpu
      aggregation: avg
"#,
            backend.uri()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        let handle = Arc::new(config::ConfigHandle::load(file.path()).unwrap());
        // the tempfile may disappear, the handle already holds the snapshot
        file.close().unwrap();

        let (tx, rx) = mpsc::channel(4);
        let proxy = Proxy::new(handle, tx).await.unwrap();
        (proxy, rx)
    }

    #[tokio::test]
    async fn test_range_query_is_rewritten_and_forwarded() {
        let backend = MockServer::start().await;
        let (proxy, _rx) = proxy_fixture(&backend).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param(
                "query",
                rewrite_range_query(
                    "rate(cpu[2m])",
                    &"5m,1h".parse().unwrap(),
                    &MetricProxyTable::from_config(&[config::ProxyMetric {
                        metric_name: "cpu".into(),
                        aggregation: "avg".into(),
                    }]),
                )
                .query
                .as_str(),
            ))
            .and(query_param("start", "2024-03-01T12:00:00Z"))
            .and(query_param("end", "2024-03-01T13:30:00Z"))
            .and(query_param("step", "1m0s"))
            .and(query_param("lookback_delta", "10m0s"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/json")
                    .set_body_string(r#"{"status":"success"}"#),
            )
            .expect(1)
            .mount(&backend)
            .await;

        // span 90m, within the 5m,1h resolution
        let uri = format!(
            "/api/v1/query_range?query={}&start=1709294400&end=1709299800&step=60",
            urlencoding("rate(cpu[2m])")
        );
        let response = proxy
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_api_paths_pass_through() {
        let backend = MockServer::start().await;
        let (proxy, _rx) = proxy_fixture(&backend).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"success"}"#))
            .expect(1)
            .mount(&backend)
            .await;

        let response = proxy
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/api/v1/labels?match[]=cpu")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_counts_requests() {
        let backend = MockServer::start().await;
        let (proxy, _rx) = proxy_fixture(&backend).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/labels"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&backend)
            .await;

        let router = proxy.router();
        let _ = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/labels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("psd_proxy_total 1"));
    }

    #[tokio::test]
    async fn test_reload_endpoint_round_trip() {
        let backend = MockServer::start().await;
        let (proxy, mut rx) = proxy_fixture(&backend).await;

        let router = proxy.router();
        let dispatcher = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let _ = request.send(Ok(()));
        });

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/-/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        dispatcher.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"status":"reload success"}"#);
    }

    fn urlencoding(s: &str) -> String {
        serde_urlencoded::to_string([("q", s)])
            .unwrap()
            .trim_start_matches("q=")
            .to_string()
    }
}
