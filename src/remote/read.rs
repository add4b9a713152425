//! Remote-read client. One operation: a matcher-scoped read over the
//! trailing window, returning decoded series plus a sample count and the
//! query latency for the worker's self-metrics.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use prost::Message;

use crate::common::types::{Matcher, TimeSeries};
use crate::common::{current_time_millis, types};
use crate::error::{PsdError, PsdResult};
use crate::remote::chunk::{decode_xor_chunk, split_chunked_frames};
use crate::remote::metainfo::{base_url, MetaInfo};
use crate::remote::prompb;

pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

const CONTENT_TYPE_SAMPLES: &str = "application/x-protobuf";
const CONTENT_TYPE_STREAMED: &str =
    "application/x-streamed-protobuf; proto=prometheus.ChunkedReadResponse";

/// What a read returned: the merged series set, how many samples it carried
/// and how long the backend took to answer.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub series: Vec<TimeSeries>,
    pub sample_count: u64,
    pub elapsed: Duration,
}

/// The narrow read interface the downsample workers depend on; the concrete
/// client is HTTP, tests substitute a fake.
#[async_trait]
pub trait SeriesRead: Send + Sync {
    async fn read(&self, window: Duration, matchers: &[Matcher]) -> PsdResult<ReadOutcome>;

    /// `sample` or `stream`, used as the `remote_type` self-metric label.
    fn remote_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Sample,
    Stream,
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Sample => "sample",
            ReadMode::Stream => "stream",
        }
    }
}

pub struct RemoteReadClient {
    endpoints: Vec<String>,
    http: reqwest::Client,
    mode: ReadMode,
}

impl RemoteReadClient {
    /// Builds the client and settles the transport mode once: backends from
    /// 2.13.0 on are always read in stream mode, below that the configured
    /// preference holds.
    pub async fn connect(
        http: reqwest::Client,
        endpoints: Vec<String>,
        enabled_stream: bool,
    ) -> PsdResult<RemoteReadClient> {
        let first = endpoints
            .first()
            .ok_or_else(|| PsdError::InvalidConfiguration("remote_read_group is empty".into()))?;

        let meta = MetaInfo::fetch(&http, &base_url(first)?).await?;
        let mode = if enabled_stream || meta.supports_streamed_remote_read() {
            ReadMode::Stream
        } else {
            ReadMode::Sample
        };
        tracing::info!(version = %meta.version, mode = mode.as_str(), "remote read transport settled");

        Ok(RemoteReadClient {
            endpoints,
            http,
            mode,
        })
    }

    #[cfg(test)]
    pub fn with_mode(http: reqwest::Client, endpoints: Vec<String>, mode: ReadMode) -> Self {
        RemoteReadClient {
            endpoints,
            http,
            mode,
        }
    }

    fn build_request(&self, window: Duration, matchers: &[Matcher]) -> prompb::ReadRequest {
        let end = current_time_millis();
        let start = end - window.as_millis() as i64;

        let mut accepted = vec![prompb::read_request::ResponseType::Samples as i32];
        if self.mode == ReadMode::Stream {
            accepted.push(prompb::read_request::ResponseType::StreamedXorChunks as i32);
        }

        prompb::ReadRequest {
            queries: vec![prompb::Query {
                start_timestamp_ms: start,
                end_timestamp_ms: end,
                matchers: matchers.iter().map(prompb::LabelMatcher::from).collect(),
            }],
            accepted_response_types: accepted,
        }
    }

    async fn read_endpoint(
        &self,
        endpoint: &str,
        body: Vec<u8>,
    ) -> PsdResult<(Vec<TimeSeries>, u64)> {
        let response = self
            .http
            .post(endpoint)
            .timeout(READ_TIMEOUT)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-stream-protobuf")
            .header("X-Prometheus-Remote-Read-Version", "0.1.0")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let payload = response.bytes().await?;

        if content_type.starts_with(CONTENT_TYPE_SAMPLES) {
            decode_sample_response(&payload)
        } else if content_type.starts_with(CONTENT_TYPE_STREAMED) {
            decode_stream_response(&payload)
        } else {
            Err(PsdError::UnexpectedResponse(format!(
                "unknown remote read content type: {content_type}"
            )))
        }
    }
}

#[async_trait]
impl SeriesRead for RemoteReadClient {
    async fn read(&self, window: Duration, matchers: &[Matcher]) -> PsdResult<ReadOutcome> {
        let request = self.build_request(window, matchers);
        let mut body = Vec::with_capacity(request.encoded_len());
        request
            .encode(&mut body)
            .map_err(|e| PsdError::Encoding(format!("read request: {e}")))?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&body)
            .map_err(|e| PsdError::Encoding(format!("read request: {e}")))?;

        let started = Instant::now();
        let mut groups = Vec::with_capacity(self.endpoints.len());
        let mut sample_count = 0u64;
        for endpoint in &self.endpoints {
            let (series, count) = self.read_endpoint(endpoint, compressed.clone()).await?;
            sample_count += count;
            groups.push(series);
        }
        let elapsed = started.elapsed();

        Ok(ReadOutcome {
            series: merge_series(groups),
            sample_count,
            elapsed,
        })
    }

    fn remote_type(&self) -> &'static str {
        self.mode.as_str()
    }
}

fn decode_sample_response(payload: &[u8]) -> PsdResult<(Vec<TimeSeries>, u64)> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(payload)
        .map_err(|e| PsdError::Decoding(format!("read response: {e}")))?;
    let decoded = prompb::ReadResponse::decode(raw.as_slice())
        .map_err(|e| PsdError::Decoding(format!("read response: {e}")))?;

    let mut series = Vec::new();
    let mut sample_count = 0u64;
    for result in decoded.results {
        for ts in result.timeseries {
            if ts.samples.is_empty() {
                continue;
            }
            sample_count += ts.samples.len() as u64;
            series.push(types::TimeSeries::from(ts));
        }
    }
    Ok((series, sample_count))
}

fn decode_stream_response(payload: &[u8]) -> PsdResult<(Vec<TimeSeries>, u64)> {
    let mut series = Vec::new();
    let mut sample_count = 0u64;

    for frame in split_chunked_frames(payload)? {
        let decoded = prompb::ChunkedReadResponse::decode(frame)
            .map_err(|e| PsdError::Decoding(format!("chunked response: {e}")))?;
        for chunked in decoded.chunked_series {
            let labels = chunked
                .labels
                .into_iter()
                .map(|l| types::Label::new(l.name, l.value))
                .collect();
            let mut ts = TimeSeries::new(labels, Vec::new());

            for chunk in chunked.chunks {
                // only XOR chunks are understood; others are skipped
                if chunk.r#type != prompb::chunk::Encoding::Xor as i32 {
                    continue;
                }
                let samples = decode_xor_chunk(&chunk.data)?;
                sample_count += samples.len() as u64;
                ts.samples.extend(samples);
            }

            if !ts.samples.is_empty() {
                series.push(ts);
            }
        }
    }
    Ok((series, sample_count))
}

/// Merges per-endpoint result sets: series with identical label sets are
/// chained together, their points time-sorted with duplicate timestamps
/// dropped (first wins).
fn merge_series(groups: Vec<Vec<TimeSeries>>) -> Vec<TimeSeries> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: ahash::AHashMap<String, TimeSeries> = ahash::AHashMap::new();

    for group in groups {
        for ts in group {
            let key = ts.signature();
            match merged.get_mut(&key) {
                Some(existing) => existing.samples.extend(ts.samples),
                None => {
                    order.push(key.clone());
                    merged.insert(key, ts);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .map(|mut ts| {
            ts.samples.sort_by_key(|s| s.timestamp);
            ts.samples.dedup_by_key(|s| s.timestamp);
            ts
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Label, MatchOp, Sample};
    use crate::remote::chunk::{encode_chunked_frame, encode_xor_chunk};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn series(name: &str, samples: Vec<Sample>) -> TimeSeries {
        TimeSeries::new(vec![Label::new("__name__", name)], samples)
    }

    #[test]
    fn test_merge_series_chains_identical_labels() {
        let a = series("up", vec![Sample::new(1000, 1.0), Sample::new(3000, 3.0)]);
        let b = series("up", vec![Sample::new(2000, 2.0), Sample::new(3000, 9.0)]);
        let c = series("down", vec![Sample::new(1000, 0.0)]);

        let merged = merge_series(vec![vec![a], vec![b, c]]);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].samples,
            vec![
                Sample::new(1000, 1.0),
                Sample::new(2000, 2.0),
                Sample::new(3000, 3.0)
            ]
        );
        assert_eq!(merged[1].metric_name(), "down");
    }

    #[test]
    fn test_build_request_advertises_stream_when_enabled() {
        let client = RemoteReadClient::with_mode(
            reqwest::Client::new(),
            vec!["http://prom:9090/api/v1/read".into()],
            ReadMode::Stream,
        );
        let req = client.build_request(Duration::from_secs(300), &[]);
        assert_eq!(
            req.accepted_response_types,
            vec![
                prompb::read_request::ResponseType::Samples as i32,
                prompb::read_request::ResponseType::StreamedXorChunks as i32
            ]
        );
        let q = &req.queries[0];
        assert_eq!(q.end_timestamp_ms - q.start_timestamp_ms, 300_000);
    }

    fn sample_response_body(ts: Vec<prompb::TimeSeries>) -> Vec<u8> {
        let response = prompb::ReadResponse {
            results: vec![prompb::QueryResult { timeseries: ts }],
        };
        let mut raw = Vec::new();
        response.encode(&mut raw).unwrap();
        snap::raw::Encoder::new().compress_vec(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_read_sample_mode() {
        let server = MockServer::start().await;
        let body = sample_response_body(vec![prompb::TimeSeries {
            labels: vec![prompb::Label {
                name: "__name__".into(),
                value: "cpu".into(),
            }],
            samples: vec![
                prompb::Sample {
                    value: 1.0,
                    timestamp: 1000,
                },
                prompb::Sample {
                    value: 2.0,
                    timestamp: 2000,
                },
            ],
        }]);
        Mock::given(method("POST"))
            .and(path("/api/v1/read"))
            .and(header("Content-Encoding", "snappy"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", CONTENT_TYPE_SAMPLES)
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let client = RemoteReadClient::with_mode(
            reqwest::Client::new(),
            vec![format!("{}/api/v1/read", server.uri())],
            ReadMode::Sample,
        );
        let matchers = [Matcher::new(MatchOp::Equal, "__name__", "cpu")];
        let outcome = client
            .read(Duration::from_secs(60), &matchers)
            .await
            .unwrap();
        assert_eq!(outcome.sample_count, 2);
        assert_eq!(outcome.series.len(), 1);
        assert_eq!(outcome.series[0].metric_name(), "cpu");
    }

    #[tokio::test]
    async fn test_read_stream_mode() {
        let server = MockServer::start().await;
        let samples = vec![
            Sample::new(1000, 1.0),
            Sample::new(2000, 2.0),
            Sample::new(3000, 4.0),
        ];
        let frame_payload = {
            let response = prompb::ChunkedReadResponse {
                chunked_series: vec![prompb::ChunkedSeries {
                    labels: vec![prompb::Label {
                        name: "__name__".into(),
                        value: "cpu".into(),
                    }],
                    chunks: vec![
                        prompb::Chunk {
                            min_time_ms: 1000,
                            max_time_ms: 3000,
                            r#type: prompb::chunk::Encoding::Xor as i32,
                            data: encode_xor_chunk(&samples).unwrap(),
                        },
                        // unsupported encoding, skipped
                        prompb::Chunk {
                            min_time_ms: 0,
                            max_time_ms: 0,
                            r#type: prompb::chunk::Encoding::Histogram as i32,
                            data: vec![0xde, 0xad],
                        },
                    ],
                }],
                query_index: 0,
            };
            let mut raw = Vec::new();
            response.encode(&mut raw).unwrap();
            raw
        };
        Mock::given(method("POST"))
            .and(path("/api/v1/read"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", CONTENT_TYPE_STREAMED)
                    .set_body_bytes(encode_chunked_frame(&frame_payload)),
            )
            .mount(&server)
            .await;

        let client = RemoteReadClient::with_mode(
            reqwest::Client::new(),
            vec![format!("{}/api/v1/read", server.uri())],
            ReadMode::Stream,
        );
        let outcome = client.read(Duration::from_secs(60), &[]).await.unwrap();
        assert_eq!(outcome.sample_count, 3);
        assert_eq!(outcome.series[0].samples, samples);
    }
}
