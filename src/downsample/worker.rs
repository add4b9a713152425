//! One worker per (job, resolution): a periodic tick that pulls the trailing
//! window from remote read, aggregates each returned series and pushes the
//! mangled results onto the shared write channel.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::common::types::{canonical_matchers, Label, Matcher, MatchOp, Sample, TimeSeries};
use crate::common::{current_time_millis, METRIC_NAME_LABEL};
use crate::config::Resolution;
use crate::downsample::agg::Aggregation;
use crate::naming::{downsample_suffix, mangle_series_labels, DOWNSAMPLE_METRIC_PATTERN};
use crate::remote::read::{ReadOutcome, SeriesRead};
use crate::remote::write::{Batch, BufferPool, BATCH_CAPACITY};

const SAMPLES_COUNT_METRIC: &str = "psd_remote_read_matcher_samples_count";
const QUERY_TIME_METRIC: &str = "psd_remote_read_query_time_seconds";

const MAX_START_JITTER_SECS: u64 = 5;

pub struct DownsampleWorker {
    pub(crate) job_name: String,
    pub(crate) matchers: Vec<Matcher>,
    pub(crate) aggregations: Vec<Aggregation>,
    pub(crate) resolutions: Arc<Vec<Resolution>>,
    pub(crate) resolution_idx: usize,
    pub(crate) metric_reuse: bool,
    pub(crate) reader: Arc<dyn SeriesRead>,
    pub(crate) tx: async_channel::Sender<Batch>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) buffer: Batch,
}

impl DownsampleWorker {
    fn resolution(&self) -> &Resolution {
        &self.resolutions[self.resolution_idx]
    }

    /// The periodic loop. Each round sleeps a random 0-5 s first so the
    /// workers do not hit the backend in lockstep.
    pub async fn run(mut self) {
        let interval = self.resolution().sample_interval;
        loop {
            let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..MAX_START_JITTER_SECS));
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(jitter) => {}
            }

            self.tick().await;

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn tick(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }

        // The first resolution always reads raw data, coarser ones reuse the
        // previous resolution's output when metric reuse is on.
        if !self.metric_reuse || self.resolution_idx == 0 {
            self.downsample_raw().await;
        } else {
            self.downsample_cascade().await;
        }
        self.submit();
    }

    async fn downsample_raw(&mut self) {
        let resolution = self.resolution().clone();
        let now = current_time_millis();
        let matchers = self.raw_matchers();

        let outcome = match self.reader.read(resolution.sample_interval, &matchers).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(job = %self.job_name, error = %err, "remote read error");
                return;
            }
        };

        self.append_read_stats(&outcome, now, &matchers, &resolution.interval_text);
        if outcome.sample_count == 0 {
            return;
        }

        let aggregations = self.aggregations.clone();
        for series in &outcome.series {
            if self.cancel.is_cancelled() {
                return;
            }
            let timestamp = aggregate_timestamp(&series.samples);
            for agg in &aggregations {
                let labels =
                    mangle_series_labels(&series.labels, None, &resolution.interval_text, agg.name());
                let value = agg.aggregate(&series.samples);
                self.append(TimeSeries::new(labels, vec![Sample::new(timestamp, value)]));
            }
        }
    }

    async fn downsample_cascade(&mut self) {
        let resolution = self.resolution().clone();
        let previous = self.resolutions[self.resolution_idx - 1].clone();
        let now = current_time_millis();

        // The matcher set is aggregation-specific, so the cascade path reads
        // once per aggregation.
        let aggregations = self.aggregations.clone();
        for agg in aggregations {
            if self.cancel.is_cancelled() {
                return;
            }

            let matchers = self.cascade_matchers(&previous.interval_text, agg.name());
            let outcome = match self.reader.read(resolution.sample_interval, &matchers).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(job = %self.job_name, error = %err, "remote read error");
                    continue;
                }
            };

            self.append_read_stats(&outcome, now, &matchers, &resolution.interval_text);
            if outcome.sample_count == 0 {
                continue;
            }

            for series in &outcome.series {
                let labels = mangle_series_labels(
                    &series.labels,
                    Some(&previous.interval_text),
                    &resolution.interval_text,
                    agg.name(),
                );
                let value = agg.aggregate(&series.samples);
                let timestamp = aggregate_timestamp(&series.samples);
                self.append(TimeSeries::new(labels, vec![Sample::new(timestamp, value)]));
            }
        }
    }

    /// Raw reads exclude every already-downsampled series.
    pub(crate) fn raw_matchers(&self) -> Vec<Matcher> {
        let mut matchers = Vec::with_capacity(self.matchers.len() + 1);
        matchers.extend(self.matchers.iter().cloned());
        matchers.push(Matcher::new(
            MatchOp::NotRe,
            METRIC_NAME_LABEL,
            DOWNSAMPLE_METRIC_PATTERN,
        ));
        matchers
    }

    /// Rewrites the job's matcher set to select the previous resolution's
    /// output for the given aggregation. The `__name__` matcher (injected
    /// when absent) goes last; negated `__name__` kinds were rejected at
    /// config load and cannot appear here.
    pub(crate) fn cascade_matchers(&self, prev_interval: &str, agg: &str) -> Vec<Matcher> {
        let suffix = downsample_suffix(prev_interval, agg);
        let mut matchers = Vec::with_capacity(self.matchers.len() + 1);
        let mut name_matcher: Option<&Matcher> = None;
        for m in &self.matchers {
            if m.is_metric_name() {
                name_matcher = Some(m);
            } else {
                matchers.push(m.clone());
            }
        }

        let expanded = match name_matcher {
            // {app="game"} -> {app="game",__name__=~".*:downsample_5m_avg"}
            None => Matcher::new(MatchOp::Re, METRIC_NAME_LABEL, format!(".*{suffix}")),
            Some(m) if m.op == MatchOp::Re => {
                // every |-alternative gets the suffix:
                // {__name__=~"abc|def"} -> {__name__=~"abc:downsample_5m_avg|def:downsample_5m_avg"}
                let value = m
                    .value
                    .split('|')
                    .map(|alt| format!("{alt}{suffix}"))
                    .collect::<Vec<_>>()
                    .join("|");
                Matcher::new(MatchOp::Re, METRIC_NAME_LABEL, value)
            }
            // {__name__="abc"} -> {__name__="abc:downsample_5m_avg"}
            Some(m) => Matcher::new(m.op, METRIC_NAME_LABEL, format!("{}{suffix}", m.value)),
        };
        matchers.push(expanded);
        matchers
    }

    /// The two meta series recorded after every read, in front of the
    /// aggregates produced from it.
    fn append_read_stats(
        &mut self,
        outcome: &ReadOutcome,
        timestamp: i64,
        matchers: &[Matcher],
        interval_text: &str,
    ) {
        let matcher = canonical_matchers(matchers);
        let remote_type = self.reader.remote_type();

        self.append(TimeSeries::new(
            vec![
                Label::new(METRIC_NAME_LABEL, SAMPLES_COUNT_METRIC),
                Label::new("remote_type", remote_type),
                Label::new("matcher", matcher.clone()),
            ],
            vec![Sample::new(timestamp, outcome.sample_count as f64)],
        ));
        self.append(TimeSeries::new(
            vec![
                Label::new(METRIC_NAME_LABEL, QUERY_TIME_METRIC),
                Label::new("remote_type", remote_type),
                Label::new("matcher", matcher),
                Label::new("query_range", interval_text),
            ],
            vec![Sample::new(timestamp, outcome.elapsed.as_secs_f64())],
        ));
    }

    fn append(&mut self, series: TimeSeries) {
        self.buffer.push(series);
        if self.buffer.len() >= BATCH_CAPACITY {
            self.submit();
        }
    }

    /// Non-blocking hand-off to the write channel. A full channel drops the
    /// batch: that is the back-pressure contract under overload.
    fn submit(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, self.pool.get());
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(batch)) => {
                tracing::warn!(
                    job = %self.job_name,
                    series = batch.len(),
                    "write channel full, dropping batch"
                );
                self.pool.put(batch);
            }
            Err(async_channel::TrySendError::Closed(batch)) => {
                self.pool.put(batch);
            }
        }
    }
}

/// The output timestamp of an aggregated window: the median input timestamp,
/// averaging the two central ones on even length.
pub fn aggregate_timestamp(samples: &[Sample]) -> i64 {
    if samples.is_empty() {
        return 0;
    }
    let middle = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[middle - 1].timestamp + samples[middle].timestamp) / 2
    } else {
        samples[middle].timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PsdResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Canned read results, in the style of a fake datasource.
    pub(crate) struct FakeReader {
        pub results: Mutex<Vec<ReadOutcome>>,
        pub seen_matchers: Mutex<Vec<Vec<Matcher>>>,
    }

    impl FakeReader {
        pub fn new(results: Vec<ReadOutcome>) -> Arc<Self> {
            Arc::new(FakeReader {
                results: Mutex::new(results),
                seen_matchers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SeriesRead for FakeReader {
        async fn read(&self, _window: Duration, matchers: &[Matcher]) -> PsdResult<ReadOutcome> {
            self.seen_matchers.lock().unwrap().push(matchers.to_vec());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(ReadOutcome::default())
            } else {
                Ok(results.remove(0))
            }
        }

        fn remote_type(&self) -> &'static str {
            "sample"
        }
    }

    fn resolutions() -> Arc<Vec<Resolution>> {
        Arc::new(vec![
            "5m,1h".parse().unwrap(),
            "20m,1d".parse().unwrap(),
        ])
    }

    fn worker(
        reader: Arc<dyn SeriesRead>,
        tx: async_channel::Sender<Batch>,
        idx: usize,
        reuse: bool,
        aggregations: &[&str],
    ) -> DownsampleWorker {
        DownsampleWorker {
            job_name: "cpu".into(),
            matchers: vec![Matcher::new(MatchOp::Equal, "__name__", "cpu")],
            aggregations: aggregations.iter().map(|a| a.parse().unwrap()).collect(),
            resolutions: resolutions(),
            resolution_idx: idx,
            metric_reuse: reuse,
            reader,
            tx,
            pool: Arc::new(BufferPool::default()),
            cancel: CancellationToken::new(),
            buffer: Vec::new(),
        }
    }

    fn cpu_series() -> TimeSeries {
        TimeSeries::new(
            vec![
                Label::new("__name__", "cpu"),
                Label::new("instance", "host-1"),
            ],
            vec![
                Sample::new(0, 1.0),
                Sample::new(60_000, 2.0),
                Sample::new(120_000, 3.0),
                Sample::new(180_000, 4.0),
                Sample::new(240_000, 5.0),
            ],
        )
    }

    #[test]
    fn test_aggregate_timestamp_median() {
        let odd = cpu_series();
        assert_eq!(aggregate_timestamp(&odd.samples), 120_000);

        let even = vec![
            Sample::new(0, 1.0),
            Sample::new(10_000, 1.0),
            Sample::new(30_000, 1.0),
            Sample::new(40_000, 1.0),
        ];
        assert_eq!(aggregate_timestamp(&even), 20_000);
    }

    #[test]
    fn test_raw_matchers_exclude_downsampled_series() {
        let (tx, _rx) = async_channel::bounded(4);
        let w = worker(FakeReader::new(vec![]), tx, 0, false, &["avg"]);
        let ms = w.raw_matchers();
        assert_eq!(
            ms.last().unwrap(),
            &Matcher::new(MatchOp::NotRe, "__name__", ".+:downsample_.+")
        );
        assert_eq!(ms[0].value, "cpu");
    }

    #[test]
    fn test_cascade_matchers() {
        let (tx, _rx) = async_channel::bounded(4);
        let mut w = worker(FakeReader::new(vec![]), tx, 1, true, &["avg"]);

        // equality matcher gets the plain suffix
        assert_eq!(
            w.cascade_matchers("5m", "avg"),
            vec![Matcher::new(MatchOp::Equal, "__name__", "cpu:downsample_5m_avg")]
        );

        // regex matcher: every alternative is suffixed
        w.matchers = vec![Matcher::new(MatchOp::Re, "__name__", "cpu|mem")];
        assert_eq!(
            w.cascade_matchers("5m", "avg")[0],
            Matcher::new(
                MatchOp::Re,
                "__name__",
                "cpu:downsample_5m_avg|mem:downsample_5m_avg"
            )
        );

        // no __name__ matcher: one is injected after the others
        w.matchers = vec![Matcher::new(MatchOp::Equal, "app", "game")];
        assert_eq!(
            w.cascade_matchers("5m", "avg"),
            vec![
                Matcher::new(MatchOp::Equal, "app", "game"),
                Matcher::new(MatchOp::Re, "__name__", ".*:downsample_5m_avg"),
            ]
        );
    }

    #[tokio::test]
    async fn test_tick_aggregates_and_mangles() {
        let reader = FakeReader::new(vec![ReadOutcome {
            series: vec![cpu_series()],
            sample_count: 5,
            elapsed: Duration::from_millis(20),
        }]);
        let (tx, rx) = async_channel::bounded(4);
        let mut w = worker(reader, tx, 0, false, &["avg", "max"]);
        w.tick().await;

        let batch = rx.try_recv().unwrap();
        // self-metrics first, then one series per aggregation
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].metric_name(), SAMPLES_COUNT_METRIC);
        assert_eq!(batch[0].label("remote_type"), "sample");
        assert_eq!(batch[0].samples[0].value, 5.0);
        assert_eq!(batch[1].metric_name(), QUERY_TIME_METRIC);
        assert_eq!(batch[1].label("query_range"), "5m");

        let avg = &batch[2];
        assert_eq!(avg.metric_name(), "cpu:downsample_5m_avg");
        assert_eq!(avg.label("instance"), "host-1");
        assert_eq!(avg.samples, vec![Sample::new(120_000, 3.0)]);

        let max = &batch[3];
        assert_eq!(max.metric_name(), "cpu:downsample_5m_max");
        assert_eq!(max.samples, vec![Sample::new(120_000, 5.0)]);

        // input names never leak into the batch unmangled
        assert!(batch
            .iter()
            .all(|ts| ts.metric_name() != "cpu"));
    }

    #[tokio::test]
    async fn test_tick_zero_samples_emits_only_self_metrics() {
        let reader = FakeReader::new(vec![ReadOutcome {
            series: vec![],
            sample_count: 0,
            elapsed: Duration::from_millis(5),
        }]);
        let (tx, rx) = async_channel::bounded(4);
        let mut w = worker(reader, tx, 0, false, &["avg"]);
        w.tick().await;

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].metric_name(), SAMPLES_COUNT_METRIC);
        assert_eq!(batch[1].metric_name(), QUERY_TIME_METRIC);
    }

    #[tokio::test]
    async fn test_cascade_tick_reads_previous_resolution() {
        let cascaded = TimeSeries::new(
            vec![Label::new("__name__", "cpu:downsample_5m_avg")],
            vec![
                Sample::new(0, 2.0),
                Sample::new(300_000, 4.0),
                Sample::new(600_000, 6.0),
            ],
        );
        let reader = FakeReader::new(vec![ReadOutcome {
            series: vec![cascaded],
            sample_count: 3,
            elapsed: Duration::from_millis(10),
        }]);
        let (tx, rx) = async_channel::bounded(4);
        let mut w = worker(reader.clone(), tx, 1, true, &["avg"]);
        w.tick().await;

        // the read selected the previous resolution's output
        let seen = reader.seen_matchers.lock().unwrap();
        assert_eq!(
            seen[0],
            vec![Matcher::new(MatchOp::Equal, "__name__", "cpu:downsample_5m_avg")]
        );

        let batch = rx.try_recv().unwrap();
        let out = &batch[2];
        assert_eq!(out.metric_name(), "cpu:downsample_20m_avg");
        assert_eq!(out.samples, vec![Sample::new(300_000, 4.0)]);
    }

    #[tokio::test]
    async fn test_full_channel_drops_batch() {
        let reader = FakeReader::new(vec![ReadOutcome {
            series: vec![cpu_series()],
            sample_count: 5,
            elapsed: Duration::from_millis(1),
        }]);
        let (tx, rx) = async_channel::bounded(1);
        // occupy the only slot
        tx.try_send(Vec::new()).unwrap();

        let mut w = worker(reader, tx, 0, false, &["avg"]);
        w.tick().await;

        // only the pre-existing batch is on the channel; the tick's output
        // was dropped, not queued
        assert_eq!(rx.try_recv().unwrap().len(), 0);
        assert!(rx.try_recv().is_err());
    }
}
