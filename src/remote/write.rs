//! Remote-write client: a fixed pool of writer tasks draining the shared
//! batch channel, plus a slow ticker that nudges an idling batch through in
//! low-traffic conditions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::common::types::TimeSeries;
use crate::error::{PsdError, PsdResult};
use crate::remote::prompb;

/// A batch of series on its way to the backend. Ownership moves to the
/// writer once the batch is on the channel.
pub type Batch = Vec<TimeSeries>;

/// Capacity of the shared write channel, in batches.
pub const WRITE_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of a single batch buffer.
pub const BATCH_CAPACITY: usize = 5120;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const REENQUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// Recycles batch buffers between the workers and the writers so steady
/// state allocates nothing.
pub struct BufferPool {
    buffers: Mutex<Vec<Batch>>,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(64)
    }
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn get(&self) -> Batch {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(buf) = buffers.pop() {
                return buf;
            }
        }
        Vec::with_capacity(BATCH_CAPACITY)
    }

    pub fn put(&self, mut batch: Batch) {
        batch.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_pooled {
                buffers.push(batch);
            }
        }
    }
}

/// Writer pool size: the runtime parallelism clamped into [4, 8].
pub fn max_concurrent_writers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.clamp(4, 8)
}

pub struct RemoteWriteClient {
    url: String,
    http: reqwest::Client,
    rx: async_channel::Receiver<Batch>,
    tx: async_channel::Sender<Batch>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
}

impl RemoteWriteClient {
    pub fn new(
        http: reqwest::Client,
        url: String,
        rx: async_channel::Receiver<Batch>,
        tx: async_channel::Sender<Batch>,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> RemoteWriteClient {
        RemoteWriteClient {
            url,
            http,
            rx,
            tx,
            pool,
            cancel,
        }
    }

    /// Runs the writer pool and the re-enqueue ticker until the channel is
    /// closed and drained, then joins.
    pub async fn run(self: Arc<Self>) {
        let workers = max_concurrent_writers();
        let mut handles = Vec::with_capacity(workers + 1);
        for _ in 0..workers {
            let client = Arc::clone(&self);
            handles.push(tokio::spawn(async move { client.worker_loop().await }));
        }

        let ticker = Arc::clone(&self);
        handles.push(tokio::spawn(async move { ticker.reenqueue_loop().await }));

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "remote write task failed");
            }
        }
    }

    /// Drains batches until the channel is closed and empty. Cancellation
    /// does not interrupt the drain; it only closes the producers.
    async fn worker_loop(&self) {
        while let Ok(batch) = self.rx.recv().await {
            if batch.is_empty() {
                continue;
            }
            if let Err(err) = self.send(&batch).await {
                tracing::error!(error = %err, series = batch.len(), "remote write failed");
            }
            self.pool.put(batch);
        }
    }

    /// Every five seconds moves one batch off the channel and puts it right
    /// back. A heartbeat for the low-traffic case, not a retry mechanism.
    async fn reenqueue_loop(&self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + REENQUEUE_INTERVAL,
            REENQUEUE_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Ok(batch) = self.rx.try_recv() {
                        if !batch.is_empty() && self.tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, batch: &[TimeSeries]) -> PsdResult<()> {
        let request = prompb::WriteRequest {
            timeseries: batch.iter().map(prompb::TimeSeries::from).collect(),
        };
        let mut raw = Vec::with_capacity(request.encoded_len());
        request
            .encode(&mut raw)
            .map_err(|e| PsdError::Encoding(format!("write request: {e}")))?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| PsdError::Encoding(format!("write request: {e}")))?;

        let response = self
            .http
            .post(&self.url)
            .timeout(WRITE_TIMEOUT)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("User-Agent", "prom-stream-downsample")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(PsdError::UnexpectedResponse(format!(
                "remote write status {status}: {body}"
            )));
        }

        tracing::debug!(series = batch.len(), "remote write series success");
        Ok(())
    }
}
