//! Downsampling engine: worker lifecycle plus the shared write channel
//! hand-off. One worker runs per (job, resolution).

pub mod agg;
pub mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::downsample::agg::Aggregation;
use crate::downsample::worker::DownsampleWorker;
use crate::remote::read::SeriesRead;
use crate::remote::write::{Batch, BufferPool};

pub struct DownsampleManager {
    workers: Vec<JoinHandle<()>>,
}

impl DownsampleManager {
    /// Builds the per-job aggregation lists, drops invalid jobs and spawns
    /// one worker task per (job, resolution). A panicking worker takes down
    /// only its own task; the join path logs it.
    pub fn spawn(
        config: &Config,
        reader: Arc<dyn SeriesRead>,
        tx: async_channel::Sender<Batch>,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> DownsampleManager {
        let resolutions = Arc::new(config.global_config.resolutions.sorted_by_interval());
        let metric_reuse = config.global_config.enabled_metric_reuse;
        let mut workers = Vec::new();

        for job in &config.downsample_config {
            // Matchers naming downsampled series would downsample the
            // downsampler's own output; the whole job is skipped.
            if job.matchers.iter().any(|m| m.value.contains(":downsample")) {
                tracing::warn!(
                    job = %job.job_name,
                    "label value contains :downsample, job will be ignored"
                );
                continue;
            }

            let mut aggregations: Vec<Aggregation> = Vec::with_capacity(job.aggregations.len());
            for name in &job.aggregations {
                match name.parse() {
                    Ok(agg) => aggregations.push(agg),
                    Err(err) => {
                        tracing::warn!(job = %job.job_name, error = %err, "dropping aggregation")
                    }
                }
            }

            for idx in 0..resolutions.len() {
                let worker = DownsampleWorker {
                    job_name: job.job_name.clone(),
                    matchers: job.matchers.clone(),
                    aggregations: aggregations.clone(),
                    resolutions: Arc::clone(&resolutions),
                    resolution_idx: idx,
                    metric_reuse,
                    reader: Arc::clone(&reader),
                    tx: tx.clone(),
                    pool: Arc::clone(&pool),
                    cancel: cancel.clone(),
                    buffer: pool.get(),
                };
                workers.push(tokio::spawn(worker.run()));
            }
        }

        tracing::info!(workers = workers.len(), "downsample workers started");
        DownsampleManager { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to exit; a worker that died panicking is
    /// reported here while its peers keep their results.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "downsample worker panicked");
                }
            }
        }
    }
}
