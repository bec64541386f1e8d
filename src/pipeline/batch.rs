use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MetricConfig;
use crate::normalize::{normalize, NormalizeError};
use crate::prometheus::{FetchError, QueryClient};
use crate::sink::Sink;
use crate::telemetry::RunMetrics;
use crate::window::{TimeWindow, SUB_WINDOW};

/// Reason a (metric, source) pair stopped before covering its window.
#[derive(Error, Debug)]
pub enum PairError {
    #[error("sub-window {batch}: {cause}")]
    Fetch { batch: usize, cause: FetchError },

    #[error("sub-window {batch}: {cause}")]
    Normalize { batch: usize, cause: NormalizeError },

    #[error("sub-window {batch}: sink write failed: {cause:#}")]
    Sink { batch: usize, cause: anyhow::Error },

    #[error("splitting window: {0:#}")]
    Window(anyhow::Error),

    #[error("cancelled before sub-window {batch}")]
    Cancelled { batch: usize },
}

impl PairError {
    /// True when the pair stopped because the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. }
                | Self::Fetch {
                    cause: FetchError::Cancelled { .. },
                    ..
                }
        )
    }
}

/// Totals for one completed pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairSummary {
    /// Sub-windows fetched.
    pub batches: usize,
    /// Records handed to the sink.
    pub records: usize,
}

/// Drives one (metric, source) pair across the window in 1h sub-windows.
///
/// Each sub-window is fetched, normalized and written before the next one is
/// requested. The first failing sub-window ends the pair.
pub struct BatchScheduler<'a, C, S> {
    client: &'a C,
    sink: &'a Mutex<S>,
    metrics: Option<&'a RunMetrics>,
    cancel: &'a CancellationToken,
    chunk: Duration,
}

impl<'a, C, S> BatchScheduler<'a, C, S>
where
    C: QueryClient,
    S: Sink,
{
    pub fn new(client: &'a C, sink: &'a Mutex<S>, cancel: &'a CancellationToken) -> Self {
        Self {
            client,
            sink,
            metrics: None,
            cancel,
            chunk: SUB_WINDOW,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<&'a RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn run(
        &self,
        metric: &MetricConfig,
        window: &TimeWindow,
    ) -> Result<PairSummary, PairError> {
        let source = self.client.name();
        let mut summary = PairSummary::default();

        let sub_windows = window.sub_windows(self.chunk).map_err(PairError::Window)?;

        for sub in sub_windows {
            if self.cancel.is_cancelled() {
                return Err(PairError::Cancelled { batch: sub.index });
            }

            debug!(
                metric = %metric.name,
                source,
                batch = sub.index,
                start = %sub.start,
                end = %sub.end,
                "fetching sub-window",
            );

            let data = self
                .client
                .fetch_range(&metric.query, sub.start, sub.end, window.step())
                .await
                .map_err(|cause| PairError::Fetch {
                    batch: sub.index,
                    cause,
                })?;
            summary.batches += 1;

            let records = normalize(source, &metric.name, &metric.label_keys, &data).map_err(
                |cause| PairError::Normalize {
                    batch: sub.index,
                    cause,
                },
            )?;

            if records.is_empty() {
                debug!(metric = %metric.name, source, batch = sub.index, "sub-window returned no samples");
                continue;
            }

            let count = records.len();
            let started = Instant::now();
            {
                let mut sink = self.sink.lock().await;
                sink.write(&metric.name, records)
                    .await
                    .map_err(|cause| PairError::Sink {
                        batch: sub.index,
                        cause,
                    })?;
            }

            if let Some(metrics) = self.metrics {
                metrics.record_sink_write(&metric.name, count, started.elapsed());
            }

            summary.records += count;

            info!(
                metric = %metric.name,
                source,
                batch = sub.index,
                records = count,
                "processed sub-window",
            );
        }

        Ok(summary)
    }
}
