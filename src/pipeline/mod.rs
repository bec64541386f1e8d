pub mod batch;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MetricConfig;
use crate::prometheus::QueryClient;
use crate::sink::Sink;
use crate::telemetry::RunMetrics;
use crate::window::TimeWindow;

pub use self::batch::{BatchScheduler, PairError, PairSummary};

/// A pair that ended in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFailure {
    pub metric: String,
    pub source: String,
    pub error: String,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Cancelled,
}

/// Totals for a run, in config order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub pairs_total: usize,
    pub pairs_succeeded: usize,
    /// Pairs never started because the run was cancelled.
    pub pairs_skipped: usize,
    pub records_written: usize,
    pub failures: Vec<PairFailure>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if !self.failures.is_empty() {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }
}

/// Result of one spawned pair, tagged with its position in config order.
struct PairOutcome {
    index: usize,
    result: Result<PairSummary, PairError>,
}

/// Runs every (metric, source) pair and routes the records to one sink.
///
/// Metrics are iterated in the outer loop and sources in the inner loop. A
/// failing pair is recorded and the run moves on. The sink is closed exactly
/// once after every pair has finished.
pub struct Coordinator<C, S> {
    clients: Vec<Arc<C>>,
    sink: Arc<Mutex<S>>,
    concurrency: usize,
    metrics: Option<Arc<RunMetrics>>,
}

impl<C, S> Coordinator<C, S>
where
    C: QueryClient + 'static,
    S: Sink + 'static,
{
    /// Creates a coordinator. At least one client is required.
    pub fn new(clients: Vec<C>, sink: S) -> Result<Self> {
        if clients.is_empty() {
            bail!("no usable prometheus sources");
        }

        Ok(Self {
            clients: clients.into_iter().map(Arc::new).collect(),
            sink: Arc::new(Mutex::new(sink)),
            concurrency: 1,
            metrics: None,
        })
    }

    /// Maximum pairs in flight. Values below 1 are treated as 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(
        self,
        metrics: &[MetricConfig],
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        info!(
            metrics = metrics.len(),
            sources = self.clients.len(),
            start = %window.start(),
            end = %window.end(),
            step = %humantime::format_duration(window.step()),
            concurrency = self.concurrency,
            "starting run",
        );

        let report = self.run_pairs(metrics, window, cancel).await;

        info!(
            pairs_total = report.pairs_total,
            pairs_succeeded = report.pairs_succeeded,
            pairs_failed = report.failures.len(),
            pairs_skipped = report.pairs_skipped,
            records = report.records_written,
            cancelled = report.cancelled,
            "run finished",
        );

        self.sink
            .lock()
            .await
            .close()
            .await
            .context("closing sink")?;

        Ok(report)
    }

    async fn run_pairs(
        &self,
        metrics: &[MetricConfig],
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> RunReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut pending: BTreeMap<usize, (String, String)> = BTreeMap::new();
        let mut report = RunReport::default();
        let mut index = 0;

        for metric in metrics {
            let metric = Arc::new(metric.clone());

            for client in &self.clients {
                index += 1;
                report.pairs_total += 1;

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                };

                let Some(permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                    report.pairs_skipped += 1;
                    report.cancelled = true;
                    continue;
                };

                pending.insert(index, (metric.name.clone(), client.name().to_string()));

                let client = Arc::clone(client);
                let sink = Arc::clone(&self.sink);
                let run_metrics = self.metrics.clone();
                let metric = Arc::clone(&metric);
                let window = *window;
                let cancel = cancel.clone();

                in_flight.spawn(async move {
                    let _permit = permit;
                    let result = BatchScheduler::new(client.as_ref(), sink.as_ref(), &cancel)
                        .with_metrics(run_metrics.as_deref())
                        .run(&metric, &window)
                        .await;
                    PairOutcome { index, result }
                });
            }
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "pair task failed to complete"),
            }
        }
        outcomes.sort_by_key(|o| o.index);

        for outcome in outcomes {
            let Some((metric, source)) = pending.remove(&outcome.index) else {
                continue;
            };

            match outcome.result {
                Ok(summary) => {
                    report.pairs_succeeded += 1;
                    report.records_written += summary.records;
                    info!(
                        metric = %metric,
                        source = %source,
                        batches = summary.batches,
                        records = summary.records,
                        "pair complete",
                    );
                }
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    warn!(metric = %metric, source = %source, error = %e, "pair cancelled");
                }
                Err(e) => {
                    error!(metric = %metric, source = %source, error = %e, "pair failed");
                    self.record_failure(&mut report, metric, source, e.to_string());
                }
            }
        }

        // Anything still pending panicked inside its task.
        for (metric, source) in std::mem::take(&mut pending).into_values() {
            self.record_failure(&mut report, metric, source, "pair task panicked".to_string());
        }

        report
    }

    fn record_failure(&self, report: &mut RunReport, metric: String, source: String, error: String) {
        if let Some(metrics) = &self.metrics {
            metrics.record_pair_failure();
        }
        report.failures.push(PairFailure {
            metric,
            source,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_precedence() {
        let mut report = RunReport::default();
        assert_eq!(report.outcome(), RunOutcome::Success);

        report.failures.push(PairFailure {
            metric: "qps".to_string(),
            source: "prom-a".to_string(),
            error: "boom".to_string(),
        });
        assert_eq!(report.outcome(), RunOutcome::PartialFailure);

        report.cancelled = true;
        assert_eq!(report.outcome(), RunOutcome::Cancelled);
    }
}
