use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "metrics_crawler";

/// Prometheus metrics describing the progress of a crawl run.
///
/// All metrics use the "metrics_crawler" namespace.
pub struct RunMetrics {
    registry: Registry,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Range query attempts by source and outcome (success/error).
    pub fetch_attempts: CounterVec,
    /// Attempts beyond the first, by source.
    pub fetch_retries: CounterVec,
    /// Fetches that exhausted every attempt, by source.
    pub fetch_failures: CounterVec,
    /// Duration of single range query attempts, by source.
    pub fetch_duration: HistogramVec,
    /// Records handed to the sink, by metric.
    pub records_written: CounterVec,
    /// Duration of sink writes (1ms-10s buckets).
    pub sink_write_duration: Histogram,
    /// (metric, source) pairs that ended in an error.
    pub pairs_failed: Counter,
}

impl RunMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let fetch_attempts = CounterVec::new(
            Opts::new(
                "fetch_attempts_total",
                "Total range query attempts by source and outcome.",
            )
            .namespace(NAMESPACE),
            &["source", "outcome"],
        )?;
        let fetch_retries = CounterVec::new(
            Opts::new(
                "fetch_retries_total",
                "Total range query retries by source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let fetch_failures = CounterVec::new(
            Opts::new(
                "fetch_failures_total",
                "Total range queries that exhausted all attempts, by source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "fetch_duration_seconds",
                "Duration of a single range query attempt.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["source"],
        )?;
        let records_written = CounterVec::new(
            Opts::new(
                "records_written_total",
                "Total records handed to the sink by metric.",
            )
            .namespace(NAMESPACE),
            &["metric"],
        )?;
        let sink_write_duration = Histogram::with_opts(
            HistogramOpts::new("sink_write_duration_seconds", "Duration of sink writes.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let pairs_failed = Counter::with_opts(
            Opts::new(
                "pairs_failed_total",
                "Total metric/source pairs that failed.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(fetch_attempts.clone()))?;
        registry.register(Box::new(fetch_retries.clone()))?;
        registry.register(Box::new(fetch_failures.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(sink_write_duration.clone()))?;
        registry.register(Box::new(pairs_failed.clone()))?;

        Ok(Self {
            registry,
            shutdown: parking_lot::Mutex::new(None),
            fetch_attempts,
            fetch_retries,
            fetch_failures,
            fetch_duration,
            records_written,
            sink_write_duration,
            pairs_failed,
        })
    }

    /// Records one range query attempt (1-based `attempt`).
    pub fn record_fetch_attempt(
        &self,
        source: &str,
        attempt: u32,
        outcome: &str,
        elapsed: Duration,
    ) {
        self.fetch_attempts
            .with_label_values(&[source, outcome])
            .inc();
        self.fetch_duration
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());

        if attempt > 1 {
            self.fetch_retries.with_label_values(&[source]).inc();
        }
    }

    pub fn record_fetch_failure(&self, source: &str) {
        self.fetch_failures.with_label_values(&[source]).inc();
    }

    pub fn record_sink_write(&self, metric: &str, records: usize, elapsed: Duration) {
        self.records_written
            .with_label_values(&[metric])
            .inc_by(records as f64);
        self.sink_write_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_pair_failure(&self) {
        self.pairs_failed.inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Accepts the ":port" shorthand. Returns the bound address.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the metrics server, if running.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
            tracing::info!("metrics server stopped");
        }
    }
}

struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text exposition.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
