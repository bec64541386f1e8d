pub mod response;
pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PrometheusConfig;
use crate::telemetry::RunMetrics;

pub use self::response::QueryData;
use self::response::ApiResponse;
use self::retry::{run_with_backoff, RetryPolicy};

/// Per-attempt timeout used when a source leaves it unset or unparsable.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const QUERY_RANGE_PATH: &str = "/api/v1/query_range";

/// Terminal outcome of a range fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("source {source_name}: range query failed after {attempts} attempts: {cause:#}")]
    Exhausted {
        source_name: String,
        attempts: u32,
        cause: anyhow::Error,
    },

    #[error("source {source_name}: range query cancelled")]
    Cancelled { source_name: String },
}

/// A remote source capable of executing range queries.
pub trait QueryClient: Send + Sync {
    /// Display name of the source, stamped onto every record it yields.
    fn name(&self) -> &str;

    /// Fetch samples for `query` over `[start, end]` at resolution `step`.
    fn fetch_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> impl Future<Output = Result<QueryData, FetchError>> + Send;
}

/// Basic-auth credentials for one source.
#[derive(Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// HTTP client for one Prometheus-compatible source.
pub struct Client {
    name: String,
    endpoint: String,
    timeout: Duration,
    credentials: Option<Credentials>,
    http: reqwest::Client,
    retry: RetryPolicy,
    cancel: CancellationToken,
    metrics: Option<Arc<RunMetrics>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("basic_auth", &self.credentials.is_some())
            .finish()
    }
}

impl Client {
    /// Create a client for one configured source.
    pub fn new(cfg: &PrometheusConfig) -> Result<Self> {
        let endpoint = cfg.address.trim().trim_end_matches('/').to_string();

        let parsed = reqwest::Url::parse(&endpoint)
            .with_context(|| format!("parsing address {:?}", cfg.address))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("unsupported address scheme {:?}", parsed.scheme());
        }

        let name = if cfg.name.is_empty() {
            endpoint.clone()
        } else {
            cfg.name.clone()
        };

        let timeout = resolve_timeout(&name, cfg.timeout.as_deref());

        let credentials = match (&cfg.username, &cfg.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        };

        let http = reqwest::Client::builder()
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            name,
            endpoint,
            timeout,
            credentials,
            http,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            metrics: None,
        })
    }

    /// Abort pending retries when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record attempt counts and latencies into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the retry schedule.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one range query attempt.
    async fn query_once(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        attempt: u32,
    ) -> Result<QueryData> {
        let url = format!("{}{}", self.endpoint, QUERY_RANGE_PATH);
        let params = [
            ("query", query.to_string()),
            ("start", format_time(start)),
            ("end", format_time(end)),
            ("step", format_step(step)),
        ];

        let mut request = self
            .http
            .get(&url)
            .query(&params)
            .header("Accept", "application/json")
            .timeout(self.timeout);

        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {url}: {}", body.trim());
        }

        let body: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))?;

        for warning in &body.warnings {
            warn!(source = %self.name, attempt, warning = %warning, "query returned a warning");
        }

        if body.status != "success" {
            bail!(
                "query failed with status {:?} ({}): {}",
                body.status,
                body.error_type.as_deref().unwrap_or("unknown"),
                body.error.as_deref().unwrap_or("no error message"),
            );
        }

        body.data.context("response has no data field")
    }

    fn record_attempt(&self, attempt: u32, outcome: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fetch_attempt(&self.name, attempt, outcome, elapsed);
        }
    }
}

/// Build a client per configured source, skipping the ones that cannot be
/// used. Fails only when none are left.
pub fn build_clients(sources: &[PrometheusConfig]) -> Result<Vec<Client>> {
    let clients: Vec<Client> = sources
        .iter()
        .filter_map(|source| match Client::new(source) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(
                    source = %source.name,
                    address = %source.address,
                    error = %format!("{e:#}"),
                    "skipping invalid prometheus source",
                );
                None
            }
        })
        .collect();

    if clients.is_empty() {
        bail!("no usable prometheus sources");
    }

    Ok(clients)
}

impl QueryClient for Client {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryData, FetchError> {
        let result = run_with_backoff(&self.name, &self.retry, &self.cancel, |attempt| async move {
            let started = Instant::now();
            let result = self.query_once(query, start, end, step, attempt).await;
            let outcome = if result.is_ok() { "success" } else { "error" };
            self.record_attempt(attempt, outcome, started.elapsed());
            result
        })
        .await;

        match &result {
            Ok(data) => debug!(
                source = %self.name,
                result_type = data.kind(),
                samples = data.sample_count(),
                "range query complete",
            ),
            Err(FetchError::Exhausted { .. }) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch_failure(&self.name);
                }
            }
            Err(FetchError::Cancelled { .. }) => {}
        }

        result
    }
}

/// Parse a per-source timeout, falling back to [`DEFAULT_TIMEOUT`] when the
/// value is absent, zero, or unparsable.
fn resolve_timeout(source: &str, raw: Option<&str>) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_TIMEOUT;
    };

    match humantime::parse_duration(raw) {
        Ok(timeout) if !timeout.is_zero() => timeout,
        Ok(_) => DEFAULT_TIMEOUT,
        Err(e) => {
            warn!(
                source,
                timeout = raw,
                error = %e,
                "invalid timeout, using default of 30s",
            );
            DEFAULT_TIMEOUT
        }
    }
}

/// RFC 3339 form accepted by the query API.
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Step as (possibly fractional) seconds.
fn format_step(step: Duration) -> String {
    if step.subsec_nanos() == 0 {
        step.as_secs().to_string()
    } else {
        step.as_secs_f64().to_string()
    }
}
