use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::window::TimeWindow;

/// Top-level configuration for a crawl run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum number of (metric, source) pairs processed at once. Default: 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Remote sources to query, in processing order.
    #[serde(default)]
    pub prometheus_instances: Vec<PrometheusConfig>,

    /// Metrics to collect, in processing order.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    /// Global time window for the run.
    pub time_range: TimeRangeConfig,

    /// Output destination.
    pub sink: SinkConfig,

    /// Optional Prometheus endpoint exposing run progress.
    #[serde(default)]
    pub metrics_server: MetricsServerConfig,
}

/// One remote Prometheus-compatible source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrometheusConfig {
    /// Display name stamped onto records. Defaults to the address.
    #[serde(default)]
    pub name: String,

    /// Base HTTP address (e.g., "http://prometheus:9090").
    pub address: String,

    /// Per-attempt timeout as a humantime string. Unset or invalid: 30s.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Basic-auth username; only used together with a password.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
}

/// One metric to export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricConfig {
    /// Logical metric name used for output naming.
    pub name: String,

    /// Opaque range query sent to every source.
    pub query: String,

    /// Series labels to retain on each record.
    #[serde(default)]
    pub label_keys: Vec<String>,
}

/// Time window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeRangeConfig {
    /// Inclusive start, RFC 3339.
    pub start: DateTime<Utc>,

    /// Exclusive end, RFC 3339.
    pub end: DateTime<Utc>,

    /// Query resolution. Default: 1m.
    #[serde(default = "default_step", with = "humantime_serde")]
    pub step: Duration,
}

impl TimeRangeConfig {
    /// Build the validated run window.
    pub fn window(&self) -> Result<TimeWindow> {
        TimeWindow::new(self.start, self.end, self.step)
    }
}

/// Output sink selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Sink discriminator: "csv", "clickhouse" or "feishu".
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub csv: CsvConfig,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub feishu: FeishuConfig,
}

/// CSV file sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    /// Directory receiving one file per metric. Default: "output".
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// ClickHouse table sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "prometheus_metrics".
    #[serde(default = "default_table")]
    pub table: String,

    /// Rows buffered before an insert. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Create the table if it does not exist. Default: false.
    #[serde(default)]
    pub create_table: bool,

    /// Truncate the table before the run. Default: false.
    #[serde(default)]
    pub truncate_table: bool,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// Feishu chat attachment sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub app_secret: String,

    /// Chat, user or email receiving the attachment.
    #[serde(default)]
    pub receive_id: String,

    /// Kind of `receive_id` (chat_id, open_id, user_id, email). Default: "chat_id".
    #[serde(default = "default_receive_id_type")]
    pub receive_id_type: String,

    /// Prefix of each message title. Default: "Metrics export".
    #[serde(default = "default_message_title")]
    pub message_title: String,

    /// Open API base URL. Default: "https://open.feishu.cn".
    #[serde(default = "default_feishu_base_url")]
    pub base_url: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_feishu_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus exposition of run progress.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsServerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9464".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Comma-separated source addresses replacing the configured list.
    pub prometheus: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub step: Option<String>,
    pub log_level: Option<String>,
    pub concurrency: Option<usize>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_step() -> Duration {
    Duration::from_secs(60)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "prometheus_metrics".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_receive_id_type() -> String {
    "chat_id".to_string()
}

fn default_message_title() -> String {
    "Metrics export".to_string()
}

fn default_feishu_base_url() -> String {
    "https://open.feishu.cn".to_string()
}

fn default_feishu_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_addr() -> String {
    ":9464".to_string()
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            batch_size: default_batch_size(),
            create_table: false,
            truncate_table: false,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            receive_id: String::new(),
            receive_id_type: default_receive_id_type(),
            message_title: default_message_title(),
            base_url: default_feishu_base_url(),
            timeout: default_feishu_timeout(),
        }
    }
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file without validating it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Apply command-line overrides on top of the file values.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(addrs) = &overrides.prometheus {
            let instances: Vec<PrometheusConfig> = addrs
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(|addr| PrometheusConfig {
                    name: addr.to_string(),
                    address: addr.to_string(),
                    timeout: Some("30s".to_string()),
                    ..Default::default()
                })
                .collect();

            if instances.is_empty() {
                bail!("--prometheus override contains no addresses");
            }

            self.prometheus_instances = instances;
        }

        if let Some(start) = &overrides.start {
            self.time_range.start = parse_rfc3339(start).context("invalid start time")?;
        }

        if let Some(end) = &overrides.end {
            self.time_range.end = parse_rfc3339(end).context("invalid end time")?;
        }

        if let Some(step) = &overrides.step {
            self.time_range.step = humantime::parse_duration(step)
                .with_context(|| format!("invalid step duration {step:?}"))?;
        }

        if let Some(level) = &overrides.log_level {
            self.log_level = level.clone();
        }

        if let Some(concurrency) = overrides.concurrency {
            self.concurrency = concurrency;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.prometheus_instances.is_empty() {
            bail!("at least one prometheus_instances entry is required");
        }

        if self.metrics.is_empty() {
            bail!("at least one metric is required");
        }

        let mut names = HashSet::new();
        for metric in &self.metrics {
            if metric.name.is_empty() {
                bail!("metric name is required");
            }
            if metric.query.trim().is_empty() {
                bail!("metric {} has an empty query", metric.name);
            }
            if !names.insert(metric.name.as_str()) {
                bail!("duplicate metric name: {}", metric.name);
            }
        }

        if self.concurrency == 0 {
            bail!("concurrency must be positive");
        }

        self.time_range.window().context("invalid time_range")?;

        self.validate_sink()
    }

    fn validate_sink(&self) -> Result<()> {
        match self.sink.kind.as_str() {
            "csv" => {
                if self.sink.csv.output_dir.as_os_str().is_empty() {
                    bail!("sink.csv.output_dir is required");
                }
            }
            "clickhouse" => {
                let ch = &self.sink.clickhouse;
                if ch.endpoint.is_empty() {
                    bail!("sink.clickhouse.endpoint is required");
                }
                if ch.batch_size == 0 {
                    bail!("sink.clickhouse.batch_size must be positive");
                }
                if !is_identifier(&ch.database) {
                    bail!("invalid sink.clickhouse.database: {:?}", ch.database);
                }
                if !is_identifier(&ch.table) {
                    bail!("invalid sink.clickhouse.table: {:?}", ch.table);
                }
            }
            "feishu" => {
                let fs = &self.sink.feishu;
                if fs.app_id.is_empty() || fs.app_secret.is_empty() {
                    bail!("sink.feishu.app_id and sink.feishu.app_secret are required");
                }
                if fs.receive_id.is_empty() {
                    bail!("sink.feishu.receive_id is required");
                }
            }
            other => bail!("unsupported sink type: {other:?}"),
        }

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Build a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=1&pool_max=2");

        dsn
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value.trim())
        .with_context(|| format!("expected RFC 3339, got {value:?}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Plain SQL identifier: letters, digits and underscores, not starting with a digit.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
