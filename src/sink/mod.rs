pub mod clickhouse;
pub mod file;
pub mod feishu;
pub mod table;

use std::future::Future;

use anyhow::{bail, Result};

use crate::config::SinkConfig;
use crate::record::Record;

use self::clickhouse::ClickHouseSink;
use self::file::CsvSink;
use self::feishu::FeishuSink;

/// Sink receives normalized records, one sub-window at a time.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Persist `records` for `metric`. An empty batch is a no-op.
    fn write(
        &mut self,
        metric: &str,
        records: Vec<Record>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Flush and release resources. Called exactly once, after the last write.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// OutputSink dispatches to the destination selected by `sink.type`.
pub enum OutputSink {
    Csv(CsvSink),
    ClickHouse(ClickHouseSink),
    Feishu(FeishuSink),
}

impl OutputSink {
    /// Builds and initializes the configured sink.
    pub async fn from_config(cfg: &SinkConfig) -> Result<Self> {
        let sink = match cfg.kind.as_str() {
            "csv" => Self::Csv(CsvSink::new(&cfg.csv)?),
            "clickhouse" => Self::ClickHouse(ClickHouseSink::connect(&cfg.clickhouse).await?),
            "feishu" => Self::Feishu(FeishuSink::new(&cfg.feishu)?),
            other => bail!("unsupported sink type: {other:?}"),
        };

        tracing::info!(sink = sink.name(), "sink initialized");

        Ok(sink)
    }
}

impl Sink for OutputSink {
    fn name(&self) -> &str {
        match self {
            Self::Csv(s) => s.name(),
            Self::ClickHouse(s) => s.name(),
            Self::Feishu(s) => s.name(),
        }
    }

    async fn write(&mut self, metric: &str, records: Vec<Record>) -> Result<()> {
        match self {
            Self::Csv(s) => s.write(metric, records).await,
            Self::ClickHouse(s) => s.write(metric, records).await,
            Self::Feishu(s) => s.write(metric, records).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::Csv(s) => s.close().await,
            Self::ClickHouse(s) => s.close().await,
            Self::Feishu(s) => s.close().await,
        }
    }
}
