use std::fmt::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::{debug, info};

use crate::config::ClickHouseConfig;
use crate::record::Record;

const COLUMNS: &str = "source, metric, timestamp, value, labels";

/// Buffers records and inserts them into a ClickHouse table in batches.
pub struct ClickHouseSink {
    pool: Pool,
    table: String,
    buffer: BatchBuffer,
}

/// Accumulates records and hands them out in fixed-size batches.
struct BatchBuffer {
    batch_size: usize,
    pending: Vec<Record>,
}

impl BatchBuffer {
    fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Appends `records` and returns every batch that is now full.
    fn push(&mut self, records: Vec<Record>) -> Vec<Vec<Record>> {
        self.pending.extend(records);

        let mut ready = Vec::new();
        while self.pending.len() >= self.batch_size {
            ready.push(self.pending.drain(..self.batch_size).collect());
        }
        ready
    }

    /// Takes the partial batch left over, if any.
    fn take_remainder(&mut self) -> Option<Vec<Record>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

impl ClickHouseSink {
    /// Connects, verifies connectivity, and prepares the table.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self> {
        let pool = Pool::new(cfg.dsn());
        let table = format!("{}.{}", cfg.database, cfg.table);

        let mut handle = pool
            .get_handle()
            .await
            .context("connecting to ClickHouse")?;
        handle.ping().await.context("pinging ClickHouse")?;

        if cfg.create_table {
            handle
                .execute(create_table_sql(&table).as_str())
                .await
                .with_context(|| format!("creating table {table}"))?;
            info!(table = %table, "ensured ClickHouse table exists");
        }

        if cfg.truncate_table {
            handle
                .execute(format!("TRUNCATE TABLE IF EXISTS {table}").as_str())
                .await
                .with_context(|| format!("truncating table {table}"))?;
            info!(table = %table, "truncated ClickHouse table");
        }

        info!(endpoint = %cfg.endpoint, table = %table, "connected to ClickHouse");

        Ok(Self {
            pool,
            table,
            buffer: BatchBuffer::new(cfg.batch_size),
        })
    }

    pub fn name(&self) -> &str {
        "clickhouse"
    }

    pub async fn write(&mut self, _metric: &str, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for batch in self.buffer.push(records) {
            self.insert(&batch).await?;
        }

        Ok(())
    }

    /// Inserts whatever remains buffered.
    pub async fn close(&mut self) -> Result<()> {
        match self.buffer.take_remainder() {
            Some(batch) => self.insert(&batch).await,
            None => Ok(()),
        }
    }

    async fn insert(&self, batch: &[Record]) -> Result<()> {
        let started = Instant::now();
        let sql = insert_sql(&self.table, batch)?;

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for insert")?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("inserting {} rows into {}", batch.len(), self.table))?;

        debug!(
            table = %self.table,
            rows = batch.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inserted batch",
        );

        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         id UUID DEFAULT generateUUIDv4(), \
         source String, \
         metric String, \
         timestamp DateTime, \
         value Float64, \
         labels String, \
         created_at DateTime DEFAULT now()\
         ) ENGINE = MergeTree() ORDER BY (metric, source, timestamp)"
    )
}

/// Builds a multi-row INSERT for `batch`.
fn insert_sql(table: &str, batch: &[Record]) -> Result<String> {
    let mut sql = String::with_capacity(64 + table.len() + batch.len() * 128);
    let _ = write!(sql, "INSERT INTO {table} ({COLUMNS}) VALUES ");

    for (idx, r) in batch.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let labels = r.labels_json()?;
        let _ = write!(
            sql,
            "('{}', '{}', {}, {}, '{}')",
            escape_sql(&r.source),
            escape_sql(&r.metric),
            format_datetime(r.timestamp),
            format_float(r.value),
            escape_sql(&labels),
        );
    }

    Ok(sql)
}

fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S"))
}

/// Float literal; ClickHouse spells non-finite values nan/inf/-inf.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v == f64::INFINITY {
        "inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        v.to_string()
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
