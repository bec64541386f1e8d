//! Exports Prometheus range-query data over a bounded time window into CSV
//! files, a ClickHouse table, or Feishu chat attachments.

pub mod config;
pub mod normalize;
pub mod pipeline;
pub mod prometheus;
pub mod record;
pub mod sink;
pub mod telemetry;
pub mod window;
