use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::prometheus::response::SamplePair;
use crate::prometheus::QueryData;
use crate::record::Record;

/// Result shapes the normalizer cannot turn into records.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("unsupported result type: {0}")]
    UnsupportedResultType(&'static str),

    #[error("invalid sample value {value:?} at {timestamp_ms}ms")]
    InvalidValue { value: String, timestamp_ms: i64 },

    #[error("sample timestamp {0}ms out of range")]
    InvalidTimestamp(i64),
}

/// Flattens a query result into records for `(source, metric)`.
///
/// Matrix results yield one record per sample in series order; vector results
/// yield one record per series. Only `label_keys` present on a series are kept.
pub fn normalize(
    source: &str,
    metric: &str,
    label_keys: &[String],
    data: &QueryData,
) -> Result<Vec<Record>, NormalizeError> {
    match data {
        QueryData::Matrix(series) => {
            let mut records = Vec::with_capacity(data.sample_count());
            for s in series {
                let labels = extract_labels(&s.metric, label_keys);
                for sample in &s.values {
                    records.push(to_record(source, metric, &labels, sample)?);
                }
            }
            Ok(records)
        }
        QueryData::Vector(samples) => samples
            .iter()
            .map(|s| {
                let labels = extract_labels(&s.metric, label_keys);
                to_record(source, metric, &labels, &s.value)
            })
            .collect(),
        other => Err(NormalizeError::UnsupportedResultType(other.kind())),
    }
}

/// Keeps the configured keys that the series actually carries.
fn extract_labels(
    series: &HashMap<String, String>,
    label_keys: &[String],
) -> BTreeMap<String, String> {
    label_keys
        .iter()
        .filter_map(|key| series.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}

fn to_record(
    source: &str,
    metric: &str,
    labels: &BTreeMap<String, String>,
    sample: &SamplePair,
) -> Result<Record, NormalizeError> {
    let timestamp_ms = sample.timestamp_millis();

    let value = parse_value(sample.raw_value()).ok_or_else(|| NormalizeError::InvalidValue {
        value: sample.raw_value().to_string(),
        timestamp_ms,
    })?;

    Ok(Record {
        source: source.to_string(),
        metric: metric.to_string(),
        timestamp: whole_seconds(timestamp_ms)?,
        value,
        labels: labels.clone(),
    })
}

/// Floors a millisecond timestamp to whole seconds.
fn whole_seconds(timestamp_ms: i64) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::from_timestamp(timestamp_ms.div_euclid(1000), 0)
        .ok_or(NormalizeError::InvalidTimestamp(timestamp_ms))
}

/// Parses a wire value, accepting the "+Inf"/"-Inf"/"NaN" spellings.
fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => raw.parse().ok(),
    }
}
