use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single normalized sample, the unit handed from the pipeline to every sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Name of the source the sample was fetched from.
    pub source: String,
    /// Configured logical metric name.
    pub metric: String,
    /// Sample time, whole-second resolution.
    pub timestamp: DateTime<Utc>,
    /// Sample value. NaN and infinities are passed through as-is.
    pub value: f64,
    /// Retained labels, iterated in lexicographic key order.
    pub labels: BTreeMap<String, String>,
}

impl Record {
    /// Label keys in lexicographic order.
    pub fn label_keys(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }

    /// Serializes the label map as a JSON object with sorted keys.
    pub fn labels_json(&self) -> Result<String> {
        labels_to_json(&self.labels)
    }
}

/// Serializes a label map as a JSON object. Keys come out sorted because the
/// map is ordered; an empty map yields `{}`.
pub fn labels_to_json(labels: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(labels).context("serializing labels to JSON")
}
