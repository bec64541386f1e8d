use std::io::Write;

use anyhow::{Context, Result};
use chrono::SecondsFormat;

use crate::record::Record;

/// Columns present on every row, ahead of the label columns.
pub const FIXED_COLUMNS: [&str; 4] = ["source", "metric", "timestamp", "value"];

/// Header row: the fixed columns, then `first`'s label keys in lexicographic order.
pub fn header(first: &Record) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(first.label_keys().map(str::to_string))
        .collect()
}

/// Data row for one record. Label values follow the record's own key order,
/// so rows whose keys differ from the header come out misaligned.
pub fn row(record: &Record) -> Vec<String> {
    let mut out = Vec::with_capacity(FIXED_COLUMNS.len() + record.labels.len());
    out.push(record.source.clone());
    out.push(record.metric.clone());
    out.push(record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true));
    out.push(format_value(record.value));
    out.extend(record.labels.values().cloned());
    out
}

/// Shortest round-trip decimal form, with Prometheus spellings for non-finite values.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// CSV writer that tolerates rows wider or narrower than the header.
pub fn writer<W: Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().flexible(true).from_writer(inner)
}

/// Writes one row per record.
pub fn write_rows<W: Write>(writer: &mut csv::Writer<W>, records: &[Record]) -> Result<()> {
    for record in records {
        writer
            .write_record(row(record))
            .context("writing CSV row")?;
    }
    Ok(())
}

/// Renders `records` as a complete CSV document (header plus rows).
pub fn render(records: &[Record]) -> Result<Vec<u8>> {
    let mut w = writer(Vec::new());

    if let Some(first) = records.first() {
        w.write_record(header(first)).context("writing CSV header")?;
        write_rows(&mut w, records)?;
    }

    w.into_inner().context("finishing CSV document")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::DateTime;

    use super::*;

    fn record(labels: &[(&str, &str)], value: f64) -> Record {
        Record {
            source: "prom-a".to_string(),
            metric: "qps".to_string(),
            timestamp: DateTime::from_timestamp(1_704_067_200, 0).expect("valid"),
            value,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_header_sorted_label_keys() {
        let h = header(&record(&[("type", "select"), ("instance", "tidb-0")], 1.0));
        assert_eq!(
            h,
            vec!["source", "metric", "timestamp", "value", "instance", "type"]
        );
    }

    #[test]
    fn test_row_layout() {
        let r = row(&record(&[("type", "select"), ("instance", "tidb-0")], 1.5));
        assert_eq!(
            r,
            vec![
                "prom-a",
                "qps",
                "2024-01-01T00:00:00Z",
                "1.5",
                "tidb-0",
                "select"
            ]
        );
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(2.0), "2");
        assert_eq!(format_value(0.1), "0.1");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }

    #[test]
    fn test_render_allows_misaligned_rows() {
        let records = vec![
            record(&[("type", "select")], 1.0),
            record(&[("instance", "tidb-0"), ("type", "insert")], 2.0),
        ];
        let text = String::from_utf8(render(&records).expect("render")).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "source,metric,timestamp,value,type");
        assert_eq!(lines[1], "prom-a,qps,2024-01-01T00:00:00Z,1,select");
        assert_eq!(lines[2], "prom-a,qps,2024-01-01T00:00:00Z,2,tidb-0,insert");
    }

    #[test]
    fn test_render_empty() {
        assert!(render(&[]).expect("render").is_empty());
    }
}
