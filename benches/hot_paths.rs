use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use metrics_crawler::normalize::normalize;
use metrics_crawler::prometheus::response::{RangeSeries, SamplePair};
use metrics_crawler::prometheus::QueryData;
use metrics_crawler::sink::table;
use metrics_crawler::window::{TimeWindow, SUB_WINDOW};

const T0: f64 = 1_704_067_200.0;

/// 64 series x 240 samples, roughly one hour at 15s resolution.
fn build_matrix() -> QueryData {
    let series = (0..64)
        .map(|i| RangeSeries {
            metric: HashMap::from([
                ("__name__".to_string(), "tidb_executor_statement_total".to_string()),
                ("instance".to_string(), format!("tidb-{i}:10080")),
                ("job".to_string(), "tidb".to_string()),
                ("type".to_string(), ["select", "insert", "update", "delete"][i % 4].to_string()),
            ]),
            values: (0..240)
                .map(|j| SamplePair(T0 + f64::from(j) * 15.0, format!("{}.25", j * 3)))
                .collect(),
        })
        .collect();

    QueryData::Matrix(series)
}

fn bench_normalize(c: &mut Criterion) {
    let data = build_matrix();
    let label_keys = vec!["instance".to_string(), "type".to_string()];

    c.bench_function("normalize_matrix_64x240", |b| {
        b.iter(|| {
            let records = normalize("prom-a", "qps", &label_keys, black_box(&data));
            black_box(records)
        })
    });
}

fn bench_sub_windows(c: &mut Criterion) {
    let start = DateTime::from_timestamp(1_704_067_200, 0).expect("valid");
    let end = DateTime::from_timestamp(1_704_067_200 + 30 * 86_400 + 1_800, 0).expect("valid");
    let window = TimeWindow::new(start, end, Duration::from_secs(60)).expect("window");

    c.bench_function("sub_windows_30d", |b| {
        b.iter(|| {
            let count = black_box(&window)
                .sub_windows(SUB_WINDOW)
                .map(|subs| subs.count())
                .unwrap_or_default();
            black_box(count)
        })
    });
}

fn bench_render_csv(c: &mut Criterion) {
    let data = build_matrix();
    let label_keys = vec!["instance".to_string(), "type".to_string()];
    let records = normalize("prom-a", "qps", &label_keys, &data).expect("normalize");

    c.bench_function("render_csv_15360_rows", |b| {
        b.iter(|| black_box(table::render(black_box(&records))))
    });
}

criterion_group!(benches, bench_normalize, bench_sub_windows, bench_render_csv);
criterion_main!(benches);
