use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use metrics_crawler::config::PrometheusConfig;
use metrics_crawler::prometheus::retry::RetryPolicy;
use metrics_crawler::prometheus::{Client, FetchError, QueryClient, QueryData};
use metrics_crawler::telemetry::RunMetrics;

/// Scripted fake of the range query endpoint.
#[derive(Default)]
struct FakeProm {
    /// Number of leading requests answered with 503.
    fail_first: usize,
    /// Answer every request with an API-level error envelope.
    api_error: bool,
    /// Hold every response this long before answering.
    delay: Option<Duration>,
    hits: AtomicUsize,
    params: Mutex<Vec<HashMap<String, String>>>,
    auth: Mutex<Vec<Option<String>>>,
}

async fn query_range(
    State(state): State<Arc<FakeProm>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    state.params.lock().push(params);
    state.auth.lock().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    if hit < state.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "error"})));
    }

    if state.api_error {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "parse error at char 4",
            })),
        );
    }

    let body: Value = json!({
        "status": "success",
        "warnings": ["results truncated"],
        "data": {
            "resultType": "matrix",
            "result": [{
                "metric": {"job": "tidb", "instance": "tidb-0:10080"},
                "values": [[1704067200, "1"], [1704067500.5, "2.5"]]
            }]
        }
    });
    (StatusCode::OK, Json(body))
}

async fn serve(state: Arc<FakeProm>) -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/query_range", get(query_range))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn source(addr: SocketAddr) -> PrometheusConfig {
    PrometheusConfig {
        name: "prom-a".to_string(),
        address: format!("http://{addr}/"),
        timeout: Some("5s".to_string()),
        username: None,
        password: None,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200 + secs, 0).expect("valid")
}

#[tokio::test]
async fn fetch_sends_range_parameters_and_decodes_matrix() {
    let state = Arc::new(FakeProm::default());
    let addr = serve(Arc::clone(&state)).await;
    let client = Client::new(&source(addr)).expect("client");

    let data = client
        .fetch_range("sum(rate(x[1m]))", t(0), t(3600), Duration::from_secs(300))
        .await
        .expect("fetch");

    let QueryData::Matrix(series) = data else {
        panic!("expected matrix");
    };
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].values.len(), 2);

    let params = state.params.lock();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0]["query"], "sum(rate(x[1m]))");
    assert_eq!(params[0]["start"], "2024-01-01T00:00:00Z");
    assert_eq!(params[0]["end"], "2024-01-01T01:00:00Z");
    assert_eq!(params[0]["step"], "300");

    assert_eq!(state.auth.lock()[0], None);
}

#[tokio::test]
async fn basic_auth_applied_when_configured() {
    let state = Arc::new(FakeProm::default());
    let addr = serve(Arc::clone(&state)).await;

    let mut cfg = source(addr);
    cfg.username = Some("admin".to_string());
    cfg.password = Some("secret".to_string());
    let client = Client::new(&cfg).expect("client");

    client
        .fetch_range("up", t(0), t(60), Duration::from_secs(15))
        .await
        .expect("fetch");

    // base64("admin:secret")
    assert_eq!(
        state.auth.lock()[0].as_deref(),
        Some("Basic YWRtaW46c2VjcmV0")
    );
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let state = Arc::new(FakeProm {
        fail_first: 2,
        ..Default::default()
    });
    let addr = serve(Arc::clone(&state)).await;
    let metrics = Arc::new(RunMetrics::new().expect("metrics"));

    let client = Client::new(&source(addr))
        .expect("client")
        .with_retry_policy(fast_retry(5))
        .with_metrics(Arc::clone(&metrics));

    client
        .fetch_range("up", t(0), t(60), Duration::from_secs(15))
        .await
        .expect("fetch succeeds on third attempt");

    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    assert_eq!(
        metrics
            .fetch_attempts
            .with_label_values(&["prom-a", "error"])
            .get(),
        2.0
    );
    assert_eq!(
        metrics.fetch_retries.with_label_values(&["prom-a"]).get(),
        2.0
    );
}

#[tokio::test]
async fn api_error_exhausts_attempts() {
    let state = Arc::new(FakeProm {
        api_error: true,
        ..Default::default()
    });
    let addr = serve(Arc::clone(&state)).await;
    let metrics = Arc::new(RunMetrics::new().expect("metrics"));

    let client = Client::new(&source(addr))
        .expect("client")
        .with_retry_policy(fast_retry(3))
        .with_metrics(Arc::clone(&metrics));

    let err = client
        .fetch_range("up{", t(0), t(60), Duration::from_secs(15))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
    let message = err.to_string();
    assert!(message.contains("prom-a"));
    assert!(message.contains("parse error at char 4"));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    assert_eq!(
        metrics.fetch_failures.with_label_values(&["prom-a"]).get(),
        1.0
    );
}

#[tokio::test]
async fn unreachable_source_exhausts_attempts() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = Client::new(&source(addr))
        .expect("client")
        .with_retry_policy(fast_retry(2));

    let err = client
        .fetch_range("up", t(0), t(60), Duration::from_secs(15))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn slow_source_times_out_each_attempt() {
    let state = Arc::new(FakeProm {
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let addr = serve(Arc::clone(&state)).await;

    let mut cfg = source(addr);
    cfg.timeout = Some("300ms".to_string());
    let client = Client::new(&cfg)
        .expect("client")
        .with_retry_policy(fast_retry(3));
    assert_eq!(client.timeout(), Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = client
        .fetch_range("up", t(0), t(60), Duration::from_secs(15))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() < Duration::from_secs(5));
}
