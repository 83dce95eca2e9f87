//! HEC sink against a local collector stub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use chrono::Utc;
use fabriclog_core::{RetryPolicy, WaitTime};
use fabriclog_output::{EventMetadata, HecConfig, HecSink, OutputEvent, OutputMetrics, Sink};
use serde_json::{json, Value};

#[derive(Default)]
struct Collector {
    /// (path, authorization header, body)
    requests: Mutex<Vec<(String, String, String)>>,
    /// Number of upcoming requests answered with 503.
    fail_next: AtomicUsize,
    healthy: std::sync::atomic::AtomicBool,
}

impl Collector {
    fn requests(&self) -> Vec<(String, String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn collect(
    State(state): State<Arc<Collector>>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let failing = state
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .requests
        .lock()
        .unwrap()
        .push((uri.path().to_string(), auth, body));
    StatusCode::OK
}

async fn health(State(state): State<Arc<Collector>>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn start_collector() -> (String, Arc<Collector>) {
    let state = Arc::new(Collector::default());
    let app = axum::Router::new()
        .route("/services/collector/event/1.0", post(collect))
        .route("/services/collector", post(collect))
        .route("/services/collector/health/1.0", get(health))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn config(url: &str) -> HecConfig {
    let mut cfg = HecConfig::new(url, "secret-token");
    cfg.flush_time = Duration::from_secs(60);
    cfg.retry = RetryPolicy::new(WaitTime::Fixed(Duration::from_millis(5)), 3);
    cfg.default_metadata.index = Some("hyperledger_logs".into());
    cfg
}

fn event(n: u64) -> OutputEvent {
    OutputEvent {
        time: Utc::now(),
        body: json!({"type": "block", "block_number": n}),
        metadata: EventMetadata {
            source: Some("peer0".into()),
            sourcetype: Some("fabric_logger:block".into()),
            ..EventMetadata::default()
        },
    }
}

fn lines(body: &str) -> Vec<Value> {
    body.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
}

#[tokio::test]
async fn flushes_when_queue_is_full() {
    let (url, collector) = start_collector().await;
    let mut cfg = config(&url);
    cfg.max_queue_entries = 2;
    let sink = HecSink::new(cfg).unwrap();

    sink.push_event(event(1)).await.unwrap();
    assert!(collector.requests().is_empty());
    assert_eq!(sink.queued(), (1, 0));

    sink.push_event(event(2)).await.unwrap();
    let requests = collector.requests();
    assert_eq!(requests.len(), 1);
    let (path, auth, body) = &requests[0];
    assert_eq!(path, "/services/collector/event/1.0");
    assert_eq!(auth, "Splunk secret-token");
    let entries = lines(body);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["event"]["block_number"], json!(2));
    assert_eq!(entries[0]["index"], json!("hyperledger_logs"));
    assert_eq!(entries[0]["sourcetype"], json!("fabric_logger:block"));
    assert_eq!(sink.queued(), (0, 0));
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn flushes_on_timer() {
    let (url, collector) = start_collector().await;
    let mut cfg = config(&url);
    cfg.flush_time = Duration::from_millis(30);
    let sink = HecSink::new(cfg).unwrap();

    sink.push_event(event(1)).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while collector.requests().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "timer flush did not happen");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_flush_time_sends_every_push() {
    let (url, collector) = start_collector().await;
    let mut cfg = config(&url);
    cfg.flush_time = Duration::ZERO;
    let sink = HecSink::new(cfg).unwrap();

    sink.push_event(event(1)).await.unwrap();
    sink.push_event(event(2)).await.unwrap();
    assert_eq!(collector.requests().len(), 2);
    assert_eq!(sink.queued(), (0, 0));
    sink.shutdown().await.unwrap();
    assert_eq!(collector.requests().len(), 2);
}

#[tokio::test]
async fn metrics_go_to_collector_endpoint() {
    let (url, collector) = start_collector().await;
    let sink = HecSink::new(config(&format!("{url}/"))).unwrap();

    sink.push_metrics(OutputMetrics {
        time: Utc::now(),
        measurements: [("fabric_ledger_height".to_string(), 9.0)].into(),
        fields: [("channel".to_string(), "C1".to_string())].into(),
        metadata: EventMetadata::default(),
    })
    .await
    .unwrap();
    sink.flush().await.unwrap();

    let requests = collector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "/services/collector");
    let entry = &lines(&requests[0].2)[0];
    assert_eq!(entry["fields"]["metric_name:fabric_ledger_height"], json!(9.0));
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn retries_failed_batches() {
    let (url, collector) = start_collector().await;
    collector.fail_next.store(2, Ordering::SeqCst);
    let sink = HecSink::new(config(&url)).unwrap();

    sink.push_event(event(1)).await.unwrap();
    sink.flush().await.unwrap();
    assert_eq!(collector.requests().len(), 1);
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn gives_up_after_retry_budget() {
    let (url, collector) = start_collector().await;
    collector.fail_next.store(10, Ordering::SeqCst);
    let sink = HecSink::new(config(&url)).unwrap();

    sink.push_event(event(1)).await.unwrap();
    assert!(sink.flush().await.is_err());
    assert!(collector.requests().is_empty());
    assert_eq!(sink.queued(), (0, 0));
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_queue_and_rejects_pushes() {
    let (url, collector) = start_collector().await;
    let sink = HecSink::new(config(&url)).unwrap();

    sink.push_event(event(1)).await.unwrap();
    sink.shutdown().await.unwrap();
    assert_eq!(collector.requests().len(), 1);
    assert!(sink.push_event(event(2)).await.is_err());
    sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn wait_until_available_polls_health() {
    let (url, collector) = start_collector().await;
    let sink = HecSink::new(config(&url)).unwrap();

    let err = sink.wait_until_available(Duration::from_millis(50)).await;
    assert!(err.is_err());

    let flip = Arc::clone(&collector);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        flip.healthy.store(true, Ordering::SeqCst);
    });
    sink.wait_until_available(Duration::from_secs(3)).await.unwrap();
    sink.shutdown().await.unwrap();
}
