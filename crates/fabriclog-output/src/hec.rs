//! HTTP Event Collector sink backed by `reqwest`.
//!
//! Events and metrics are serialized on push and queued in memory. A queue
//! is flushed when it reaches `max_queue_entries`, every `flush_time`, and on
//! `flush()`/`shutdown()`. Each flush posts one newline-delimited batch per
//! queue and retries it with the sink's own `RetryPolicy`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabriclog_core::{OutputError, RetryPolicy, WaitTime};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::sink::{EventMetadata, OutputEvent, OutputMetrics, Sink};

pub const EVENT_PATH: &str = "/services/collector/event/1.0";
pub const METRICS_PATH: &str = "/services/collector";
pub const HEALTH_PATH: &str = "/services/collector/health/1.0";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HecConfig {
    /// Base URL. A `/services/collector...` suffix is stripped.
    pub url: String,
    pub token: String,
    pub default_metadata: EventMetadata,
    /// Merged into the `fields` of every event and metric.
    pub default_fields: BTreeMap<String, Value>,
    pub max_queue_entries: usize,
    pub flush_time: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub validate_certificate: bool,
    pub user_agent: String,
}

impl HecConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            default_metadata: EventMetadata::default(),
            default_fields: BTreeMap::new(),
            max_queue_entries: 1000,
            flush_time: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(WaitTime::Fixed(Duration::from_secs(1)), 5),
            validate_certificate: true,
            user_agent: format!("fabriclog-hec-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn base_url(&self) -> &str {
        match self.url.find("/services/collector") {
            Some(i) => &self.url[..i],
            None => self.url.trim_end_matches('/'),
        }
    }
}

// ─── Serialization ───────────────────────────────────────────────────────────

fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

fn insert_metadata(obj: &mut Map<String, Value>, meta: &EventMetadata, defaults: &EventMetadata) {
    let pairs = [
        ("source", &meta.source, &defaults.source),
        ("sourcetype", &meta.sourcetype, &defaults.sourcetype),
        ("index", &meta.index, &defaults.index),
        ("host", &meta.host, &defaults.host),
    ];
    for (key, value, default) in pairs {
        if let Some(v) = value.as_ref().or(default.as_ref()) {
            obj.insert(key.to_string(), Value::String(v.clone()));
        }
    }
}

fn default_fields(config: &HecConfig) -> Map<String, Value> {
    config
        .default_fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// One HEC event line.
pub fn serialize_event(event: &OutputEvent, config: &HecConfig) -> Result<String, OutputError> {
    let mut obj = Map::new();
    obj.insert("time".into(), Value::from(epoch_seconds(event.time)));
    obj.insert("event".into(), event.body.clone());
    insert_metadata(&mut obj, &event.metadata, &config.default_metadata);
    if !config.default_fields.is_empty() {
        obj.insert("fields".into(), Value::Object(default_fields(config)));
    }
    Ok(serde_json::to_string(&Value::Object(obj))?)
}

/// One HEC multi-metric line: `metric_name:<name>` fields plus dimensions.
pub fn serialize_metrics(metrics: &OutputMetrics, config: &HecConfig) -> Result<String, OutputError> {
    let mut fields = default_fields(config);
    for (k, v) in &metrics.fields {
        fields.insert(k.clone(), Value::String(v.clone()));
    }
    for (name, value) in &metrics.measurements {
        fields.insert(format!("metric_name:{name}"), Value::from(*value));
    }

    let mut obj = Map::new();
    obj.insert("time".into(), Value::from(epoch_seconds(metrics.time)));
    obj.insert("event".into(), Value::String("metric".into()));
    insert_metadata(&mut obj, &metrics.metadata, &config.default_metadata);
    obj.insert("fields".into(), Value::Object(fields));
    Ok(serde_json::to_string(&Value::Object(obj))?)
}

// ─── Client ──────────────────────────────────────────────────────────────────

struct HecInner {
    config: HecConfig,
    http: reqwest::Client,
    events: Mutex<Vec<String>>,
    metrics: Mutex<Vec<String>>,
    /// Serializes batch delivery so batches leave in queue order.
    sending: tokio::sync::Mutex<()>,
}

impl HecInner {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url())
    }

    async fn post(&self, path: &'static str, body: String) -> Result<(), OutputError> {
        let resp = self
            .http
            .post(self.endpoint(path))
            .header(AUTHORIZATION, format!("Splunk {}", self.config.token))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| OutputError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(OutputError::Http(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }

    async fn send_batch(&self, path: &'static str, lines: Vec<String>) -> Result<(), OutputError> {
        if lines.is_empty() {
            return Ok(());
        }
        let count = lines.len();
        let body = lines.join("\n");
        let task = format!("hec-post[{path}]");
        self.config
            .retry
            .retry(&task, |_| self.post(path, body.clone()))
            .await
            .map_err(|exhausted| {
                error!(
                    path,
                    entries = count,
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "dropping HEC batch after exhausting retries"
                );
                OutputError::Http(format!(
                    "batch of {count} entries failed after {} attempts: {}",
                    exhausted.attempts, exhausted.last
                ))
            })?;
        debug!(path, entries = count, "flushed HEC batch");
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        let _sending = self.sending.lock().await;
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        let metrics = std::mem::take(&mut *self.metrics.lock().unwrap());

        let events_result = self.send_batch(EVENT_PATH, events).await;
        let metrics_result = self.send_batch(METRICS_PATH, metrics).await;
        events_result.and(metrics_result)
    }

    async fn check_health(&self) -> Result<(), OutputError> {
        let resp = self
            .http
            .get(self.endpoint(HEALTH_PATH))
            .header(AUTHORIZATION, format!("Splunk {}", self.config.token))
            .send()
            .await
            .map_err(|e| OutputError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(OutputError::Http(format!("HTTP {}", resp.status().as_u16())))
        }
    }
}

async fn flush_loop(inner: Arc<HecInner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.flush_time);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.flush().await {
                    warn!(error = %e, "periodic HEC flush failed");
                }
            }
        }
    }
}

/// Sink posting to a Splunk HTTP Event Collector.
pub struct HecSink {
    inner: Arc<HecInner>,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl HecSink {
    /// Build the client and start the periodic flusher. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: HecConfig) -> Result<Self, OutputError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(!config.validate_certificate)
            .build()
            .map_err(|e| OutputError::Http(e.to_string()))?;

        info!(url = %config.base_url(), "using Splunk HEC output");
        let inner = Arc::new(HecInner {
            config,
            http,
            events: Mutex::new(Vec::new()),
            metrics: Mutex::new(Vec::new()),
            sending: tokio::sync::Mutex::new(()),
        });
        let (stop, stop_rx) = watch::channel(false);
        // A zero flush time flushes on every push instead of on a timer.
        let flusher = if inner.config.flush_time.is_zero() {
            None
        } else {
            Some(tokio::spawn(flush_loop(Arc::clone(&inner), stop_rx)))
        };

        Ok(Self {
            inner,
            closed: AtomicBool::new(false),
            stop,
            flusher: Mutex::new(flusher),
        })
    }

    /// Poll the collector health endpoint until it answers or `max_time`
    /// elapses.
    pub async fn wait_until_available(&self, max_time: Duration) -> Result<(), OutputError> {
        let deadline = tokio::time::Instant::now() + max_time;
        loop {
            match self.inner.check_health().await {
                Ok(()) => {
                    info!("HEC is available");
                    return Ok(());
                }
                Err(e) => debug!(error = %e, "HEC not available yet"),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OutputError::Unavailable {
                    ms: max_time.as_millis() as u64,
                });
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Queued entries not yet delivered (events, metrics).
    pub fn queued(&self) -> (usize, usize) {
        (
            self.inner.events.lock().unwrap().len(),
            self.inner.metrics.lock().unwrap().len(),
        )
    }

    async fn enqueue(&self, queue: &Mutex<Vec<String>>, line: String) -> Result<(), OutputError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OutputError::Closed);
        }
        let full = {
            let mut q = queue.lock().unwrap();
            q.push(line);
            q.len() >= self.inner.config.max_queue_entries || self.inner.config.flush_time.is_zero()
        };
        if full {
            self.inner.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for HecSink {
    fn name(&self) -> &'static str {
        "hec"
    }

    async fn push_event(&self, event: OutputEvent) -> Result<(), OutputError> {
        let line = serialize_event(&event, &self.inner.config)?;
        self.enqueue(&self.inner.events, line).await
    }

    async fn push_metrics(&self, metrics: OutputMetrics) -> Result<(), OutputError> {
        let line = serialize_metrics(&metrics, &self.inner.config)?;
        self.enqueue(&self.inner.metrics, line).await
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.inner.flush().await
    }

    async fn shutdown(&self) -> Result<(), OutputError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stop.send(true);
        let flusher = self.flusher.lock().unwrap().take();
        if let Some(handle) = flusher {
            let _ = handle.await;
        }
        info!("flushing HEC queue before shutdown");
        self.inner.flush().await
    }
}
