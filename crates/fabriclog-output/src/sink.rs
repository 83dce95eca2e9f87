//! The `Sink` trait and the payloads it carries.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabriclog_core::OutputError;
use serde::Serialize;

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Per-event metadata. Unset fields fall back to the sink's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourcetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// One record ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEvent {
    pub time: DateTime<Utc>,
    pub body: serde_json::Value,
    pub metadata: EventMetadata,
}

/// A multi-metric sample: several measurements sharing one dimension set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputMetrics {
    pub time: DateTime<Utc>,
    pub measurements: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
    pub metadata: EventMetadata,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Destination for routed records.
///
/// Implementations are selected once at startup from the `output.type`
/// setting; the router never switches sinks at runtime.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn push_event(&self, event: OutputEvent) -> Result<(), OutputError>;

    async fn push_metrics(&self, metrics: OutputMetrics) -> Result<(), OutputError>;

    /// Deliver anything queued. Unbuffered sinks return immediately.
    async fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    /// Flush and release resources. Pushes after shutdown fail with `Closed`.
    async fn shutdown(&self) -> Result<(), OutputError> {
        self.flush().await
    }
}

// ─── NullSink ────────────────────────────────────────────────────────────────

/// Drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn push_event(&self, _event: OutputEvent) -> Result<(), OutputError> {
        Ok(())
    }

    async fn push_metrics(&self, _metrics: OutputMetrics) -> Result<(), OutputError> {
        Ok(())
    }
}

// ─── MemorySink ──────────────────────────────────────────────────────────────

/// Keeps every pushed payload in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<OutputEvent>>,
    metrics: Mutex<Vec<OutputMetrics>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<OutputMetrics> {
        self.metrics.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push_event(&self, event: OutputEvent) -> Result<(), OutputError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn push_metrics(&self, metrics: OutputMetrics) -> Result<(), OutputError> {
        self.metrics.lock().unwrap().push(metrics);
        Ok(())
    }
}
