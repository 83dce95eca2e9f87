//! `Router` — labels decoded records and hands them to the configured sink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fabriclog_core::{DecodedRecord, MultiMetrics, OutputError, RecordKind, RecordSink};
use serde::Deserialize;
use tracing::debug;

use crate::sink::{EventMetadata, OutputEvent, OutputMetrics, Sink};

pub const DEFAULT_SOURCETYPE_PREFIX: &str = "fabric_logger";

/// Per-kind label overrides. Unset kinds use `{prefix}:{default suffix}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceTypes {
    pub block: Option<String>,
    pub endorser_transaction: Option<String>,
    pub ccevent: Option<String>,
    pub config: Option<String>,
    pub node_metrics: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub sourcetype_prefix: String,
    pub sourcetypes: SourceTypes,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sourcetype_prefix: DEFAULT_SOURCETYPE_PREFIX.to_string(),
            sourcetypes: SourceTypes::default(),
        }
    }
}

impl RouterConfig {
    /// The category label (`sourcetype`) for a record kind.
    pub fn label(&self, kind: &RecordKind) -> String {
        let (configured, suffix) = match kind {
            RecordKind::Block => (&self.sourcetypes.block, "block"),
            RecordKind::EndorserTransaction => {
                (&self.sourcetypes.endorser_transaction, "endorser_transaction")
            }
            RecordKind::ConfigTransaction => (&self.sourcetypes.config, "config"),
            RecordKind::ChaincodeEvent => (&self.sourcetypes.ccevent, "ccevent"),
            RecordKind::NodeMetrics => (&self.sourcetypes.node_metrics, "nodeMetrics"),
            RecordKind::Unknown(tag) => return format!("{}:{tag}", self.sourcetype_prefix),
        };
        configured
            .clone()
            .unwrap_or_else(|| format!("{}:{suffix}", self.sourcetype_prefix))
    }
}

/// Routes ledger records and node metrics to one sink.
pub struct Router {
    sink: Arc<dyn Sink>,
    config: RouterConfig,
}

impl Router {
    pub fn new(sink: Arc<dyn Sink>, config: RouterConfig) -> Self {
        Self { sink, config }
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Build the sink payload for a record. Records without an event time
    /// are stamped with the current time.
    pub fn to_output_event(&self, record: DecodedRecord, source: &str) -> OutputEvent {
        OutputEvent {
            time: record.timestamp.unwrap_or_else(Utc::now),
            metadata: EventMetadata {
                source: Some(source.to_string()),
                sourcetype: Some(self.config.label(&record.kind)),
                ..EventMetadata::default()
            },
            body: record.payload,
        }
    }

    /// Route one scraped metrics sample under the node-metrics label.
    pub async fn log_multi_metrics(&self, metrics: MultiMetrics) -> Result<(), OutputError> {
        let out = OutputMetrics {
            time: metrics.time,
            measurements: metrics.measurements,
            fields: metrics.fields,
            metadata: EventMetadata {
                sourcetype: Some(self.config.label(&RecordKind::NodeMetrics)),
                host: metrics.host,
                ..EventMetadata::default()
            },
        };
        self.sink.push_metrics(out).await
    }

    pub async fn flush(&self) -> Result<(), OutputError> {
        self.sink.flush().await
    }

    pub async fn shutdown(&self) -> Result<(), OutputError> {
        self.sink.shutdown().await
    }
}

#[async_trait]
impl RecordSink for Router {
    async fn log_event(&self, record: DecodedRecord, source: &str) -> Result<(), OutputError> {
        let event = self.to_output_event(record, source);
        debug!(
            sourcetype = event.metadata.sourcetype.as_deref().unwrap_or_default(),
            source,
            sink = self.sink.name(),
            "routing record"
        );
        self.sink.push_event(event).await
    }
}
