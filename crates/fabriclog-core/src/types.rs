//! Shared types for the ingestion pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutputError;

// ─── RecordKind ──────────────────────────────────────────────────────────────

/// The tag of a decoded record. Routing matches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Block,
    EndorserTransaction,
    ConfigTransaction,
    ChaincodeEvent,
    NodeMetrics,
    /// Any other channel-header type, carrying its lower-case type name.
    Unknown(String),
}

impl RecordKind {
    /// The `type` value embedded in record payloads.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Block => "block",
            Self::EndorserTransaction => "endorserTransaction",
            Self::ConfigTransaction => "config",
            Self::ChaincodeEvent => "ccevent",
            Self::NodeMetrics => "nodeMetrics",
            Self::Unknown(name) => name,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

// ─── DecodedRecord ───────────────────────────────────────────────────────────

/// The unit handed to the router.
///
/// `payload` is a `serde_json::Value`, so it cannot hold raw binary leaves:
/// every byte sequence was converted to text or hex by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub kind: RecordKind,
    pub block_number: Option<u64>,
    pub channel: Option<String>,
    /// Event time; the router falls back to ingestion time when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

// ─── MultiMetrics ────────────────────────────────────────────────────────────

/// A scraped set of node metrics sharing one label set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiMetrics {
    pub time: DateTime<Utc>,
    /// Metric name → value.
    pub measurements: BTreeMap<String, f64>,
    /// Label name → value (dimensions).
    pub fields: BTreeMap<String, String>,
    /// Host the metrics were scraped from.
    pub host: Option<String>,
}

// ─── SubscriptionKey ─────────────────────────────────────────────────────────

/// Identity of an active listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// Block subscription, keyed by channel name.
    Channel(String),
    /// Chaincode-event subscription, keyed by (channel, contract, filter).
    ChaincodeEvent {
        channel: String,
        chaincode_id: String,
        filter: String,
    },
}

impl SubscriptionKey {
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }

    pub fn event(
        channel: impl Into<String>,
        chaincode_id: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self::ChaincodeEvent {
            channel: channel.into(),
            chaincode_id: chaincode_id.into(),
            filter: filter.into(),
        }
    }

    pub fn channel_name(&self) -> &str {
        match self {
            Self::Channel(c) => c,
            Self::ChaincodeEvent { channel, .. } => channel,
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(c) => write!(f, "{c}"),
            Self::ChaincodeEvent {
                channel,
                chaincode_id,
                filter,
            } => write!(f, "{channel}_{chaincode_id}_{filter}"),
        }
    }
}

// ─── RecordSink ──────────────────────────────────────────────────────────────

/// Where the listener manager hands decoded records.
///
/// Implemented by `fabriclog_output::Router`; tests use a collecting sink.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Enqueue one record. `source` identifies the peer it came from.
    async fn log_event(&self, record: DecodedRecord, source: &str) -> Result<(), OutputError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_display() {
        assert_eq!(SubscriptionKey::channel("C1").to_string(), "C1");
        assert_eq!(
            SubscriptionKey::event("C1", "mycc", "transfer").to_string(),
            "C1_mycc_transfer"
        );
    }

    #[test]
    fn record_kind_type_names() {
        assert_eq!(RecordKind::EndorserTransaction.type_name(), "endorserTransaction");
        assert_eq!(RecordKind::Unknown("orderer_transaction".into()).to_string(), "orderer_transaction");
    }
}
