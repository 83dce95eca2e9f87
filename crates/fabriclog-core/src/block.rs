//! Delivered ledger model — the shapes handed over by the ledger client.
//!
//! The client has already unmarshalled the outer block/envelope structure;
//! the binary substructures (header extension, invocation arguments) are
//! still raw and get decoded by `fabriclog-decode`.

use chrono::{DateTime, Utc};

use crate::node::RawNode;

// ─── HeaderType ──────────────────────────────────────────────────────────────

/// The `common.HeaderType` of a channel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderType {
    Message,
    Config,
    ConfigUpdate,
    EndorserTransaction,
    OrdererTransaction,
    DeliverSeekInfo,
    ChaincodePackage,
    PeerAdminOperation,
    Other(i32),
}

impl HeaderType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Message,
            1 => Self::Config,
            2 => Self::ConfigUpdate,
            3 => Self::EndorserTransaction,
            4 => Self::OrdererTransaction,
            5 => Self::DeliverSeekInfo,
            6 => Self::ChaincodePackage,
            8 => Self::PeerAdminOperation,
            other => Self::Other(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Message => 0,
            Self::Config => 1,
            Self::ConfigUpdate => 2,
            Self::EndorserTransaction => 3,
            Self::OrdererTransaction => 4,
            Self::DeliverSeekInfo => 5,
            Self::ChaincodePackage => 6,
            Self::PeerAdminOperation => 8,
            Self::Other(v) => *v,
        }
    }

    /// Lower-case type name, e.g. `"endorser_transaction"`.
    pub fn type_string(&self) -> String {
        match self {
            Self::Message => "message".into(),
            Self::Config => "config".into(),
            Self::ConfigUpdate => "config_update".into(),
            Self::EndorserTransaction => "endorser_transaction".into(),
            Self::OrdererTransaction => "orderer_transaction".into(),
            Self::DeliverSeekInfo => "deliver_seek_info".into(),
            Self::ChaincodePackage => "chaincode_package".into(),
            Self::PeerAdminOperation => "peer_admin_operation".into(),
            Self::Other(v) => format!("unknown_{v}"),
        }
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A finalized block as delivered for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub number: u64,
    pub previous_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
    /// One envelope per transaction, in block order.
    pub data: Vec<Envelope>,
    /// Block metadata entries (signatures, last config, tx filter, ...).
    pub metadata: Vec<Vec<u8>>,
}

impl Block {
    /// Timestamp of the first transaction, used as the block's event time.
    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.data
            .first()
            .and_then(|env| env.payload.as_ref())
            .and_then(|p| p.header.channel_header.timestamp)
    }
}

/// A signed transaction envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub signature: Vec<u8>,
    /// `None` for entries the client could not unmarshal; these are skipped.
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub header: Header,
    /// Type-specific transaction body (actions, config envelope, ...).
    pub data: RawNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub channel_header: ChannelHeader,
    pub signature_header: RawNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHeader {
    pub header_type: HeaderType,
    pub version: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub channel_id: String,
    pub tx_id: String,
    pub epoch: u64,
    /// Binary header extension; for endorser transactions a `ChaincodeHeaderExtension`
    /// or `ChaincodeAction` message.
    pub extension: Vec<u8>,
    pub tls_cert_hash: Vec<u8>,
}

impl ChannelHeader {
    pub fn new(header_type: HeaderType, channel_id: impl Into<String>, tx_id: impl Into<String>) -> Self {
        Self {
            header_type,
            version: 0,
            timestamp: None,
            channel_id: channel_id.into(),
            tx_id: tx_id.into(),
            epoch: 0,
            extension: vec![],
            tls_cert_hash: vec![],
        }
    }
}

// ─── ChaincodeEvent ──────────────────────────────────────────────────────────

/// A chaincode event matched by a contract listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    pub payload: Vec<u8>,
    /// Enclosing block, when the client reports it.
    pub block_number: Option<u64>,
    /// Validation code of the enclosing transaction, e.g. `"VALID"`.
    pub tx_status: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_type_roundtrip() {
        for v in [0, 1, 2, 3, 4, 5, 6, 8, 42] {
            assert_eq!(HeaderType::from_i32(v).as_i32(), v);
        }
        assert_eq!(HeaderType::from_i32(3).type_string(), "endorser_transaction");
        assert_eq!(HeaderType::from_i32(42), HeaderType::Other(42));
    }

    #[test]
    fn first_timestamp_skips_nothing_on_empty_block() {
        let block = Block {
            number: 1,
            previous_hash: vec![],
            data_hash: vec![],
            data: vec![],
            metadata: vec![],
        };
        assert!(block.first_timestamp().is_none());
    }
}
