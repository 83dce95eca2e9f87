//! Block and chaincode-event → `DecodedRecord`.

use chrono::{DateTime, SecondsFormat, Utc};
use fabriclog_core::{
    Block, ChaincodeEvent, ChannelHeader, DecodedRecord, Envelope, HeaderType, Payload, RawNode,
    RecordKind,
};

use crate::convert::{convert_buffers, to_text};
use crate::decoder::{classify_header_extension, rewrite_invocation_inputs};

fn timestamp_node(ts: Option<DateTime<Utc>>) -> RawNode {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)).into()
}

fn record_kind(header_type: HeaderType) -> RecordKind {
    match header_type {
        HeaderType::EndorserTransaction => RecordKind::EndorserTransaction,
        HeaderType::Config => RecordKind::ConfigTransaction,
        other => RecordKind::Unknown(other.type_string()),
    }
}

fn channel_header_node(ch: &ChannelHeader) -> RawNode {
    RawNode::map()
        .with("type", ch.header_type.as_i32())
        .with("typeString", ch.header_type.type_string().to_uppercase())
        .with("version", ch.version)
        .with("timestamp", timestamp_node(ch.timestamp))
        .with("channel_id", ch.channel_id.as_str())
        .with("tx_id", ch.tx_id.as_str())
        .with("epoch", ch.epoch)
        .with(
            "extension",
            classify_header_extension(&ch.extension, ch.header_type).into_node(),
        )
        .with("tls_cert_hash", ch.tls_cert_hash.clone())
}

fn payload_node(payload: &Payload) -> RawNode {
    let mut data = payload.data.clone();
    if payload.header.channel_header.header_type == HeaderType::EndorserTransaction {
        rewrite_invocation_inputs(&mut data);
    }
    RawNode::map()
        .with(
            "header",
            RawNode::map()
                .with("channel_header", channel_header_node(&payload.header.channel_header))
                .with("signature_header", payload.header.signature_header.clone()),
        )
        .with("data", data)
}

fn envelope_node(env: &Envelope) -> RawNode {
    RawNode::map()
        .with("signature", env.signature.clone())
        .with("payload", env.payload.as_ref().map(payload_node))
}

/// Decode one block into its transaction records followed by the block record.
///
/// Envelopes without a payload are skipped as transactions but kept inside
/// the block record.
pub fn decode_block(channel: &str, block: &Block) -> Vec<DecodedRecord> {
    let mut records = Vec::with_capacity(block.data.len() + 1);
    let mut envelopes = Vec::with_capacity(block.data.len());

    for (index, env) in block.data.iter().enumerate() {
        let node = envelope_node(env);
        envelopes.push(node.clone());

        let Some(payload) = &env.payload else {
            tracing::debug!(channel, block = block.number, index, "ignoring envelope without payload");
            continue;
        };
        let header = &payload.header.channel_header;
        let kind = record_kind(header.header_type);

        let mut tx = RawNode::map()
            .with("type", kind.type_name())
            .with("block_number", block.number);
        if let RawNode::Map(fields) = node {
            for (k, v) in fields {
                tx.insert(k, v);
            }
        }

        records.push(DecodedRecord {
            kind,
            block_number: Some(block.number),
            channel: Some(channel.to_string()),
            timestamp: header.timestamp,
            payload: convert_buffers(tx),
        });
    }

    let metadata: Vec<RawNode> = block.metadata.iter().map(|m| RawNode::from(m.clone())).collect();
    let block_node = RawNode::map()
        .with("type", RecordKind::Block.type_name())
        .with(
            "header",
            RawNode::map()
                .with("number", block.number)
                .with("previous_hash", block.previous_hash.clone())
                .with("data_hash", block.data_hash.clone()),
        )
        .with("data", RawNode::map().with("data", envelopes))
        .with("metadata", RawNode::map().with("metadata", metadata));

    records.push(DecodedRecord {
        kind: RecordKind::Block,
        block_number: Some(block.number),
        channel: Some(channel.to_string()),
        timestamp: block.first_timestamp(),
        payload: convert_buffers(block_node),
    });

    records
}

/// Decode a matched chaincode event.
pub fn decode_chaincode_event(channel: &str, event: &ChaincodeEvent) -> DecodedRecord {
    let node = RawNode::map()
        .with("type", RecordKind::ChaincodeEvent.type_name())
        .with("block_number", event.block_number)
        .with("channel", channel)
        .with("transaction_id", event.tx_id.as_str())
        .with("transaction_status", event.tx_status.clone())
        .with(
            "event",
            RawNode::map()
                .with("chaincode_id", event.chaincode_id.as_str())
                .with("tx_id", event.tx_id.as_str())
                .with("event_name", event.event_name.as_str())
                .with("payload", event.payload.clone()),
        )
        .with("payload_message", to_text(&event.payload));

    DecodedRecord {
        kind: RecordKind::ChaincodeEvent,
        block_number: event.block_number,
        channel: Some(channel.to_string()),
        timestamp: event.timestamp,
        payload: convert_buffers(node),
    }
}
