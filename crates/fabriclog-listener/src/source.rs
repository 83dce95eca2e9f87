//! Ledger client boundary.
//!
//! The client SDK owns transport, identity and discovery. The listener only
//! needs to open a channel and ask for ordered streams starting at a block.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use fabriclog_core::{Block, ChaincodeEvent, LedgerError};
use futures::Stream;

/// Items delivered in increasing block order for one subscription.
pub type LedgerStream<T> = Pin<Box<dyn Stream<Item = Result<T, LedgerError>> + Send>>;

pub type BlockStream = LedgerStream<Block>;
pub type EventStream = LedgerStream<ChaincodeEvent>;

/// A connection to one channel through the configured peer.
#[async_trait]
pub trait ChannelHub: Send + Sync {
    fn channel(&self) -> &str;

    /// Full blocks from `start` onwards.
    async fn block_stream(&self, start: u64) -> Result<BlockStream, LedgerError>;

    /// Events of `chaincode_id` whose name matches `filter`, from `start` onwards.
    async fn contract_stream(
        &self,
        chaincode_id: &str,
        filter: &str,
        start: u64,
    ) -> Result<EventStream, LedgerError>;

    fn is_connected(&self) -> bool;

    /// Close every stream opened through this hub.
    async fn disconnect(&self);
}

/// Session factory of the ledger client SDK.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fails with [`LedgerError::PeerNotAssigned`] when the connection profile
    /// does not associate `peer` with `channel`.
    async fn open_channel(&self, channel: &str, peer: &str)
        -> Result<Arc<dyn ChannelHub>, LedgerError>;

    /// Associate `peer` with the channel object.
    async fn assign_peer(&self, channel: &str, peer: &str, msp: &str) -> Result<(), LedgerError>;
}
