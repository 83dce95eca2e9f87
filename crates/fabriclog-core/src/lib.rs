//! fabriclog-core — foundation for the checkpointed Fabric event-ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! ListenerManager (fabriclog-listener)
//!        ├── CheckpointStore   (durable resume positions, serialized writes)
//!        ├── RetryPolicy       (fixed / linear / exponential wait times)
//!        ├── decoder           (fabriclog-decode: Block → DecodedRecord)
//!        └── RecordSink        (fabriclog-output: Router → HEC / file / console)
//! ```
//!
//! This crate holds everything the other crates share: the delivered block
//! model, the `RawNode` payload tree, decoded record types, the error
//! taxonomy, the checkpoint store and the retry policy.

pub mod block;
pub mod checkpoint;
pub mod error;
pub mod node;
pub mod retry;
pub mod types;

pub use block::{Block, ChaincodeEvent, ChannelHeader, Envelope, Header, HeaderType, Payload};
pub use checkpoint::{
    CheckpointBackend, CheckpointSet, CheckpointStore, EventCheckpoint, FileBackend, MemoryBackend,
};
pub use error::{CheckpointError, DecodeError, LedgerError, ListenerError, OutputError};
pub use node::RawNode;
pub use retry::{RetryPolicy, WaitTime};
pub use types::{DecodedRecord, MultiMetrics, RecordKind, RecordSink, SubscriptionKey};
