//! fabriclog-listener — owns block and chaincode-event subscriptions.
//!
//! The [`ListenerManager`] resumes subscriptions recorded in the checkpoint
//! store, adds configured ones, and keeps each alive with a bounded retry
//! loop. Delivered items flow through a bounded stream per subscription:
//!
//! ```text
//! LedgerClient ──► ChannelHub ──► LedgerStream<Block | ChaincodeEvent>
//!                                        │
//!                      subscription task (resume guard, decode)
//!                                        │
//!                          RecordSink ◄──┴──► CheckpointStore
//! ```

pub mod config;
pub mod manager;
pub mod mock;
pub mod source;

pub use config::{EventSubscription, ListenerConfig};
pub use manager::{ListenerManager, RegisterOutcome, SubscriptionState};
pub use mock::{CollectingSink, MockLedgerClient};
pub use source::{BlockStream, ChannelHub, EventStream, LedgerClient, LedgerStream};
