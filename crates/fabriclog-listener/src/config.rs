//! Listener configuration.

use fabriclog_core::RetryPolicy;

/// A chaincode-event subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    pub channel: String,
    pub chaincode_id: String,
    /// Event-name filter expression, `.*` for all events.
    pub filter: String,
    /// Used when no checkpoint exists for `(channel, chaincode_id)`.
    pub start_block: Option<u64>,
}

impl EventSubscription {
    pub fn new(
        channel: impl Into<String>,
        chaincode_id: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chaincode_id: chaincode_id.into(),
            filter: filter.into(),
            start_block: None,
        }
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Peer the subscriptions connect through; also the `source` of records.
    pub peer: String,
    pub msp: String,
    /// Channels that must be listened to.
    pub channels: Vec<String>,
    /// Chaincode-event subscriptions that must be established.
    pub ccevents: Vec<EventSubscription>,
    /// First block requested for a channel without checkpoint.
    pub start_block: u64,
    /// Policy for re-registering a subscription after its stream fails.
    pub retry: RetryPolicy,
}

impl ListenerConfig {
    pub fn new(peer: impl Into<String>, msp: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            msp: msp.into(),
            channels: vec![],
            ccevents: vec![],
            start_block: 0,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_ccevent(mut self, sub: EventSubscription) -> Self {
        self.ccevents.push(sub);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
