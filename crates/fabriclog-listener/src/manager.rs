//! `ListenerManager` — subscription lifecycle, resume and retry.
//!
//! State machine per subscription key:
//!
//! ```text
//! Unregistered → Registering → Active → Error → Registering → Active
//!                                          └──→ Closed (retries exhausted)
//! ```
//!
//! Each active subscription is driven by its own task that consumes a
//! bounded stream from the ledger client. Within one subscription, records
//! are handed to the sink before the checkpoint advances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fabriclog_core::{
    Block, ChaincodeEvent, CheckpointStore, LedgerError, ListenerError, RecordSink, RetryPolicy,
    SubscriptionKey,
};
use fabriclog_decode::{decode_block, decode_chaincode_event};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EventSubscription, ListenerConfig};
use crate::source::{ChannelHub, LedgerClient, LedgerStream};

/// Filter used when a resumed event checkpoint carries none.
const DEFAULT_EVENT_FILTER: &str = ".*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Registering,
    Active,
    /// Stream failed; the subscription task is re-registering.
    Error,
    /// Retries exhausted. The key may be registered again.
    Closed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Error => "error",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

struct Entry {
    state: SubscriptionState,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn registering() -> Self {
        Self {
            state: SubscriptionState::Registering,
            cancel: None,
            task: None,
        }
    }

    fn is_live(&self) -> bool {
        self.state != SubscriptionState::Closed
    }
}

struct Shared {
    client: Arc<dyn LedgerClient>,
    checkpoints: CheckpointStore,
    sink: Arc<dyn RecordSink>,
    config: ListenerConfig,
    subscriptions: Mutex<HashMap<SubscriptionKey, Entry>>,
    shut_down: AtomicBool,
}

impl Shared {
    fn set_state(&self, key: &SubscriptionKey, state: SubscriptionState) {
        if let Some(entry) = self.subscriptions.lock().unwrap().get_mut(key) {
            entry.state = state;
        }
    }

    /// Open a channel hub, associating the peer with the channel and trying
    /// once more if the connection profile did not.
    async fn open_hub(&self, channel: &str) -> Result<Arc<dyn ChannelHub>, LedgerError> {
        let peer = &self.config.peer;
        match self.client.open_channel(channel, peer).await {
            Err(e) if e.is_peer_not_assigned() => {
                info!(peer = %peer, channel, "assigning peer to channel");
                self.client.assign_peer(channel, peer, &self.config.msp).await?;
                self.client.open_channel(channel, peer).await
            }
            other => other,
        }
    }
}

// ─── Feeds ───────────────────────────────────────────────────────────────────

/// One kind of subscription: how to (re)open its stream and handle its items.
#[async_trait]
trait Feed: Send + Sync + 'static {
    type Item: Send + 'static;

    fn key(&self) -> SubscriptionKey;

    /// Open the stream from the current resume point.
    async fn open(
        &self,
        shared: &Shared,
    ) -> Result<(Arc<dyn ChannelHub>, LedgerStream<Self::Item>), LedgerError>;

    async fn handle(&mut self, shared: &Shared, item: Self::Item);
}

/// Drops redelivered blocks: anything at or below the last processed block.
#[derive(Debug, Clone, Copy)]
struct ResumeGuard {
    last: Option<u64>,
}

impl ResumeGuard {
    fn accepts(&self, block: u64) -> bool {
        self.last.map_or(true, |last| block > last)
    }

    fn advance(&mut self, block: u64) {
        self.last = Some(self.last.map_or(block, |last| last.max(block)));
    }
}

struct BlockFeed {
    channel: String,
    guard: ResumeGuard,
    start_block: u64,
}

#[async_trait]
impl Feed for BlockFeed {
    type Item = Block;

    fn key(&self) -> SubscriptionKey {
        SubscriptionKey::channel(&self.channel)
    }

    async fn open(&self, shared: &Shared) -> Result<(Arc<dyn ChannelHub>, LedgerStream<Block>), LedgerError> {
        let hub = shared.open_hub(&self.channel).await?;
        let start = self.guard.last.map_or(self.start_block, |last| last + 1);
        info!(channel = %self.channel, start, "subscribing to blocks");
        let stream = hub.block_stream(start).await?;
        Ok((hub, stream))
    }

    async fn handle(&mut self, shared: &Shared, block: Block) {
        let number = block.number;
        if !self.guard.accepts(number) {
            debug!(channel = %self.channel, block = number, "ignoring already processed block");
            return;
        }
        debug!(channel = %self.channel, block = number, "processing block");

        for record in decode_block(&self.channel, &block) {
            if let Err(e) = shared.sink.log_event(record, &shared.config.peer).await {
                warn!(channel = %self.channel, block = number, error = %e, "failed to route record");
            }
        }
        if let Err(e) = shared.checkpoints.store_channel_checkpoint(&self.channel, number) {
            warn!(channel = %self.channel, block = number, error = %e, "failed to store channel checkpoint");
        }
        self.guard.advance(number);
        info!(channel = %self.channel, block = number, "completed processing block");
    }
}

struct EventFeed {
    sub: EventSubscription,
    /// Events in blocks strictly below this are redeliveries.
    floor: u64,
}

#[async_trait]
impl Feed for EventFeed {
    type Item = ChaincodeEvent;

    fn key(&self) -> SubscriptionKey {
        SubscriptionKey::event(&self.sub.channel, &self.sub.chaincode_id, &self.sub.filter)
    }

    async fn open(
        &self,
        shared: &Shared,
    ) -> Result<(Arc<dyn ChannelHub>, LedgerStream<ChaincodeEvent>), LedgerError> {
        let hub = shared.open_hub(&self.sub.channel).await?;
        info!(
            channel = %self.sub.channel,
            chaincode = %self.sub.chaincode_id,
            filter = %self.sub.filter,
            start = self.floor,
            "subscribing to chaincode events"
        );
        let stream = hub
            .contract_stream(&self.sub.chaincode_id, &self.sub.filter, self.floor)
            .await?;
        Ok((hub, stream))
    }

    async fn handle(&mut self, shared: &Shared, event: ChaincodeEvent) {
        let channel = &self.sub.channel;
        if let Some(block) = event.block_number {
            if block < self.floor {
                debug!(channel = %channel, block, tx = %event.tx_id, "ignoring already processed event");
                return;
            }
        }

        let record = decode_chaincode_event(channel, &event);
        if let Err(e) = shared.sink.log_event(record, &shared.config.peer).await {
            warn!(channel = %channel, tx = %event.tx_id, error = %e, "failed to route chaincode event");
        }
        if let Some(block) = event.block_number {
            if let Err(e) = shared.checkpoints.store_event_checkpoint(
                channel,
                &self.sub.chaincode_id,
                Some(&self.sub.filter),
                block,
            ) {
                warn!(channel = %channel, block, error = %e, "failed to store event checkpoint");
            }
            self.floor = self.floor.max(block);
        }
        info!(
            channel = %channel,
            block = ?event.block_number,
            tx = %event.tx_id,
            status = ?event.tx_status,
            "completed processing chaincode event"
        );
    }
}

// ─── Subscription task ───────────────────────────────────────────────────────

async fn reopen<F: Feed>(
    shared: &Shared,
    feed: &F,
    key: &SubscriptionKey,
    cancel: &mut watch::Receiver<bool>,
) -> Option<(Arc<dyn ChannelHub>, LedgerStream<F::Item>)> {
    let task = key.to_string();
    let attempt = shared.config.retry.retry(&task, |_| feed.open(shared));
    tokio::select! {
        biased;
        _ = cancel.changed() => None,
        result = attempt => match result {
            Ok(opened) => Some(opened),
            Err(exhausted) => {
                error!(
                    key = %key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "subscription closed after exhausting retries"
                );
                None
            }
        },
    }
}

async fn drive<F: Feed>(
    shared: Arc<Shared>,
    key: SubscriptionKey,
    mut feed: F,
    mut hub: Arc<dyn ChannelHub>,
    mut stream: LedgerStream<F::Item>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(item)) => {
                feed.handle(&shared, item).await;
                continue;
            }
            Some(Err(e)) => warn!(key = %key, error = %e, "subscription stream failed"),
            None => warn!(key = %key, "subscription stream closed by upstream"),
        }

        hub.disconnect().await;
        shared.set_state(&key, SubscriptionState::Error);

        match reopen(&shared, &feed, &key, &mut cancel).await {
            Some((new_hub, new_stream)) => {
                hub = new_hub;
                stream = new_stream;
                shared.set_state(&key, SubscriptionState::Active);
                info!(key = %key, "subscription re-established");
            }
            None => {
                shared.set_state(&key, SubscriptionState::Closed);
                return;
            }
        }
    }
    hub.disconnect().await;
    debug!(key = %key, "subscription task stopped");
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Owns every block and chaincode-event subscription.
#[derive(Clone)]
pub struct ListenerManager {
    shared: Arc<Shared>,
}

impl ListenerManager {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        checkpoints: CheckpointStore,
        sink: Arc<dyn RecordSink>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                checkpoints,
                sink,
                config,
                subscriptions: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Resume every checkpointed subscription, then add configured ones that
    /// are not active yet.
    ///
    /// Resumed subscriptions are optional: exhausting their retries is logged.
    /// Configured subscriptions are required and their failure is returned.
    pub async fn listen(&self, policy: &RetryPolicy) -> Result<(), ListenerError> {
        let checkpoints = &self.shared.checkpoints;

        for channel in checkpoints.list_channels() {
            info!(channel = %channel, "resuming channel listener");
            if let Err(e) = self.register_listener_with_retry(&channel, policy).await {
                error!(channel = %channel, error = %e, "failed to resume channel listener");
            }
        }
        for cp in checkpoints.list_event_subscriptions() {
            let filter = cp.filter.clone().unwrap_or_else(|| DEFAULT_EVENT_FILTER.to_string());
            let sub = EventSubscription::new(&cp.channel_name, &cp.chaincode_id, filter);
            info!(key = %cp.key(), "resuming chaincode event listener");
            if let Err(e) = self.register_chaincode_event_with_retry(sub, policy).await {
                error!(key = %cp.key(), error = %e, "failed to resume chaincode event listener");
            }
        }

        for channel in self.shared.config.channels.clone() {
            if !self.has_listener(&channel) {
                self.register_listener_with_retry(&channel, policy).await?;
            }
        }
        for sub in self.shared.config.ccevents.clone() {
            if !self.has_event_listener(&sub.channel, &sub.chaincode_id, &sub.filter) {
                self.register_chaincode_event_with_retry(sub, policy).await?;
            }
        }
        Ok(())
    }

    /// Subscribe to full blocks of `channel`, resuming after its checkpoint.
    pub async fn register_listener(&self, channel: &str) -> Result<RegisterOutcome, ListenerError> {
        let last = self.shared.checkpoints.channel_checkpoint(channel);
        self.register(BlockFeed {
            channel: channel.to_string(),
            guard: ResumeGuard { last },
            start_block: self.shared.config.start_block,
        })
        .await
    }

    /// Subscribe to chaincode events, replaying from the stored event
    /// checkpoint (inclusive) or the requested start block.
    pub async fn register_chaincode_event(
        &self,
        sub: EventSubscription,
    ) -> Result<RegisterOutcome, ListenerError> {
        let floor = self
            .shared
            .checkpoints
            .event_checkpoint(&sub.channel, &sub.chaincode_id)
            .map(|cp| cp.block)
            .or(sub.start_block)
            .unwrap_or(self.shared.config.start_block);
        self.register(EventFeed { sub, floor }).await
    }

    pub async fn register_listener_with_retry(
        &self,
        channel: &str,
        policy: &RetryPolicy,
    ) -> Result<RegisterOutcome, ListenerError> {
        let key = SubscriptionKey::channel(channel).to_string();
        policy
            .retry(&key, |_| self.register_listener(channel))
            .await
            .map_err(|exhausted| exhausted_error(key, exhausted.attempts, exhausted.last))
    }

    pub async fn register_chaincode_event_with_retry(
        &self,
        sub: EventSubscription,
        policy: &RetryPolicy,
    ) -> Result<RegisterOutcome, ListenerError> {
        let key = SubscriptionKey::event(&sub.channel, &sub.chaincode_id, &sub.filter).to_string();
        policy
            .retry(&key, |_| self.register_chaincode_event(sub.clone()))
            .await
            .map_err(|exhausted| exhausted_error(key, exhausted.attempts, exhausted.last))
    }

    async fn register<F: Feed>(&self, feed: F) -> Result<RegisterOutcome, ListenerError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(ListenerError::ShutDown);
        }
        let key = feed.key();
        {
            let mut subs = self.shared.subscriptions.lock().unwrap();
            if subs.get(&key).is_some_and(Entry::is_live) {
                debug!(key = %key, "already registered");
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            subs.insert(key.clone(), Entry::registering());
        }

        let (hub, stream) = match feed.open(&self.shared).await {
            Ok(opened) => opened,
            Err(e) => {
                let mut subs = self.shared.subscriptions.lock().unwrap();
                if subs.get(&key).is_some_and(|entry| entry.state == SubscriptionState::Registering) {
                    subs.remove(&key);
                }
                warn!(key = %key, error = %e, "failed to register subscription");
                return Err(e.into());
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let installed = {
            let mut subs = self.shared.subscriptions.lock().unwrap();
            match subs.get_mut(&key) {
                Some(entry) => {
                    entry.state = SubscriptionState::Active;
                    entry.cancel = Some(cancel_tx);
                    entry.task = Some(tokio::spawn(drive(
                        Arc::clone(&self.shared),
                        key.clone(),
                        feed,
                        Arc::clone(&hub),
                        stream,
                        cancel_rx,
                    )));
                    true
                }
                None => false,
            }
        };

        if !installed {
            hub.disconnect().await;
            return Err(ListenerError::Cancelled {
                key: key.to_string(),
            });
        }
        info!(key = %key, "subscription active");
        Ok(RegisterOutcome::Registered)
    }

    /// Unregister and forget a subscription. No-op if absent.
    pub async fn remove_listener(&self, key: &SubscriptionKey) {
        let entry = self.shared.subscriptions.lock().unwrap().remove(key);
        if let Some(entry) = entry {
            stop(entry).await;
            info!(key = %key, "subscription removed");
        }
    }

    /// `true` if a block subscription for `channel` is registering or active.
    pub fn has_listener(&self, channel: &str) -> bool {
        self.is_live(&SubscriptionKey::channel(channel))
    }

    pub fn has_event_listener(&self, channel: &str, chaincode_id: &str, filter: &str) -> bool {
        self.is_live(&SubscriptionKey::event(channel, chaincode_id, filter))
    }

    fn is_live(&self, key: &SubscriptionKey) -> bool {
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(Entry::is_live)
    }

    /// Every known subscription and its state, ordered by key.
    pub fn subscriptions(&self) -> Vec<(SubscriptionKey, SubscriptionState)> {
        let mut out: Vec<_> = self
            .shared
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), e.state))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Unregister all subscriptions. Does not flush the checkpoint store.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        let entries: Vec<Entry> = self
            .shared
            .subscriptions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, e)| e)
            .collect();
        let count = entries.len();
        for entry in entries {
            stop(entry).await;
        }
        info!(subscriptions = count, "listener manager shut down");
    }
}

/// Signal the subscription task and wait for it to finish its current item.
async fn stop(entry: Entry) {
    if let Some(cancel) = entry.cancel {
        let _ = cancel.send(true);
    }
    if let Some(task) = entry.task {
        let _ = task.await;
    }
}

fn exhausted_error(key: String, attempts: u32, last: ListenerError) -> ListenerError {
    match last {
        ListenerError::Ledger(source) => ListenerError::RetriesExhausted {
            key,
            attempts,
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CollectingSink, MockLedgerClient};
    use fabriclog_core::{MemoryBackend, WaitTime};
    use std::time::Duration;

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(WaitTime::Fixed(Duration::from_millis(1)), attempts)
    }

    async fn setup(
        client: &MockLedgerClient,
        config: ListenerConfig,
    ) -> (ListenerManager, Arc<CollectingSink>, CheckpointStore) {
        let store = CheckpointStore::load(Arc::new(MemoryBackend::new()), Duration::ZERO)
            .await
            .unwrap();
        let sink = Arc::new(CollectingSink::new());
        let manager = ListenerManager::new(
            Arc::new(client.clone()),
            store.clone(),
            sink.clone(),
            config,
        );
        (manager, sink, store)
    }

    #[test]
    fn resume_guard() {
        let mut guard = ResumeGuard { last: Some(5) };
        assert!(!guard.accepts(4));
        assert!(!guard.accepts(5));
        assert!(guard.accepts(6));
        guard.advance(6);
        assert!(!guard.accepts(6));
        guard.advance(3);
        assert_eq!(guard.last, Some(6));
        assert!(ResumeGuard { last: None }.accepts(0));
    }

    #[tokio::test]
    async fn second_registration_is_reported() {
        let client = MockLedgerClient::new();
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;

        assert_eq!(manager.register_listener("C1").await.unwrap(), RegisterOutcome::Registered);
        assert_eq!(
            manager.register_listener("C1").await.unwrap(),
            RegisterOutcome::AlreadyRegistered
        );
        assert_eq!(client.block_subscribers("C1"), 1);
        assert_eq!(manager.subscriptions().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn peer_is_assigned_once_then_retried() {
        let client = MockLedgerClient::new().require_peer_assignment();
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;

        manager.register_listener("C1").await.unwrap();
        assert_eq!(client.assign_calls(), 1);
        assert_eq!(client.open_calls(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let client = MockLedgerClient::new();
        client.fail_next_opens("C1", 2);
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;

        let outcome = manager
            .register_listener_with_retry("C1", &fast_retry(5))
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Registered);
        assert_eq!(client.open_calls(), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let client = MockLedgerClient::new();
        client.fail_next_opens("C1", 10);
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;

        let err = manager
            .register_listener_with_retry("C1", &fast_retry(3))
            .await
            .unwrap_err();
        match err {
            ListenerError::RetriesExhausted { key, attempts, source } => {
                assert_eq!(key, "C1");
                assert_eq!(attempts, 3);
                assert!(matches!(source, LedgerError::ConnectionFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.has_listener("C1"));
        assert!(manager.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let client = MockLedgerClient::new();
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;

        manager.register_listener("C1").await.unwrap();
        let key = SubscriptionKey::channel("C1");
        manager.remove_listener(&key).await;
        manager.remove_listener(&key).await;
        assert!(!manager.has_listener("C1"));
        assert_eq!(client.block_subscribers("C1"), 0);
    }

    #[tokio::test]
    async fn registration_after_shutdown_fails() {
        let client = MockLedgerClient::new();
        let (manager, _, _) = setup(&client, ListenerConfig::new("peer0", "Org1MSP")).await;
        manager.shutdown().await;
        assert!(matches!(
            manager.register_listener("C1").await,
            Err(ListenerError::ShutDown)
        ));
    }
}
