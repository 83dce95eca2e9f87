//! In-memory ledger client and record sink.
//!
//! `MockLedgerClient` replays stored history from the requested start block,
//! then forwards live pushes unfiltered (so stale redeliveries can be
//! simulated). It also injects connection failures, stream failures and the
//! peer-assignment quirk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabriclog_core::{Block, ChaincodeEvent, DecodedRecord, LedgerError, OutputError, RecordSink};
use futures::channel::mpsc;
use futures::{stream, SinkExt, StreamExt};

use crate::source::{BlockStream, ChannelHub, EventStream, LedgerClient};

const STREAM_CAPACITY: usize = 256;

type BlockSender = mpsc::Sender<Result<Block, LedgerError>>;
type EventSender = mpsc::Sender<Result<ChaincodeEvent, LedgerError>>;

struct EventSub {
    hub: u64,
    chaincode_id: String,
    filter: String,
    tx: EventSender,
}

#[derive(Default)]
struct ChannelState {
    blocks: Vec<Block>,
    events: Vec<ChaincodeEvent>,
    block_subs: Vec<(u64, BlockSender)>,
    event_subs: Vec<EventSub>,
}

#[derive(Default)]
struct MockInner {
    channels: HashMap<String, ChannelState>,
    require_assignment: bool,
    assigned: HashSet<String>,
    open_failures: HashMap<String, u32>,
    open_calls: u32,
    assign_calls: u32,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<MockInner>,
    next_hub: AtomicU64,
}

/// Event-name filter match. Supports `.*`, `prefix.*` and literal names;
/// real ledger clients evaluate the full expression on the peer side.
fn filter_matches(filter: &str, event_name: &str) -> bool {
    if filter == ".*" {
        return true;
    }
    match filter.strip_suffix(".*") {
        Some(prefix) => event_name.starts_with(prefix),
        None => event_name == filter,
    }
}

#[derive(Clone, Default)]
pub struct MockLedgerClient {
    state: Arc<MockState>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `assign_peer` before `open_channel` succeeds on any channel.
    pub fn require_peer_assignment(self) -> Self {
        self.state.inner.lock().unwrap().require_assignment = true;
        self
    }

    /// Make the next `n` `open_channel` calls for `channel` fail.
    pub fn fail_next_opens(&self, channel: &str, n: u32) {
        self.state
            .inner
            .lock()
            .unwrap()
            .open_failures
            .insert(channel.to_string(), n);
    }

    /// Store a block as history without notifying subscribers.
    pub fn add_history(&self, channel: &str, block: Block) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.channels.entry(channel.to_string()).or_default().blocks.push(block);
    }

    /// Deliver a block to every block subscriber of `channel`.
    pub async fn push_block(&self, channel: &str, block: Block) {
        let senders: Vec<BlockSender> = {
            let mut inner = self.state.inner.lock().unwrap();
            let ch = inner.channels.entry(channel.to_string()).or_default();
            ch.blocks.push(block.clone());
            ch.block_subs.retain(|(_, tx)| !tx.is_closed());
            ch.block_subs.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for mut tx in senders {
            let _ = tx.send(Ok(block.clone())).await;
        }
    }

    /// Deliver an event to every matching contract subscriber of `channel`.
    pub async fn push_event(&self, channel: &str, event: ChaincodeEvent) {
        let senders: Vec<EventSender> = {
            let mut inner = self.state.inner.lock().unwrap();
            let ch = inner.channels.entry(channel.to_string()).or_default();
            ch.events.push(event.clone());
            ch.event_subs.retain(|s| !s.tx.is_closed());
            ch.event_subs
                .iter()
                .filter(|s| s.chaincode_id == event.chaincode_id && filter_matches(&s.filter, &event.event_name))
                .map(|s| s.tx.clone())
                .collect()
        };
        for mut tx in senders {
            let _ = tx.send(Ok(event.clone())).await;
        }
    }

    /// Fail every open stream of `channel`: each yields an error, then ends.
    pub async fn break_streams(&self, channel: &str) {
        let (blocks, events) = {
            let mut inner = self.state.inner.lock().unwrap();
            let ch = inner.channels.entry(channel.to_string()).or_default();
            let blocks: Vec<BlockSender> = ch.block_subs.drain(..).map(|(_, tx)| tx).collect();
            let events: Vec<EventSender> = ch.event_subs.drain(..).map(|s| s.tx).collect();
            (blocks, events)
        };
        let err = LedgerError::Closed {
            channel: channel.to_string(),
        };
        for mut tx in blocks {
            let _ = tx.send(Err(err.clone())).await;
        }
        for mut tx in events {
            let _ = tx.send(Err(err.clone())).await;
        }
    }

    /// Live block subscribers on `channel`.
    pub fn block_subscribers(&self, channel: &str) -> usize {
        let mut inner = self.state.inner.lock().unwrap();
        inner.channels.get_mut(channel).map_or(0, |ch| {
            ch.block_subs.retain(|(_, tx)| !tx.is_closed());
            ch.block_subs.len()
        })
    }

    /// Live contract subscribers on `channel`.
    pub fn event_subscribers(&self, channel: &str) -> usize {
        let mut inner = self.state.inner.lock().unwrap();
        inner.channels.get_mut(channel).map_or(0, |ch| {
            ch.event_subs.retain(|s| !s.tx.is_closed());
            ch.event_subs.len()
        })
    }

    pub fn open_calls(&self) -> u32 {
        self.state.inner.lock().unwrap().open_calls
    }

    pub fn assign_calls(&self) -> u32 {
        self.state.inner.lock().unwrap().assign_calls
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn open_channel(
        &self,
        channel: &str,
        peer: &str,
    ) -> Result<Arc<dyn ChannelHub>, LedgerError> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.open_calls += 1;

        if let Some(left) = inner.open_failures.get_mut(channel) {
            if *left > 0 {
                *left -= 1;
                return Err(LedgerError::ConnectionFailed {
                    channel: channel.to_string(),
                    reason: "injected failure".into(),
                });
            }
        }
        if inner.require_assignment && !inner.assigned.contains(channel) {
            return Err(LedgerError::PeerNotAssigned {
                peer: peer.to_string(),
                channel: channel.to_string(),
            });
        }

        Ok(Arc::new(MockHub {
            id: self.state.next_hub.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
        }))
    }

    async fn assign_peer(&self, channel: &str, _peer: &str, _msp: &str) -> Result<(), LedgerError> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.assign_calls += 1;
        inner.assigned.insert(channel.to_string());
        Ok(())
    }
}

struct MockHub {
    id: u64,
    channel: String,
    state: Arc<MockState>,
    connected: AtomicBool,
}

#[async_trait]
impl ChannelHub for MockHub {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn block_stream(&self, start: u64) -> Result<BlockStream, LedgerError> {
        if !self.is_connected() {
            return Err(LedgerError::Closed {
                channel: self.channel.clone(),
            });
        }
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let history: Vec<Block> = {
            let mut inner = self.state.inner.lock().unwrap();
            let ch = inner.channels.entry(self.channel.clone()).or_default();
            ch.block_subs.push((self.id, tx));
            ch.blocks.iter().filter(|b| b.number >= start).cloned().collect()
        };
        Ok(Box::pin(stream::iter(history.into_iter().map(Ok)).chain(rx)))
    }

    async fn contract_stream(
        &self,
        chaincode_id: &str,
        filter: &str,
        start: u64,
    ) -> Result<EventStream, LedgerError> {
        if !self.is_connected() {
            return Err(LedgerError::Closed {
                channel: self.channel.clone(),
            });
        }
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let history: Vec<ChaincodeEvent> = {
            let mut inner = self.state.inner.lock().unwrap();
            let ch = inner.channels.entry(self.channel.clone()).or_default();
            ch.event_subs.push(EventSub {
                hub: self.id,
                chaincode_id: chaincode_id.to_string(),
                filter: filter.to_string(),
                tx,
            });
            ch.events
                .iter()
                .filter(|e| e.chaincode_id == chaincode_id && filter_matches(filter, &e.event_name))
                .filter(|e| e.block_number.map_or(true, |b| b >= start))
                .cloned()
                .collect()
        };
        Ok(Box::pin(stream::iter(history.into_iter().map(Ok)).chain(rx)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut inner = self.state.inner.lock().unwrap();
        if let Some(ch) = inner.channels.get_mut(&self.channel) {
            ch.block_subs.retain(|(hub, _)| *hub != self.id);
            ch.event_subs.retain(|s| s.hub != self.id);
        }
    }
}

// ─── Collecting sink ─────────────────────────────────────────────────────────

/// Record sink that keeps everything it receives.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<(DecodedRecord, String)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecodedRecord> {
        self.records.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn sources(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll until at least `n` records arrived. Returns `false` on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.len() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn log_event(&self, record: DecodedRecord, source: &str) -> Result<(), OutputError> {
        self.records.lock().unwrap().push((record, source.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> Block {
        Block {
            number,
            previous_hash: vec![],
            data_hash: vec![],
            data: vec![],
            metadata: vec![],
        }
    }

    #[test]
    fn filters() {
        assert!(filter_matches(".*", "anything"));
        assert!(filter_matches("transfer.*", "transferFrom"));
        assert!(!filter_matches("transfer.*", "mint"));
        assert!(filter_matches("mint", "mint"));
        assert!(!filter_matches("mint", "minted"));
    }

    #[tokio::test]
    async fn history_then_live() {
        let client = MockLedgerClient::new();
        for n in 1..=3 {
            client.add_history("C1", block(n));
        }
        let hub = client.open_channel("C1", "peer0").await.unwrap();
        let mut stream = hub.block_stream(2).await.unwrap();
        client.push_block("C1", block(4)).await;

        let mut seen = vec![];
        for _ in 0..3 {
            seen.push(stream.next().await.unwrap().unwrap().number);
        }
        assert_eq!(seen, vec![2, 3, 4]);

        hub.disconnect().await;
        assert!(stream.next().await.is_none());
        assert_eq!(client.block_subscribers("C1"), 0);
    }

    #[tokio::test]
    async fn peer_assignment_quirk() {
        let client = MockLedgerClient::new().require_peer_assignment();
        let err = client.open_channel("C1", "peer0").await.err().unwrap();
        assert!(err.is_peer_not_assigned());
        client.assign_peer("C1", "peer0", "Org1MSP").await.unwrap();
        assert!(client.open_channel("C1", "peer0").await.is_ok());
    }

    #[tokio::test]
    async fn broken_stream_yields_error_then_ends() {
        let client = MockLedgerClient::new();
        let hub = client.open_channel("C1", "peer0").await.unwrap();
        let mut stream = hub.block_stream(0).await.unwrap();
        client.break_streams("C1").await;
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
