//! End-to-end listener scenarios against the in-memory ledger client.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fabriclog_core::{
    Block, ChaincodeEvent, ChannelHeader, CheckpointStore, Envelope, Header, HeaderType,
    MemoryBackend, Payload, RawNode, RecordKind, RetryPolicy, SubscriptionKey, WaitTime,
};
use fabriclog_listener::{
    CollectingSink, EventSubscription, ListenerConfig, ListenerManager, MockLedgerClient,
    SubscriptionState,
};

const WAIT: Duration = Duration::from_secs(2);

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(WaitTime::Fixed(Duration::from_millis(1)), 5)
}

fn envelope(tx_id: &str) -> Envelope {
    let mut channel_header = ChannelHeader::new(HeaderType::EndorserTransaction, "C1", tx_id);
    channel_header.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    Envelope {
        signature: vec![0x30, 0x01],
        payload: Some(Payload {
            header: Header {
                channel_header,
                signature_header: RawNode::map(),
            },
            data: RawNode::map(),
        }),
    }
}

fn block(number: u64, txs: &[&str]) -> Block {
    Block {
        number,
        previous_hash: vec![],
        data_hash: vec![],
        data: txs.iter().map(|tx| envelope(tx)).collect(),
        metadata: vec![],
    }
}

fn event(block_number: u64, name: &str) -> ChaincodeEvent {
    ChaincodeEvent {
        chaincode_id: "mycc".into(),
        tx_id: format!("tx-{block_number}-{name}"),
        event_name: name.into(),
        payload: b"payload".to_vec(),
        block_number: Some(block_number),
        tx_status: Some("VALID".into()),
        timestamp: None,
    }
}

struct Harness {
    client: MockLedgerClient,
    backend: Arc<MemoryBackend>,
    store: CheckpointStore,
    sink: Arc<CollectingSink>,
    manager: ListenerManager,
}

async fn harness(persisted: Option<&str>, config: ListenerConfig) -> Harness {
    let client = MockLedgerClient::new();
    let backend = Arc::new(match persisted {
        Some(text) => MemoryBackend::with_content(text),
        None => MemoryBackend::new(),
    });
    let store = CheckpointStore::load(backend.clone(), Duration::ZERO).await.unwrap();
    let sink = Arc::new(CollectingSink::new());
    let manager = ListenerManager::new(
        Arc::new(client.clone()),
        store.clone(),
        sink.clone(),
        config.with_retry(fast_retry()),
    );
    Harness {
        client,
        backend,
        store,
        sink,
        manager,
    }
}

#[tokio::test]
async fn resumed_channel_skips_stale_redelivery() {
    let h = harness(Some("C1 = 5\n"), ListenerConfig::new("peer0", "Org1MSP")).await;
    h.manager.listen(&fast_retry()).await.unwrap();
    assert!(h.manager.has_listener("C1"));

    h.client.push_block("C1", block(6, &["tx1", "tx2"])).await;
    h.client.push_block("C1", block(4, &["old"])).await;

    assert!(h.sink.wait_for(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = h.sink.records();
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(|r| r.kind.clone()).collect::<Vec<_>>(),
        vec![
            RecordKind::EndorserTransaction,
            RecordKind::EndorserTransaction,
            RecordKind::Block
        ]
    );
    assert!(records.iter().all(|r| r.block_number == Some(6)));
    assert!(h.sink.sources().iter().all(|s| s == "peer0"));

    h.manager.shutdown().await;
    h.store.shutdown().await.unwrap();
    assert_eq!(h.store.get_channel_checkpoint("C1", 0), 6);
    assert_eq!(h.backend.writes(), 1);
}

#[tokio::test]
async fn history_replay_starts_after_checkpoint() {
    let h = harness(Some("C1 = 5\n"), ListenerConfig::new("peer0", "Org1MSP")).await;
    for n in 1..=7 {
        h.client.add_history("C1", block(n, &["tx"]));
    }
    h.manager.listen(&fast_retry()).await.unwrap();

    assert!(h.sink.wait_for(4, WAIT).await);
    let numbers: Vec<_> = h.sink.records().iter().filter_map(|r| r.block_number).collect();
    assert_eq!(numbers, vec![6, 6, 7, 7]);
    h.manager.shutdown().await;
    assert_eq!(h.store.get_channel_checkpoint("C1", 0), 7);
}

#[tokio::test]
async fn configured_channel_registers_once() {
    let config = ListenerConfig::new("peer0", "Org1MSP").with_channel("C1");
    let h = harness(Some("C1 = 2\n"), config).await;

    h.manager.listen(&fast_retry()).await.unwrap();
    assert_eq!(h.client.block_subscribers("C1"), 1);
    assert_eq!(
        h.manager.subscriptions(),
        vec![(SubscriptionKey::channel("C1"), SubscriptionState::Active)]
    );
    h.manager.shutdown().await;
}

#[tokio::test]
async fn required_subscription_failure_fails_listen() {
    let config = ListenerConfig::new("peer0", "Org1MSP").with_channel("C2");
    let h = harness(None, config).await;
    h.client.fail_next_opens("C2", 100);

    let err = h.manager.listen(&fast_retry()).await.unwrap_err();
    assert!(err.to_string().contains("C2"), "{err}");
}

#[tokio::test]
async fn chaincode_event_advances_event_checkpoint() {
    let config = ListenerConfig::new("peer0", "Org1MSP")
        .with_ccevent(EventSubscription::new("C1", "mycc", ".*"));
    let h = harness(None, config).await;

    assert_eq!(h.store.get_event_checkpoint("C1", "mycc", 0), 0);
    h.manager.listen(&fast_retry()).await.unwrap();
    assert!(h.manager.has_event_listener("C1", "mycc", ".*"));

    h.client.push_event("C1", event(42, "transfer")).await;
    assert!(h.sink.wait_for(1, WAIT).await);

    let records = h.sink.records();
    let record = &records[0];
    assert_eq!(record.kind, RecordKind::ChaincodeEvent);
    assert_eq!(record.payload["payload_message"], "payload");

    h.manager.shutdown().await;
    let cp = h.store.event_checkpoint("C1", "mycc").unwrap();
    assert_eq!(cp.block, 42);
    assert_eq!(cp.channel_name, "C1");
    assert_eq!(cp.chaincode_id, "mycc");
    assert_eq!(cp.filter.as_deref(), Some(".*"));
}

#[tokio::test]
async fn resumed_events_replay_stored_block_inclusive() {
    let persisted = "[ccevents.C1_mycc]\nblock = 10\nchaincodeId = \"mycc\"\nchannelName = \"C1\"\nfilter = \"transfer.*\"\n";
    let h = harness(Some(persisted), ListenerConfig::new("peer0", "Org1MSP")).await;
    h.client.push_event("C1", event(9, "transfer")).await;
    h.client.push_event("C1", event(10, "transferB")).await;
    h.client.push_event("C1", event(11, "mint")).await;
    h.client.push_event("C1", event(11, "transferC")).await;

    h.manager.listen(&fast_retry()).await.unwrap();
    assert!(h.manager.has_event_listener("C1", "mycc", "transfer.*"));

    assert!(h.sink.wait_for(2, WAIT).await);
    // A stale live redelivery below the stored block is dropped.
    h.client.push_event("C1", event(8, "transfer")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let blocks: Vec<_> = h.sink.records().iter().filter_map(|r| r.block_number).collect();
    assert_eq!(blocks, vec![10, 11]);
    h.manager.shutdown().await;
    assert_eq!(h.store.get_event_checkpoint("C1", "mycc", 0), 11);
}

#[tokio::test]
async fn broken_stream_reconnects_from_resume_point() {
    let config = ListenerConfig::new("peer0", "Org1MSP").with_channel("C1");
    let h = harness(None, config).await;
    h.manager.listen(&fast_retry()).await.unwrap();

    h.client.push_block("C1", block(1, &["a"])).await;
    assert!(h.sink.wait_for(2, WAIT).await);

    h.client.break_streams("C1").await;
    // Wait until the task has re-subscribed and reported itself active.
    let active = vec![(SubscriptionKey::channel("C1"), SubscriptionState::Active)];
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.client.block_subscribers("C1") == 0 || h.manager.subscriptions() != active {
        assert!(tokio::time::Instant::now() < deadline, "no re-subscription");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.client.push_block("C1", block(2, &["b"])).await;
    assert!(h.sink.wait_for(4, WAIT).await);
    // Block 1 is in history but the reopened stream starts at 2.
    let numbers: Vec<_> = h.sink.records().iter().filter_map(|r| r.block_number).collect();
    assert_eq!(numbers, vec![1, 1, 2, 2]);
    h.manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_reconnect_closes_subscription() {
    let config = ListenerConfig::new("peer0", "Org1MSP").with_channel("C1");
    let h = harness(None, config).await;
    h.manager.listen(&fast_retry()).await.unwrap();

    h.client.fail_next_opens("C1", 100);
    h.client.break_streams("C1").await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let subs = h.manager.subscriptions();
        if subs == vec![(SubscriptionKey::channel("C1"), SubscriptionState::Closed)] {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "still {subs:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.manager.has_listener("C1"));

    // Operators may add it again once the upstream recovers.
    h.client.fail_next_opens("C1", 0);
    h.manager.register_listener("C1").await.unwrap();
    assert!(h.manager.has_listener("C1"));
    h.manager.shutdown().await;
}
