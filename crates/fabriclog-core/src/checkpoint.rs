//! Checkpoint store — persists per-channel and per-event-subscription progress.
//!
//! The in-memory `CheckpointSet` is authoritative. Every update serializes the
//! whole set and hands it to a single writer task, so at most one write is in
//! flight and writes land in the order the updates happened. The writer
//! coalesces bursts over `save_interval` and skips content that is
//! byte-identical to what was last persisted.
//!
//! File format (TOML, keys sorted):
//!
//! ```toml
//! C1 = 6
//!
//! [ccevents.C1_mycc]
//! block = 42
//! chaincodeId = "mycc"
//! channelName = "C1"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::CheckpointError;

/// Reserved top-level section holding chaincode-event checkpoints.
pub const EVENTS_SECTION: &str = "ccevents";

// ─── Checkpoint set ──────────────────────────────────────────────────────────

/// Progress of one chaincode-event subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCheckpoint {
    pub block: u64,
    pub channel_name: String,
    pub chaincode_id: String,
    /// Filter expression the subscription was registered with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl EventCheckpoint {
    pub fn key(&self) -> String {
        CheckpointSet::event_key(&self.channel_name, &self.chaincode_id)
    }
}

/// The full set of resume positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    /// Channel name → last processed block number.
    pub channels: BTreeMap<String, u64>,
    /// `{channel}_{chaincodeId}` → event progress.
    pub events: BTreeMap<String, EventCheckpoint>,
}

impl CheckpointSet {
    pub fn event_key(channel: &str, chaincode_id: &str) -> String {
        format!("{channel}_{chaincode_id}")
    }

    /// Parse the persisted text. Any value that is not a non-negative integer
    /// (or a well-formed event entry under `[ccevents]`) is an error.
    pub fn parse(text: &str) -> Result<Self, String> {
        let table: toml::Table = text.parse().map_err(|e: toml::de::Error| e.message().to_string())?;
        let mut set = Self::default();

        for (key, value) in table {
            if key == EVENTS_SECTION {
                let section = value
                    .as_table()
                    .ok_or_else(|| format!("'{EVENTS_SECTION}' must be a table"))?;
                for (event_key, entry) in section {
                    let cp: EventCheckpoint = entry
                        .clone()
                        .try_into()
                        .map_err(|e: toml::de::Error| format!("event checkpoint '{event_key}': {}", e.message()))?;
                    set.events.insert(event_key.clone(), cp);
                }
                continue;
            }

            let block = match value {
                toml::Value::Integer(n) if n >= 0 => n as u64,
                toml::Value::Integer(n) => {
                    return Err(format!("channel '{key}' has negative block number {n}"))
                }
                other => {
                    return Err(format!(
                        "channel '{key}' must map to an integer block number, got {}",
                        other.type_str()
                    ))
                }
            };
            set.channels.insert(key, block);
        }

        Ok(set)
    }

    /// Deterministic serialization; `parse(s.serialize()?) == s`.
    pub fn serialize(&self) -> Result<String, String> {
        let mut table = toml::Table::new();
        for (channel, block) in &self.channels {
            table.insert(channel.clone(), toml::Value::Integer(persistable_block(channel, *block)?));
        }
        if !self.events.is_empty() {
            let mut section = toml::Table::new();
            for (key, cp) in &self.events {
                persistable_block(key, cp.block)?;
                let value = toml::Value::try_from(cp)
                    .map_err(|e| format!("event checkpoint '{key}': {e}"))?;
                section.insert(key.clone(), value);
            }
            table.insert(EVENTS_SECTION.to_string(), toml::Value::Table(section));
        }
        toml::to_string(&table).map_err(|e| e.to_string())
    }
}

/// TOML integers are signed 64-bit.
fn persistable_block(key: &str, block: u64) -> Result<i64, String> {
    i64::try_from(block).map_err(|_| format!("block number {block} of '{key}' is out of range"))
}

fn check_block(key: &str, block: u64) -> Result<(), CheckpointError> {
    persistable_block(key, block)
        .map(|_| ())
        .map_err(|reason| CheckpointError::InvalidValue {
            key: key.to_string(),
            reason,
        })
}

// ─── Backends ────────────────────────────────────────────────────────────────

/// Where checkpoint text is persisted.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Returns `None` when nothing has been persisted yet.
    async fn read(&self) -> Result<Option<String>, CheckpointError>;

    /// Replace the persisted content.
    async fn write(&self, content: &str) -> Result<(), CheckpointError>;

    /// Human-readable location, used in errors and logs.
    fn location(&self) -> PathBuf;
}

/// File backend. Writes go to `<path>.tmp` and are renamed over the target.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointBackend for FileBackend {
    async fn read(&self) -> Result<Option<String>, CheckpointError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn write(&self, content: &str) -> Result<(), CheckpointError> {
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

/// In-memory backend that counts writes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    content: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with pre-existing persisted content.
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(Some(content.into())),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn content(&self) -> Option<String> {
        self.content.lock().unwrap().clone()
    }

    /// Number of writes that reached the backend.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointBackend for MemoryBackend {
    async fn read(&self) -> Result<Option<String>, CheckpointError> {
        Ok(self.content())
    }

    async fn write(&self, content: &str) -> Result<(), CheckpointError> {
        *self.content.lock().unwrap() = Some(content.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from(":memory:")
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

enum WriterMsg {
    Write(String),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct Inner {
    set: Mutex<CheckpointSet>,
    tx: mpsc::UnboundedSender<WriterMsg>,
    writer: Mutex<Option<JoinHandle<()>>>,
    location: PathBuf,
}

/// Cloneable handle to the checkpoint state and its writer task.
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<Inner>,
}

impl CheckpointStore {
    /// Load persisted checkpoints (empty when nothing is persisted) and start
    /// the writer task. Fails on unreadable or corrupt content.
    pub async fn load(
        backend: Arc<dyn CheckpointBackend>,
        save_interval: Duration,
    ) -> Result<Self, CheckpointError> {
        let location = backend.location();
        let persisted = backend.read().await?;
        let set = match &persisted {
            Some(text) => CheckpointSet::parse(text).map_err(|reason| CheckpointError::Corrupt {
                path: location.clone(),
                reason,
            })?,
            None => CheckpointSet::default(),
        };

        tracing::info!(
            location = %location.display(),
            channels = set.channels.len(),
            events = set.events.len(),
            "loaded checkpoints"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(backend, rx, save_interval, persisted));

        Ok(Self {
            inner: Arc::new(Inner {
                set: Mutex::new(set),
                tx,
                writer: Mutex::new(Some(writer)),
                location,
            }),
        })
    }

    /// Snapshot of the current in-memory set.
    pub fn snapshot(&self) -> CheckpointSet {
        self.inner.set.lock().unwrap().clone()
    }

    pub fn channel_checkpoint(&self, channel: &str) -> Option<u64> {
        self.inner.set.lock().unwrap().channels.get(channel).copied()
    }

    pub fn get_channel_checkpoint(&self, channel: &str, default: u64) -> u64 {
        self.channel_checkpoint(channel).unwrap_or(default)
    }

    pub fn event_checkpoint(&self, channel: &str, chaincode_id: &str) -> Option<EventCheckpoint> {
        self.inner
            .set
            .lock()
            .unwrap()
            .events
            .get(&CheckpointSet::event_key(channel, chaincode_id))
            .cloned()
    }

    pub fn get_event_checkpoint(&self, channel: &str, chaincode_id: &str, default: u64) -> u64 {
        self.event_checkpoint(channel, chaincode_id)
            .map(|cp| cp.block)
            .unwrap_or(default)
    }

    pub fn list_channels(&self) -> BTreeSet<String> {
        self.inner.set.lock().unwrap().channels.keys().cloned().collect()
    }

    pub fn list_event_subscriptions(&self) -> Vec<EventCheckpoint> {
        self.inner.set.lock().unwrap().events.values().cloned().collect()
    }

    /// Record the last processed block of `channel` and schedule a write.
    pub fn store_channel_checkpoint(&self, channel: &str, block: u64) -> Result<(), CheckpointError> {
        if channel == EVENTS_SECTION {
            return Err(CheckpointError::InvalidValue {
                key: channel.to_string(),
                reason: format!("'{EVENTS_SECTION}' is reserved"),
            });
        }
        check_block(channel, block)?;
        self.update(|set| {
            set.channels.insert(channel.to_string(), block);
        })
    }

    /// Record the block of the last processed event of `(channel, chaincode_id)`.
    pub fn store_event_checkpoint(
        &self,
        channel: &str,
        chaincode_id: &str,
        filter: Option<&str>,
        block: u64,
    ) -> Result<(), CheckpointError> {
        check_block(&CheckpointSet::event_key(channel, chaincode_id), block)?;
        self.update(|set| {
            set.events.insert(
                CheckpointSet::event_key(channel, chaincode_id),
                EventCheckpoint {
                    block,
                    channel_name: channel.to_string(),
                    chaincode_id: chaincode_id.to_string(),
                    filter: filter.map(str::to_string),
                },
            );
        })
    }

    fn update(&self, f: impl FnOnce(&mut CheckpointSet)) -> Result<(), CheckpointError> {
        let mut set = self.inner.set.lock().unwrap();
        f(&mut set);
        // Enqueue under the lock so queued contents follow mutation order.
        self.enqueue(&set)
    }

    /// Hand the serialized set to the writer. Content that cannot be
    /// serialized is never written, so persisted progress is left as is.
    fn enqueue(&self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let content = set.serialize().map_err(|reason| {
            tracing::error!(
                location = %self.inner.location.display(),
                %reason,
                "cannot serialize checkpoints, skipping write"
            );
            CheckpointError::Serialize(reason)
        })?;
        self.inner
            .tx
            .send(WriterMsg::Write(content))
            .map_err(|_| CheckpointError::WriterClosed)
    }

    /// Wait until the current state has been handed to the backend.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let set = self.inner.set.lock().unwrap();
            self.enqueue(&set)?;
        }
        self.inner
            .tx
            .send(WriterMsg::Flush(ack_tx))
            .map_err(|_| CheckpointError::WriterClosed)?;
        ack_rx.await.map_err(|_| CheckpointError::WriterClosed)
    }

    /// Flush and stop the writer task. Later updates fail with `WriterClosed`.
    pub async fn shutdown(&self) -> Result<(), CheckpointError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = {
            let set = self.inner.set.lock().unwrap();
            self.enqueue(&set)
        };
        if matches!(queued, Err(CheckpointError::WriterClosed)) {
            return Ok(());
        }
        if self.inner.tx.send(WriterMsg::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        let writer = self.inner.writer.lock().unwrap().take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        tracing::info!(location = %self.inner.location.display(), "checkpoint store shut down");
        queued
    }
}

// ─── Writer task ─────────────────────────────────────────────────────────────

async fn run_writer(
    backend: Arc<dyn CheckpointBackend>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    save_interval: Duration,
    mut last: Option<String>,
) {
    let mut pending: Option<String> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let msg = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    persist(backend.as_ref(), &mut pending, &mut last).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match msg {
            Some(WriterMsg::Write(content)) => {
                pending = Some(content);
                if save_interval.is_zero() {
                    persist(backend.as_ref(), &mut pending, &mut last).await;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + save_interval);
                }
            }
            Some(WriterMsg::Flush(ack)) => {
                persist(backend.as_ref(), &mut pending, &mut last).await;
                deadline = None;
                let _ = ack.send(());
            }
            Some(WriterMsg::Shutdown(ack)) => {
                persist(backend.as_ref(), &mut pending, &mut last).await;
                let _ = ack.send(());
                break;
            }
            None => {
                persist(backend.as_ref(), &mut pending, &mut last).await;
                break;
            }
        }
    }
}

async fn persist(
    backend: &dyn CheckpointBackend,
    pending: &mut Option<String>,
    last: &mut Option<String>,
) {
    let Some(content) = pending.take() else {
        return;
    };
    if last.as_deref() == Some(content.as_str()) {
        tracing::trace!("checkpoint content unchanged, skipping write");
        return;
    }
    match backend.write(&content).await {
        Ok(()) => {
            tracing::debug!(location = %backend.location().display(), bytes = content.len(), "checkpoints written");
            *last = Some(content);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to write checkpoints; in-memory state stays authoritative");
        }
    }
}
