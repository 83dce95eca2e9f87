//! File sink: one JSON file per record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabriclog_core::OutputError;
use serde::Serialize;
use tracing::{debug, info};

use crate::sink::{OutputEvent, OutputMetrics, Sink};

/// Writes each record to `<dir>/<label>-<millis>-<random>.json`.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Creates `dir` if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "writing output records to files");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, label: Option<&str>, time: DateTime<Utc>) -> PathBuf {
        let label: String = label
            .unwrap_or("record")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let suffix = hex::encode(rand::random::<[u8; 4]>());
        self.dir
            .join(format!("{label}-{}-{suffix}.json", time.timestamp_millis()))
    }

    async fn write<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), OutputError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), "wrote record file");
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn push_event(&self, event: OutputEvent) -> Result<(), OutputError> {
        let path = self.file_path(event.metadata.sourcetype.as_deref(), event.time);
        self.write(path, &event).await
    }

    async fn push_metrics(&self, metrics: OutputMetrics) -> Result<(), OutputError> {
        let path = self.file_path(metrics.metadata.sourcetype.as_deref(), metrics.time);
        self.write(path, &metrics).await
    }
}
