//! Console sink: newline-delimited JSON.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use fabriclog_core::OutputError;
use serde::Serialize;

use crate::sink::{OutputEvent, OutputMetrics, Sink};

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Event(&'a OutputEvent),
    Metrics(&'a OutputMetrics),
}

pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, line: &Line<'_>) -> Result<(), OutputError> {
        let mut text = serde_json::to_vec(line)?;
        text.push(b'\n');
        let mut out = self.out.lock().unwrap();
        out.write_all(&text)?;
        Ok(())
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn push_event(&self, event: OutputEvent) -> Result<(), OutputError> {
        self.write_line(&Line::Event(&event))
    }

    async fn push_metrics(&self, metrics: OutputMetrics) -> Result<(), OutputError> {
        self.write_line(&Line::Metrics(&metrics))
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.out.lock().unwrap().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::EventMetadata;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let buf = Shared::default();
        let sink = ConsoleSink::with_writer(Box::new(buf.clone()));

        sink.push_event(OutputEvent {
            time: Utc::now(),
            body: json!({"type": "ccevent"}),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        sink.push_metrics(OutputMetrics {
            time: Utc::now(),
            measurements: BTreeMap::from([("up".to_string(), 1.0)]),
            fields: BTreeMap::new(),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        sink.flush().await.unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], json!("event"));
        assert_eq!(lines[0]["body"]["type"], json!("ccevent"));
        assert_eq!(lines[1]["kind"], json!("metrics"));
        assert_eq!(lines[1]["measurements"]["up"], json!(1.0));
    }
}
