//! Prometheus node-metrics scraping.
//!
//! Each configured endpoint is fetched on its own interval. The text
//! exposition format is parsed into samples, samples sharing a label set
//! become one `MultiMetrics` record, and records go through the router under
//! the node-metrics label.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabriclog_core::MultiMetrics;
use fabriclog_output::Router;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::ScrapeTarget;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid scrape url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

// ─── Exposition format ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Parse Prometheus text exposition. Comment lines, malformed lines and
/// non-finite values are skipped.
pub fn parse_exposition(text: &str) -> Vec<Sample> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let sample = parse_line(line);
            if sample.is_none() {
                trace!(line, "skipping unparsable or non-finite sample");
            }
            sample
        })
        .collect()
}

fn parse_line(line: &str) -> Option<Sample> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }
    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(after_brace) = rest.strip_prefix('{') {
        let (parsed, remaining) = parse_labels(after_brace)?;
        labels = parsed;
        rest = remaining;
    }
    // Value, then an optional timestamp which is ignored.
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    value.is_finite().then(|| Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Parse `a="x",b="y"}` and return the labels plus the text after `}`.
fn parse_labels(mut s: &str) -> Option<(BTreeMap<String, String>, &str)> {
    let mut labels = BTreeMap::new();
    loop {
        s = s.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if let Some(rest) = s.strip_prefix('}') {
            return Some((labels, rest));
        }
        let eq = s.find('=')?;
        let key = s[..eq].trim().to_string();
        s = s[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = s.char_indices();
        let end = loop {
            match chars.next()? {
                (i, '"') => break i,
                (_, '\\') => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                (_, c) => value.push(c),
            }
        };
        labels.insert(key, value);
        s = &s[end + 1..];
    }
}

/// Group samples by label set. Metric names get `{prefix}.` when a prefix
/// is configured.
pub fn to_multi_metrics(
    samples: Vec<Sample>,
    name_prefix: Option<&str>,
    host: Option<&str>,
    time: DateTime<Utc>,
) -> Vec<MultiMetrics> {
    let mut groups: BTreeMap<BTreeMap<String, String>, BTreeMap<String, f64>> = BTreeMap::new();
    for sample in samples {
        let name = match name_prefix {
            Some(prefix) => format!("{prefix}.{}", sample.name),
            None => sample.name,
        };
        groups.entry(sample.labels).or_default().insert(name, sample.value);
    }
    groups
        .into_iter()
        .map(|(fields, measurements)| MultiMetrics {
            time,
            measurements,
            fields,
            host: host.map(str::to_string),
        })
        .collect()
}

// ─── Scraper ─────────────────────────────────────────────────────────────────

pub struct Scraper {
    target: ScrapeTarget,
    host: Option<String>,
    client: reqwest::Client,
}

impl Scraper {
    pub fn new(target: ScrapeTarget) -> Result<Self, ScrapeError> {
        let url = reqwest::Url::parse(&target.url).map_err(|e| ScrapeError::InvalidUrl {
            url: target.url.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(target.interval.max(Duration::from_secs(1)))
            .build()
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        Ok(Self {
            host: url.host_str().map(str::to_string),
            target,
            client,
        })
    }

    pub async fn scrape_once(&self) -> Result<Vec<MultiMetrics>, ScrapeError> {
        let resp = self
            .client
            .get(&self.target.url)
            .send()
            .await
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ScrapeError::Http(format!("HTTP {status}: {body}")));
        }
        let text = resp.text().await.map_err(|e| ScrapeError::Http(e.to_string()))?;
        Ok(to_multi_metrics(
            parse_exposition(&text),
            self.target.name_prefix.as_deref(),
            self.host.as_deref(),
            Utc::now(),
        ))
    }

    async fn run(self, router: Arc<Router>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.target.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(url = %self.target.url, interval = ?self.target.interval, "starting prometheus scraper");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            match self.scrape_once().await {
                Ok(records) => {
                    debug!(url = %self.target.url, records = records.len(), "scraped node metrics");
                    for metrics in records {
                        if let Err(e) = router.log_multi_metrics(metrics).await {
                            warn!(url = %self.target.url, error = %e, "failed to route node metrics");
                        }
                    }
                }
                Err(e) => warn!(url = %self.target.url, error = %e, "scrape failed"),
            }
        }
        info!(url = %self.target.url, "prometheus scraper stopped");
    }
}

/// All running scrapers, stopped together.
pub struct Scrapers {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scrapers {
    /// Spawn one scraper per distinct endpoint URL. Invalid URLs are logged
    /// and skipped.
    pub fn start(targets: Vec<ScrapeTarget>, router: Arc<Router>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        for target in targets {
            if !seen.insert(target.url.clone()) {
                continue;
            }
            if target.interval.is_zero() {
                warn!(url = %target.url, "skipping prometheus endpoint with zero scrape interval");
                continue;
            }
            match Scraper::new(target) {
                Ok(scraper) => {
                    handles.push(tokio::spawn(scraper.run(Arc::clone(&router), stop_rx.clone())))
                }
                Err(e) => warn!(error = %e, "skipping prometheus endpoint"),
            }
        }
        if handles.is_empty() {
            info!("no prometheus endpoints are configured to be scraped");
        }
        Self { stop, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
