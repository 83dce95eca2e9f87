//! Configuration loading: file schema → resolved config, with flag overrides.
//!
//! The file is YAML or JSON. Every setting is optional in the file; required
//! settings must come from either the file or a flag, and all problems are
//! reported together before startup fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fabriclog_core::{RetryPolicy, WaitTime};
use fabriclog_listener::EventSubscription;
use fabriclog_observability::LogConfig;
use fabriclog_output::{EventMetadata, HecConfig, RouterConfig, SourceTypes, DEFAULT_SOURCETYPE_PREFIX};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::flags::{Flags, OutputKind};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "fabriclog.yaml";

/// Network profile selecting the bundled in-memory ledger client.
pub const MOCK_NETWORK: &str = "mock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported file format for config path {0} (use .yaml or .json file extension)")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid wait time: {0}")]
    InvalidWaitTime(String),

    #[error("{}", format_problems(.0))]
    Problems(Vec<String>),
}

fn format_problems(problems: &[String]) -> String {
    match problems {
        [one] => one.clone(),
        many => format!(
            "Detected {} problems in fabriclog configuration: {}",
            many.len(),
            many.join("; ")
        ),
    }
}

// ─── Durations and wait times ────────────────────────────────────────────────

/// A number of milliseconds or a humantime string such as `"1s"` or `"1h30m"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationConfig {
    Millis(u64),
    Text(String),
}

impl DurationConfig {
    pub fn to_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            Self::Millis(ms) => Ok(Duration::from_millis(*ms)),
            Self::Text(text) => {
                let trimmed = text.trim();
                if let Ok(ms) = trimmed.parse::<u64>() {
                    return Ok(Duration::from_millis(ms));
                }
                humantime::parse_duration(trimmed).map_err(|e| ConfigError::InvalidDuration {
                    value: text.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn duration_or(value: &Option<DurationConfig>, default: Duration) -> Result<Duration, ConfigError> {
    value.as_ref().map_or(Ok(default), DurationConfig::to_duration)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackoffConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub min: Option<DurationConfig>,
    pub step: Option<DurationConfig>,
    pub max: Option<DurationConfig>,
}

/// A fixed duration or a `linear-backoff` / `exponential-backoff` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WaitTimeConfig {
    Fixed(DurationConfig),
    Backoff(BackoffConfig),
}

pub fn wait_time_from_config(config: &WaitTimeConfig) -> Result<WaitTime, ConfigError> {
    match config {
        WaitTimeConfig::Fixed(d) => Ok(WaitTime::Fixed(d.to_duration()?)),
        WaitTimeConfig::Backoff(b) => match b.kind.as_str() {
            "exponential-backoff" => Ok(WaitTime::Exponential {
                min: duration_or(&b.min, Duration::ZERO)?,
                max: duration_or(&b.max, Duration::from_secs(10))?,
            }),
            "linear-backoff" => {
                let max = b.max.as_ref().map(DurationConfig::to_duration).transpose()?;
                let step = duration_or(&b.step, Duration::from_secs(1))?;
                match max {
                    Some(max) if step <= max => Ok(WaitTime::Linear {
                        min: duration_or(&b.min, Duration::ZERO)?,
                        step,
                        max,
                    }),
                    _ => Err(ConfigError::InvalidWaitTime(
                        "linear-backoff requires max, and step must not exceed max".into(),
                    )),
                }
            }
            other => Err(ConfigError::InvalidWaitTime(format!("unknown type '{other}'"))),
        },
    }
}

// ─── File schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSchema {
    pub checkpoint: CheckpointSchema,
    pub fabric: FabricSchema,
    pub hec: HecClientsSchema,
    pub output: OutputSchema,
    pub prometheus: PrometheusSchema,
    pub server: ServerSchema,
    pub logging: Option<LogConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointSchema {
    pub filename: Option<PathBuf>,
    pub save_interval: Option<DurationConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CcEventSchema {
    pub channel_name: Option<String>,
    pub chaincode_id: Option<String>,
    pub filter: Option<String>,
    pub block: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FabricSchema {
    pub peer: Option<String>,
    pub msp: Option<String>,
    pub network_config: Option<String>,
    pub user: Option<String>,
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    pub client_key_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub channels: Vec<String>,
    pub ccevents: Vec<CcEventSchema>,
    pub start_block: Option<u64>,
    pub retry_wait_time: Option<WaitTimeConfig>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HecClientsSchema {
    pub default: HecSchema,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataSchema {
    pub host: Option<String>,
    pub source: Option<String>,
    pub sourcetype: Option<String>,
    pub index: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HecSchema {
    pub url: Option<String>,
    pub token: Option<String>,
    pub default_metadata: MetadataSchema,
    pub default_fields: BTreeMap<String, serde_json::Value>,
    pub max_queue_entries: Option<usize>,
    pub flush_time: Option<DurationConfig>,
    pub timeout: Option<DurationConfig>,
    pub max_retries: Option<u32>,
    pub retry_wait_time: Option<WaitTimeConfig>,
    pub validate_certificate: Option<bool>,
    pub user_agent: Option<String>,
    pub wait_for_availability: Option<DurationConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSchema {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub source_type_prefix: Option<String>,
    pub sourcetypes: SourceTypes,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointSchema {
    pub url: String,
    pub scrape_interval: Option<DurationConfig>,
    pub name_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusSchema {
    pub endpoints: Vec<EndpointSchema>,
    pub scrape_interval: Option<DurationConfig>,
    pub name_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSchema {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

// ─── Resolved config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub filename: PathBuf,
    pub save_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub peer: String,
    pub msp: String,
    pub network_config: String,
    pub user: String,
    pub key_file: String,
    pub cert_file: String,
    pub client_key_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub channels: Vec<String>,
    pub ccevents: Vec<EventSubscription>,
    pub start_block: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputConfig {
    Hec,
    Console,
    File { path: PathBuf },
    Null,
}

#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    pub url: String,
    pub interval: Duration,
    pub name_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct FabriclogConfig {
    pub checkpoint: CheckpointConfig,
    pub fabric: FabricConfig,
    /// Set when both URL and token are known.
    pub hec: Option<HecConfig>,
    pub hec_wait_for_availability: Duration,
    pub output: OutputConfig,
    pub router: RouterConfig,
    pub prometheus: Vec<ScrapeTarget>,
    pub server: ServerConfig,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

pub fn load_config_file(path: &Path) -> Result<ConfigSchema, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let is_json = match ext {
        "json" => true,
        "yaml" | "yml" => false,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = if is_json {
        serde_json::from_str(&text).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&text).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Read the config file named by `--config-file`, else `./fabriclog.yaml`
/// when present, else start from an empty schema.
pub fn load_schema(flags: &Flags) -> Result<ConfigSchema, ConfigError> {
    if let Some(path) = &flags.config_file {
        return load_config_file(path);
    }
    let default_path = Path::new(DEFAULT_CONFIG_FILE_NAME);
    if default_path.exists() {
        return load_config_file(default_path);
    }
    Ok(ConfigSchema::default())
}

/// Logging settings: file `logging` section, raised by `--debug`/`--trace`.
pub fn log_config(schema: &ConfigSchema, flags: &Flags) -> LogConfig {
    let mut cfg = schema.logging.clone().unwrap_or_default();
    if flags.log_json {
        cfg.json = true;
    }
    if flags.trace {
        cfg.with_pipeline_level("trace")
    } else if flags.debug {
        cfg.with_pipeline_level("debug")
    } else {
        cfg
    }
}

fn parse_ccevents(entries: &[CcEventSchema]) -> Vec<EventSubscription> {
    entries
        .iter()
        .filter_map(|e| match (&e.channel_name, &e.chaincode_id, &e.filter) {
            (Some(channel), Some(cc), Some(filter)) if !filter.is_empty() => Some(
                EventSubscription::new(channel, cc, filter).with_start_block(e.block.unwrap_or(0)),
            ),
            _ => {
                warn!(?e, "ignoring ccevents entry without channelName, chaincodeId and filter");
                None
            }
        })
        .collect()
}

/// Resolve the schema and flags into a validated config.
pub fn resolve(schema: ConfigSchema, flags: &Flags) -> Result<FabriclogConfig, ConfigError> {
    let mut problems = Vec::new();
    let mut required = |flag: &str, from_flag: &Option<String>, from_file: &Option<String>| {
        match from_flag.clone().or_else(|| from_file.clone()) {
            Some(v) => v,
            None => {
                problems.push(format!("Missing required option --{flag}"));
                String::new()
            }
        }
    };

    let fabric_schema = &schema.fabric;
    let peer = required("peer", &flags.peer, &fabric_schema.peer);
    let msp = required("msp", &flags.msp, &fabric_schema.msp);
    let network_config = required("network", &flags.network, &fabric_schema.network_config);
    let user = required("user", &flags.user, &fabric_schema.user);
    let key_file = required("user-key", &flags.user_key, &fabric_schema.key_file);
    let cert_file = required("user-cert", &flags.user_cert, &fabric_schema.cert_file);

    let fabric_wait = match &fabric_schema.retry_wait_time {
        Some(w) => wait_time_from_config(w)?,
        None => WaitTime::Exponential {
            min: Duration::from_millis(10),
            max: Duration::from_millis(5000),
        },
    };
    let fabric = FabricConfig {
        peer,
        msp,
        network_config,
        user,
        key_file,
        cert_file,
        client_key_file: flags.client_key.clone().or_else(|| fabric_schema.client_key_file.clone()),
        client_cert_file: flags.client_cert.clone().or_else(|| fabric_schema.client_cert_file.clone()),
        channels: fabric_schema.channels.clone(),
        ccevents: parse_ccevents(&fabric_schema.ccevents),
        start_block: fabric_schema.start_block.unwrap_or(0),
        retry: RetryPolicy::new(fabric_wait, fabric_schema.max_retries.unwrap_or(30)),
    };

    let checkpoint = CheckpointConfig {
        filename: flags
            .checkpoints_file
            .clone()
            .or_else(|| schema.checkpoint.filename.clone())
            .unwrap_or_else(|| PathBuf::from(".checkpoints")),
        save_interval: duration_or(&schema.checkpoint.save_interval, Duration::from_millis(100))?,
    };

    let output_kind = match (flags.output, schema.output.kind.as_deref()) {
        (Some(kind), _) => kind,
        (None, None | Some("hec")) => OutputKind::Hec,
        (None, Some("console")) => OutputKind::Console,
        (None, Some("file")) => OutputKind::File,
        (None, Some("null")) => OutputKind::Null,
        (None, Some(other)) => {
            problems.push(format!("Unknown output type '{other}' (use hec, console, file or null)"));
            OutputKind::Null
        }
    };
    let output = match output_kind {
        OutputKind::Hec => OutputConfig::Hec,
        OutputKind::Console => OutputConfig::Console,
        OutputKind::Null => OutputConfig::Null,
        OutputKind::File => match &schema.output.path {
            Some(path) => OutputConfig::File { path: path.clone() },
            None => {
                problems.push("File output requires output.path".to_string());
                OutputConfig::Null
            }
        },
    };
    let router = RouterConfig {
        sourcetype_prefix: schema
            .output
            .source_type_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_SOURCETYPE_PREFIX.to_string()),
        sourcetypes: schema.output.sourcetypes.clone(),
    };

    let hec_schema = &schema.hec.default;
    let hec_url = flags.hec_url.clone().or_else(|| hec_schema.url.clone());
    let hec_token = flags.hec_token.clone().or_else(|| hec_schema.token.clone());
    if output == OutputConfig::Hec {
        if hec_url.is_none() {
            problems.push(
                "No URL for HEC events specified. Use --hec-url or configure via fabriclog.yaml".to_string(),
            );
        }
        if hec_token.is_none() {
            problems.push(
                "No HEC token specified. Use --hec-token or configure via fabriclog.yaml".to_string(),
            );
        }
    }
    let hec = match (hec_url, hec_token) {
        (Some(url), Some(token)) => Some(hec_config(url, token, hec_schema, flags)?),
        _ => None,
    };
    if hec.as_ref().is_some_and(|h| h.flush_time.is_zero()) {
        problems.push("hec.default.flushTime must be greater than zero".to_string());
    }

    if !fabric.network_config.is_empty() && fabric.network_config != MOCK_NETWORK {
        problems.push(format!(
            "Unsupported network config '{}': only '{MOCK_NETWORK}' is bundled",
            fabric.network_config
        ));
    }

    let default_interval = duration_or(&schema.prometheus.scrape_interval, Duration::from_secs(10))?;
    let mut prometheus = Vec::new();
    for endpoint in &schema.prometheus.endpoints {
        if endpoint.url.is_empty() {
            warn!("ignoring prometheus endpoint without url");
            continue;
        }
        let interval = duration_or(&endpoint.scrape_interval, default_interval)?;
        if interval.is_zero() {
            problems.push(format!("Scrape interval of {} must be greater than zero", endpoint.url));
        }
        prometheus.push(ScrapeTarget {
            url: endpoint.url.clone(),
            interval,
            name_prefix: endpoint
                .name_prefix
                .clone()
                .or_else(|| schema.prometheus.name_prefix.clone()),
        });
    }

    let server = ServerConfig {
        enabled: schema.server.enabled.unwrap_or(true),
        host: schema.server.host.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
        port: flags.port.or(schema.server.port).unwrap_or(8080),
    };

    if !problems.is_empty() {
        for msg in &problems {
            error!("Detected problem in fabriclog config: {msg}");
        }
        return Err(ConfigError::Problems(problems));
    }

    let config = FabriclogConfig {
        checkpoint,
        fabric,
        hec,
        hec_wait_for_availability: duration_or(&hec_schema.wait_for_availability, Duration::ZERO)?,
        output,
        router,
        prometheus,
        server,
    };
    debug!(?config.output, peer = %config.fabric.peer, "resolved configuration");
    Ok(config)
}

fn hec_config(
    url: String,
    token: String,
    schema: &HecSchema,
    flags: &Flags,
) -> Result<HecConfig, ConfigError> {
    let mut cfg = HecConfig::new(url, token);
    let meta = &schema.default_metadata;
    cfg.default_metadata = EventMetadata {
        source: meta.source.clone(),
        sourcetype: meta.sourcetype.clone(),
        index: flags
            .hec_events_index
            .clone()
            .or_else(|| meta.index.clone())
            .or_else(|| Some("hyperledger_logs".to_string())),
        host: meta.host.clone(),
    };
    cfg.default_fields = schema.default_fields.clone();
    if let Some(n) = schema.max_queue_entries {
        cfg.max_queue_entries = n.max(1);
    }
    cfg.flush_time = duration_or(&schema.flush_time, cfg.flush_time)?;
    cfg.timeout = duration_or(&schema.timeout, cfg.timeout)?;
    let wait = match &schema.retry_wait_time {
        Some(w) => wait_time_from_config(w)?,
        None => cfg.retry.wait.clone(),
    };
    cfg.retry = RetryPolicy::new(wait, schema.max_retries.unwrap_or(cfg.retry.max_attempts));
    cfg.validate_certificate = flags
        .hec_reject_invalid_certs
        .or(schema.validate_certificate)
        .unwrap_or(true);
    if let Some(ua) = &schema.user_agent {
        cfg.user_agent = ua.clone();
    }
    Ok(cfg)
}
