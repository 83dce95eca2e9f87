//! Tracing / logging initialisation helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log targets of the pipeline crates, for `--debug` / `--trace`.
pub const PIPELINE_TARGETS: &[&str] = &[
    "fabriclog_core",
    "fabriclog_decode",
    "fabriclog_listener",
    "fabriclog_output",
    "fabriclog",
];

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level or a full `RUST_LOG`-style directive list.
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Raise every pipeline target to `level`, leaving dependencies alone.
    pub fn with_pipeline_level(mut self, level: &str) -> Self {
        for target in PIPELINE_TARGETS {
            self.components.insert(target.to_string(), level.to_string());
        }
        self
    }

    /// The directive string, e.g. `"info,fabriclog_listener=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Initialise tracing with the given log config.
/// Should be called once at application startup; a second call fails.
pub fn init_tracing(config: &LogConfig) -> Result<(), TryInitError> {
    let directives = config.directives();
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("invalid log directives {directives:?} ({e}), falling back to info");
        EnvFilter::new("info")
    });

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    }
}
