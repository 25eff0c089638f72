//! Configuration structures.
//!
//! Configuration is loaded from an optional JSON file and then overridden by
//! command line flags and environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};
use crate::invoke::{Encoding, MethodSchema};

/// Global agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Telemetry aggregation configuration.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Remote backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Pub/Sub connection configuration.
    #[serde(default)]
    pub pubsub: PubSubConfig,

    /// Pull subscription flow control.
    #[serde(default)]
    pub receive: ReceiveConfig,

    /// Load-test source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Push front configuration.
    #[serde(default)]
    pub push: PushConfig,

    /// Payload encodings on the broker side.
    #[serde(default)]
    pub encoding: EncodingConfig,

    /// Hostname attached to every response message.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Config {
    /// Load from a JSON configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Hostname for response attributes, falling back to the environment.
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Reject invalid values before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.stats.freq.is_zero() {
            return Err(Error::config("statistics frequency must be greater than zero"));
        }
        if self.source.rate < 0.0 || !self.source.rate.is_finite() {
            return Err(Error::config(format!(
                "invalid rate {}, expecting a finite value >= 0",
                self.source.rate
            )));
        }
        if self.source.max_outstanding == 0 {
            return Err(Error::config("max outstanding requests must be at least 1"));
        }
        if self.receive.max_outstanding == 0 {
            return Err(Error::config("max outstanding messages must be at least 1"));
        }
        if self.receive.pull_concurrency == 0 {
            return Err(Error::config("pull concurrency must be at least 1"));
        }
        if self.receive.min_extension > self.receive.max_extension {
            return Err(Error::config(
                "minimum deadline extension exceeds the maximum extension",
            ));
        }
        Ok(())
    }
}

/// Telemetry aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Report frequency.
    #[serde(with = "humantime_serde")]
    pub freq: Duration,

    /// Cancel the process once idle for this long (disabled when unset).
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,

    /// Log every task start and completion.
    pub log_all: bool,

    /// Emit reports (and all logs) as JSON.
    pub log_json: bool,

    /// Enable debug logging.
    pub debug: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            freq: Duration::from_secs(5),
            idle_timeout: None,
            log_all: false,
            log_json: false,
            debug: false,
        }
    }
}

/// Remote backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Target, `http(s)://<host>(:<port>)?/<service>/<method>`.
    pub endpoint: Option<String>,

    /// Per-call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Bearer token for https backends.
    pub access_token: Option<String>,

    /// Known method schemas, resolved by service and method name.
    #[serde(default)]
    pub methods: Vec<MethodSchema>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(60),
            access_token: None,
            methods: Vec::new(),
        }
    }
}

/// Pub/Sub connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Project hosting topics and subscriptions.
    pub project: Option<String>,

    /// REST API base URL.
    pub api_base: String,

    /// OAuth access token sent as bearer credentials.
    pub access_token: Option<String>,

    /// Emulator `host:port`; overrides `api_base` and disables credentials.
    pub emulator_host: Option<String>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project: None,
            api_base: "https://pubsub.googleapis.com".to_string(),
            access_token: None,
            emulator_host: None,
        }
    }
}

/// Pull subscription flow control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Maximum messages pulled but not yet acked/nacked.
    pub max_outstanding: usize,

    /// Minimum deadline extension for processing tasks.
    #[serde(with = "humantime_serde")]
    pub min_extension: Duration,

    /// Maximum total deadline for processing tasks.
    #[serde(with = "humantime_serde")]
    pub max_extension: Duration,

    /// Number of concurrent receive loops.
    pub pull_concurrency: usize,

    /// Handle messages inline in the receive loop instead of per-message tasks.
    pub synchronous: bool,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 1,
            min_extension: Duration::from_secs(600),
            max_extension: Duration::from_secs(60 * 60),
            pull_concurrency: 1,
            synchronous: false,
        }
    }
}

/// Load-test source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Newline-delimited payload file.
    pub path: Option<PathBuf>,

    /// Loop over the source until cancelled.
    #[serde(rename = "loop")]
    pub looped: bool,

    /// Items per second (0 = no limit).
    pub rate: f64,

    /// Duration of the ramp to the full rate (0 = no ramp).
    #[serde(with = "humantime_serde")]
    pub ramp: Duration,

    /// Number of steps for ramping.
    pub ramp_steps: u32,

    /// Maximum parallel operations (0 = serial).
    pub max_parallel: usize,

    /// Maximum published requests awaiting confirmation.
    pub max_outstanding: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            looped: false,
            rate: 0.0,
            ramp: Duration::ZERO,
            ramp_steps: 0,
            max_parallel: 0,
            max_outstanding: 250_000,
        }
    }
}

/// Push front configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Listen port.
    pub port: u16,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Payload encodings on the broker side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncodingConfig {
    pub input: Encoding,
    pub output: Encoding,
}
