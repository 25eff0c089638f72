//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::StatsConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV: &str = "HTC_AGENT_LOG_FORMAT";

/// Log output options, taken from the stats configuration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub json: bool,
    pub debug: bool,
}

impl From<&StatsConfig> for LogOptions {
    fn from(stats: &StatsConfig) -> Self {
        Self {
            json: stats.log_json,
            debug: stats.debug,
        }
    }
}

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to compact text and switches to JSON with
/// `options.json` or `HTC_AGENT_LOG_FORMAT=json`. The filter comes from
/// `RUST_LOG` when set, otherwise `debug` or `info` per `options.debug`.
pub fn init_tracing(options: LogOptions) {
    TRACING_INIT.get_or_init(|| {
        let default_level = if options.debug { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let json = options.json
            || std::env::var(LOG_FORMAT_ENV)
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
