//! Logging initialization and span constructors.
//!
//! Every pipeline component logs through `tracing` with structured fields. The
//! span helpers here keep field names consistent across stages and daemons so
//! a single `ledger_id` query reconstructs an item's full history.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}' (expected json|pretty)")),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// `RUST_LOG` controls levels and defaults to `info`.
///
/// ```rust
/// use postflow_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one orchestrator stage applied to a ledger item.
#[must_use]
pub fn pipeline_span(stage: &str, ledger_id: &str) -> Span {
    tracing::info_span!("pipeline", stage = stage, ledger_id = ledger_id)
}

/// Creates a span for a singleton daemon cycle.
#[must_use]
pub fn daemon_span(daemon: &str, process_id: &str) -> Span {
    tracing::info_span!("daemon", daemon = daemon, process_id = process_id)
}
