//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs the process-wide subscriber (stderr)
//! - [`capture_logs`] installs a thread-local capturing subscriber for tests
//!
//! Relayed lines are logged on their own target so operators can raise or
//! silence the per-line traffic log independently of lifecycle events, e.g.
//! `RUST_LOG=info,wsproxy_server::relay=warn`.

pub mod test_utils;

use serde::{Deserialize, Serialize};

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

/// Output format for the stderr subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected compact or json)")),
        }
    }
}

/// Initialize the global tracing subscriber with stderr output.
///
/// `RUST_LOG` wins over `level` when set. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
