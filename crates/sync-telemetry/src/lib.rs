//! # Sync Telemetry
//!
//! Logging bootstrap for the sync daemon. Library crates only emit
//! `tracing` events; the host process (or a test suite) installs the
//! subscriber once through this crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sync_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let config = TelemetryConfig::from_env();
//!     init_telemetry(&config).expect("Failed to init telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `sync-daemon` | Service name in logs |
//! | `SYNC_LOG_LEVEL` | `info` | Log level filter |
//! | `SYNC_JSON_LOGS` | `false` | JSON output |
//! | `SYNC_CONSOLE_OUTPUT` | `true` | Console output |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;

use std::sync::Once;
use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install the global tracing subscriber described by `config`.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    tracing_setup::init_tracing(config)
}

/// Install a debug-level subscriber once per test binary.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another harness may already own the global subscriber
        let _ = init_telemetry(&TelemetryConfig::for_tests());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still logging after repeated init");
    }
}
