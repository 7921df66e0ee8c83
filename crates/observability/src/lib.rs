//! Process-wide tracing setup shared by every courier binary.

pub mod tracing;

pub use tracing::{LogFormat, ParseLogFormatError, TracingConfig};

/// Initialize tracing from the environment (`RUST_LOG`, `COURIER_LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::from_env());
}
