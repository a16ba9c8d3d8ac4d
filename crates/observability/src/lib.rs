//! Process-wide tracing setup shared by the backfill binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig};

/// Initialize tracing with the defaults (`info`, JSON, `RUST_LOG` overrides).
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(&TracingConfig::from_env());
}
