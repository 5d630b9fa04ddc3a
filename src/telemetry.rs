//! Logging setup for tests that use tunnels
//!
//! Plain tracing-based logging. This is test infrastructure, so there is no
//! exporter or metrics pipeline.
//!
//! # Example
//!
//! ```no_run
//! use kubetunnel::telemetry::init_logging;
//!
//! init_logging();
//! // Tunnel lifecycle events now go to stderr, filtered by RUST_LOG
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize logging with tracing-subscriber
///
/// Uses the RUST_LOG env var for filtering (default: info). Safe to call from
/// every test; only the first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
