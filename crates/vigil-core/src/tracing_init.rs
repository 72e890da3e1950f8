//! Shared tracing/logging initialization.
//!
//! The engine binary and auxiliary tooling set up `tracing_subscriber`
//! the same way: an env-filter seeded from `RUST_LOG` with a caller
//! default, and either human-readable or JSON output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or unparsable
/// (e.g. `"vigil_engine=info"`); `log_json` switches to structured JSON
/// lines for log aggregation.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
