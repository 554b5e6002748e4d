//! Tracing subscriber setup. `RUST_LOG` overrides the default filter.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "snapshottool=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines on stderr.
    Human,
    /// One JSON object per event on stderr.
    Json,
}

static INIT_ONCE: Once = Once::new();

/// Installs the global subscriber; later calls are no-ops.
pub fn init(format: LogFormat) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        // A subscriber installed elsewhere (tests) wins.
        let _ = match format {
            LogFormat::Human => builder.with_target(false).try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    });
}
