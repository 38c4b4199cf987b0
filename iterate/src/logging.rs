//! Diagnostic tracing for iterate.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted.
//! - **Session logs (`io/session_log`)**: product artifacts in
//!   `<workspace>/logs/`. Always written, unaffected by `RUST_LOG`.

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::types::OutputLevel;

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(level: OutputLevel) -> &'static str {
    match level {
        OutputLevel::Verbose => "iterate=debug,warn",
        OutputLevel::Progress => "warn",
        OutputLevel::Quiet => "error",
    }
}

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to a directive derived from `level`.
/// Output: stderr, compact format. Call once per process; a second call
/// panics.
///
/// # Example
/// ```bash
/// RUST_LOG=iterate=trace iterate run my-task
/// ```
pub fn init(level: OutputLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    subscriber(filter).init();
}

fn subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_enables_crate_debug() {
        assert_eq!(default_directive(OutputLevel::Verbose), "iterate=debug,warn");
        assert_eq!(default_directive(OutputLevel::Progress), "warn");
    }

    #[test]
    fn subscriber_applies_output_level_directive() {
        let quiet = subscriber(EnvFilter::new(default_directive(OutputLevel::Quiet)));
        tracing::subscriber::with_default(quiet, || {
            assert!(tracing::enabled!(tracing::Level::ERROR));
            assert!(!tracing::enabled!(tracing::Level::WARN));
        });

        let verbose = subscriber(EnvFilter::new(default_directive(OutputLevel::Verbose)));
        tracing::subscriber::with_default(verbose, || {
            assert!(tracing::enabled!(tracing::Level::DEBUG));
            assert!(!tracing::enabled!(tracing::Level::TRACE));
        });
    }
}
