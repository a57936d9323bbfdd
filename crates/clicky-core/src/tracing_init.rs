//! Shared tracing/logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose logs are filtered by the configured level.
const TARGETS: &[&str] = &["clicky_serves", "clicky_core", "tower_http"];

/// Build the default filter directive for `level`, e.g.
/// `clicky_serves=debug,clicky_core=debug,tower_http=debug`.
pub fn default_filter(level: &str) -> String {
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. With `log_json` the
/// subscriber emits structured JSON lines instead of the human-readable format.
pub fn init_tracing(level: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(level)));
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run `f` with a stderr subscriber at `warn`, for work that happens before
/// the configured subscriber can be built (loading the config itself).
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}
