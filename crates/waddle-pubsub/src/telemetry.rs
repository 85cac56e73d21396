//! Tracing initialisation for processes embedding the pubsub engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::LoggingSettings;

const DEFAULT_FILTER: &str = "info,waddle_pubsub=debug";

/// Install a console subscriber.
///
/// The filter comes from `RUST_LOG` when set, then from `WADDLE_LOG_LEVEL`,
/// then falls back to `info,waddle_pubsub=debug`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directives = build_log_filter(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("WADDLE_LOG_LEVEL").ok().as_deref(),
    );
    install(&directives)
}

/// Install a console subscriber using the `[logging]` settings level.
/// `RUST_LOG` still wins when set.
pub fn init_tracing_with(
    logging: &LoggingSettings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directives = build_log_filter(
        std::env::var("RUST_LOG").ok().as_deref(),
        Some(logging.level.as_str()),
    );
    install(&directives)
}

/// Resolve the filter directives. A bare level such as `warn` is scoped to
/// this crate as well so the default crate directive does not override it.
pub fn build_log_filter(rust_log: Option<&str>, level: Option<&str>) -> String {
    if let Some(rust_log) = rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        return rust_log.to_string();
    }
    match level.map(str::trim).filter(|s| !s.is_empty()) {
        Some(level) if !level.contains(['=', ',']) => {
            format!("{level},waddle_pubsub={level}")
        }
        Some(directives) => directives.to_string(),
        None => DEFAULT_FILTER.to_string(),
    }
}

fn install(directives: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(filter = %directives, "Tracing initialized");
    Ok(())
}
