use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LogConfig;

/// Initialize logging from the `log` section of the gateway config.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_tracing(log: &LogConfig) -> Result<()> {
    let level = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| log.level.clone());
    init_tracing_with_config(&level, log.json, true)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!(
        level,
        json = json_format,
        spans = include_spans,
        "routegate logging initialized"
    );
    Ok(())
}

/// Shutdown tracing gracefully
pub fn shutdown_tracing() {
    // tracing-subscriber has no explicit shutdown; this only marks the end of the log.
    tracing::info!("routegate tracing shutdown complete");
}

/// Create a request-scoped tracing span
pub fn create_request_span(
    service: &str,
    method: &str,
    path: &str,
    request_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "request",
        service = service,
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_config() {
        // Whichever call installs first, a second install must fail.
        let _ = init_tracing_with_config("debug", true, true);
        assert!(init_tracing_with_config("debug", true, true).is_err());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(init_tracing_with_config("info,routegate=notalevel", false, false).is_err());
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("orders", "GET", "/api/test", "req-123");
        assert_eq!(span.metadata().map(|m| m.name()), Some("request"));
    }
}
