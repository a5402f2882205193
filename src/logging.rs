//! # Structured Logging
//!
//! Environment-aware tracing initialisation. Console output is always
//! on; setting `BATCHLINE_LOG_DIR` adds a JSON file layer for debugging
//! long-running dispatchers.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process. Safe to call from
/// multiple dispatchers; later calls are no-ops, as is running under a
/// host application that already installed a subscriber.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let directives = std::env::var("BATCHLINE_LOG")
            .unwrap_or_else(|_| default_log_level(&environment));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(EnvFilter::new(&directives));

        let file_layer = std::env::var("BATCHLINE_LOG_DIR").ok().map(|dir| {
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
            let file_appender = tracing_appender::rolling::never(
                dir,
                format!("batchline.{}.{timestamp}.log", std::process::id()),
            );
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            // The guard must outlive the process for the writer to flush.
            std::mem::forget(guard);
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(&directives))
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already installed, keeping it");
        }
    });
}

fn get_environment() -> String {
    std::env::var("BATCHLINE_ENV").unwrap_or_else(|_| "development".to_string())
}

fn default_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level_by_environment() {
        assert_eq!(default_log_level("production"), "info");
        assert_eq!(default_log_level("development"), "debug");
        assert_eq!(default_log_level("test"), "debug");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
