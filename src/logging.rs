//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging breaker transitions and
//! stream delivery across many concurrent workers. Console output honors
//! `RELAY_LOG` (falling back to sensible per-environment defaults); production
//! environments emit JSON for log aggregation.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Safe to call from multiple entry points (tests, embedding applications); if a
/// global subscriber is already installed this is a no-op.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_env("RELAY_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&environment)));

        let console_layer = if environment == "production" {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .json()
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(console_layer.with_filter(filter));

        // A host application may have installed its own subscriber already.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized - keeping existing");
        } else {
            tracing::info!(environment = %environment, "🔧 LOGGING: structured logging initialized");
        }
    });
}

fn get_environment() -> String {
    std::env::var("RELAY_ENV").unwrap_or_else(|_| "development".to_string())
}

fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}
