//! Structured logging setup.
//!
//! Output format is one of:
//!
//! - `json`: one JSON object per line, for log aggregation
//! - `pretty`: multi-line, coloured, for development
//! - `compact`: single-line, coloured, for terminals
//!
//! `RUST_LOG` overrides the level passed in code.

use std::env;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parses a format name, falling back to JSON for anything unknown.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

fn filter_for(level: Level) -> EnvFilter {
    match env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(level.to_string()),
    }
}

/// Installs the global subscriber.
///
/// Returns `false` if a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init_logging(format: LogFormat, level: Level) -> bool {
    let registry = tracing_subscriber::registry().with(filter_for(level));
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty().with_ansi(true)).try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
    };
    installed.is_ok()
}

/// Installs the global subscriber from `LOG_FORMAT` and `LOG_LEVEL`.
pub fn init_from_env() -> bool {
    let level = match env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_uppercase()
        .as_str()
    {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    };
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    init_logging(format, level)
}
