//! Global `tracing` logger configuration for ContextVM services and
//! examples.
//!
//! Filtering follows `RUST_LOG` when set, otherwise `LOG_LEVEL` (default
//! INFO). `LOG_ENABLED=false` disables output entirely, and `LOG_FILE=<path>`
//! appends plain (non-ANSI) output to a file instead of stdout.

use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Initialize the global logger, panicking if one is already set.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Initialize the global logger in tests. Multiple test threads race to set
/// the logger, so losing the race is fine; and when no `RUST_LOG` is set we
/// skip setup entirely to keep test output quiet.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Try to initialize the global logger.
pub fn try_init() -> Result<(), TryInitError> {
    if let Ok(enabled) = std::env::var("LOG_ENABLED") {
        if enabled.eq_ignore_ascii_case("false") || enabled == "0" {
            return Ok(());
        }
    }

    // `RUST_LOG` takes precedence and supports full target syntax;
    // `LOG_LEVEL` is the simpler single-level knob.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|spec| Targets::from_str(&spec).ok())
        .unwrap_or_else(|| {
            let level = std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| Level::from_str(&level).ok())
                .unwrap_or(Level::INFO);
            Targets::new().with_default(level)
        });

    let registry = tracing_subscriber::registry();

    match std::env::var("LOG_FILE").ok() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap_or_else(|e| {
                    panic!("Failed to open LOG_FILE '{path}': {e}")
                });
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(filter);
            registry.with(layer).try_init()
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(true)
                .with_ansi(true)
                .with_filter(filter);
            registry.with(layer).try_init()
        }
    }
}
