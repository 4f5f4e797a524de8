//! Log output for the server.
//!
//! The filter sits behind a reload layer: tracing starts at a fixed level
//! before the config file is read, and [`apply_logging_level`] swaps in the
//! configured level afterwards.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install the global subscriber. A set `RUST_LOG` wins over `level` when it parses.
pub fn init_tracing_with_level(level: &str) {
    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        None => EnvFilter::new(level),
    };

    let (filter, handle) = reload::Layer::new(filter);
    if FILTER.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Switch to the configured level. No-op under `RUST_LOG` or before init.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let Some(handle) = FILTER.get() else {
        return;
    };
    if let Err(e) = handle.reload(EnvFilter::new(level)) {
        tracing::warn!(error = %e, level, "failed to apply logging level");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_logging_level_without_subscriber() {
        apply_logging_level("debug");
    }

    #[test]
    fn test_init_twice_keeps_the_first_subscriber() {
        init_tracing_with_level("warn");
        init_tracing_with_level("trace");
        apply_logging_level("info");
    }
}
