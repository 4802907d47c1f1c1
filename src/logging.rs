//! Tracing setup for the `gitlayer` binary.
//!
//! The library only emits events; installing a subscriber is left to
//! whatever embeds it.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Longest `RUST_LOG` value we try to parse.
const MAX_FILTER_LEN: usize = 4096;

/// Build the filter: `RUST_LOG` when it is set and valid, else `default_level`.
pub fn build_filter(rust_log: Option<&str>, default_level: &str) -> EnvFilter {
    rust_log
        .map(str::trim)
        .filter(|raw| !raw.is_empty() && raw.len() <= MAX_FILTER_LEN)
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install a stderr fmt subscriber. Calling it twice is harmless.
pub fn init(default_level: &str) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), default_level);

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}
