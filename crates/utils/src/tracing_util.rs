//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// The filter used when `RUST_LOG` is unset.  Our console diagnostics
/// (default entry, label collisions, commands issued) are all at `info`.
const DEFAULT_FILTER: &str = "info";

/// Initialize tracing with the default configuration.
pub fn initialize_tracing() {
    // When running as root, also forward key messages to the journal; this
    // is typically invoked from a systemd unit after kernel updates.
    let journald_layer = if rustix::process::getuid().is_root() {
        tracing_journald::layer()
            .ok()
            .map(|layer| layer.with_filter(tracing_subscriber::filter::LevelFilter::INFO))
    } else {
        None
    };

    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    match journald_layer {
        Some(journald) => {
            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(journald)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(fmt_layer).init();
        }
    }
}
