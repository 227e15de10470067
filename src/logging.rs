// src/logging.rs
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when it is set. Otherwise the level is `debug` or `info`.
/// Calling this twice is harmless; the second call returns `false`.
pub fn init_logging(debug: bool) -> bool {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_file(debug)
        .with_line_number(debug)
        .try_init()
        .is_ok()
}
