use std::env;
use std::io;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Filter directives, in `tracing_subscriber` syntax.
pub const LOG_ENV: &str = "CACHESTORE_LOG";
/// Forces debug output for this crate when set to anything but `0`.
pub const DEBUG_ENV: &str = "CACHESTORE_DEBUG";

const DEFAULT_FILTER: &str = "warn";

pub fn init_logging() {
    let forced_debug = env::var(DEBUG_ENV).is_ok_and(|value| !value.is_empty() && value != "0");
    let filter = if forced_debug {
        EnvFilter::new("cachestore=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    // A subscriber installed by the host program takes precedence.
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
