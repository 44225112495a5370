//! Logging setup for binaries/embedders that want the crate's `log` calls
//! surfaced without writing their own `env_logger` boilerplate.

use log::LevelFilter;

/// Initialize `env_logger` at `Info` by default, respecting `RUST_LOG` if
/// set. Safe to call once per process; a second call is a no-op error from
/// `env_logger` that this function swallows.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .try_init();
}
