//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application. These helpers install a formatted subscriber filtered
//! by `TRIALBOOK_LOG` (default `info`), and are safe to call more than once.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "TRIALBOOK_LOG";

/// Install the default subscriber.
///
/// Returns `false` if a global subscriber was already set.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter)
}

/// Install a subscriber with an explicit filter directive (e.g.
/// `"trialbook=debug"`), ignoring `TRIALBOOK_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_with_filter(directive: &str) -> bool {
    install(EnvFilter::new(directive))
}

fn install(filter: EnvFilter) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
