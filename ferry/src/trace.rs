//! Logging for the driver and client.
//!
//! Enable with `--features tracing`. Without the feature every macro expands to
//! nothing, so the conductor's duty cycle pays no formatting cost.

/// Installs a global subscriber with uptime timestamps and thread names.
///
/// Honors `RUST_LOG`; falls back to `ferry=debug`. Safe to call more than once,
/// later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

/// Swallows its arguments; stands in for every level when tracing is off.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {discard as debug, discard as info, discard as trace, discard as warn};
