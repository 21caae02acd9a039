//! Optional tracing subscriber setup.
//!
//! The SDK only emits `tracing` events. Applications that already install a
//! subscriber need nothing from here; small services and examples can call
//! [`init_tracing`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        "info,apitoolkit_core=debug"
    } else {
        "info,apitoolkit_core=warn"
    }
}

/// Install a formatted subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing(debug: bool) -> bool {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(debug))),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
