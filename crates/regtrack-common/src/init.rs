//! Global initialization utilities for the application

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();
static TRACING: Once = Once::new();

/// Initialize the application environment
///
/// This should be called once at the start of the application to load
/// environment variables from a .env file if one exists.
///
/// Safe to call multiple times - will only run once
pub fn initialize_environment() {
    INIT.call_once(|| {
        // Loads from current directory or searches up the tree
        dotenvy::dotenv().ok();
    });
}

/// Initialize the global tracing subscriber
///
/// Respects `RUST_LOG`; falls back to the provided default directive when
/// the variable is unset. Safe to call multiple times - will only run once,
/// which keeps tests that share a process from panicking on double init.
pub fn init_tracing(default_directive: &str) {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
