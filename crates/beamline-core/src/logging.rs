#![forbid(unsafe_code)]

//! JSON log output for production deployments.
//!
//! Beamline logs through `tracing`; installing a subscriber is the
//! embedder's choice. With the `tracing-json` feature enabled,
//! [`init_json`] installs a JSON formatter filtered by `RUST_LOG`, falling
//! back to the given directive.

use tracing_subscriber::EnvFilter;

/// Install a global JSON subscriber.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_json(default_directive: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
}
