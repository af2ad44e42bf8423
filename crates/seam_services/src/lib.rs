//! Seam Services Layer
//!
//! Settings loading and logging setup for mesh nodes.

pub mod settings;

pub use settings::{Settings, SettingsError};

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` if set and parseable, otherwise `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Installs the global fmt subscriber.
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter))
        .with_target(false)
        .finish()
        .try_init()
}

