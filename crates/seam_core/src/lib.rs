//! Seam Core
//!
//! Shared foundations for the mesh crates:
//! - Engine version
//! - World-space math used for cell addressing

pub mod math;

pub use glam;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
