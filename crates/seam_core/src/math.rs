//! World-space math utilities
//!
//! Re-exports glam with the helpers the mesh needs for cell addressing

pub use glam::*;

/// Tolerance below which a vector is treated as zero (matches the engine side).
pub const NEARLY_ZERO: f32 = 1.0e-4;

/// True if every component of `v` is within [`NEARLY_ZERO`] of zero.
pub fn is_nearly_zero(v: Vec3) -> bool {
    v.abs().max_element() <= NEARLY_ZERO
}

/// Projects a world position onto the horizontal grid plane (X/Y, Z up).
pub fn planar(v: Vec3) -> Vec2 {
    Vec2::new(v.x, v.y)
}
