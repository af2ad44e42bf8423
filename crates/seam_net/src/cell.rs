//! Cell-based world partitioning
//!
//! Names the cell that contains a world position and predicts which cell a
//! moving player is about to enter.

use crate::CellId;
use seam_core::math::{self, Vec3};
use serde::{Deserialize, Serialize};

/// Grid layout for one map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellGrid {
    pub map_name: String,
    pub cell_size: f32, // Size in world units (10000.0 = 100m)
}

impl Default for CellGrid {
    fn default() -> Self {
        Self {
            map_name: "World".to_string(),
            cell_size: 10_000.0,
        }
    }
}

impl CellGrid {
    pub fn new(map_name: impl Into<String>, cell_size: f32) -> Self {
        Self {
            map_name: map_name.into(),
            cell_size,
        }
    }

    /// Integer grid coordinates of the cell containing `pos`.
    pub fn coords_at(&self, pos: Vec3) -> (i32, i32) {
        let p = math::planar(pos) / self.cell_size;
        (p.x.floor() as i32, p.y.floor() as i32)
    }

    /// Cell id as `"<map>_<x>_<y>"`.
    pub fn cell_at(&self, pos: Vec3) -> CellId {
        let (x, y) = self.coords_at(pos);
        CellId(format!("{}_{}_{}", self.map_name, x, y))
    }

    /// Cell a player moving with `velocity` reaches after travelling
    /// `lookahead` world units, if that differs from the current cell.
    pub fn predict_target_cell(&self, pos: Vec3, velocity: Vec3, lookahead: f32) -> Option<CellId> {
        if math::is_nearly_zero(velocity) {
            return None;
        }

        let predicted = pos + velocity.normalize_or_zero() * lookahead;
        let current = self.coords_at(pos);
        let next = self.coords_at(predicted);
        (current != next).then(|| self.cell_at(predicted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_naming_uses_floor_division() {
        let grid = CellGrid::new("Highlands", 100.0);
        assert_eq!(grid.cell_at(Vec3::new(50.0, 150.0, 900.0)).as_str(), "Highlands_0_1");
        assert_eq!(grid.cell_at(Vec3::new(-0.5, 0.0, 0.0)).as_str(), "Highlands_-1_0");
        assert_eq!(grid.cell_at(Vec3::new(100.0, -100.0, 0.0)).as_str(), "Highlands_1_-1");
    }

    #[test]
    fn stationary_player_predicts_nothing() {
        let grid = CellGrid::new("Highlands", 100.0);
        assert_eq!(grid.predict_target_cell(Vec3::new(95.0, 0.0, 0.0), Vec3::ZERO, 20.0), None);
    }

    #[test]
    fn crossing_predicts_neighbour() {
        let grid = CellGrid::new("Highlands", 100.0);
        let pos = Vec3::new(95.0, 50.0, 0.0);

        let target = grid.predict_target_cell(pos, Vec3::new(300.0, 0.0, 0.0), 20.0);
        assert_eq!(target, Some(CellId::from("Highlands_1_0")));

        let staying = grid.predict_target_cell(pos, Vec3::new(-300.0, 0.0, 0.0), 20.0);
        assert_eq!(staying, None);
    }
}
