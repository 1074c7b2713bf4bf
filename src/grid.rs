//! Tile grid arithmetic.
//!
//! The image is partitioned into fixed-size square tiles; the grid covers the
//! image with ceiling division, so edge tiles may be partial. Tile ids are
//! row-major.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TileGrid {
    /// Side length of a square tile, in pixels.
    pub tile_size: u32,
    /// Number of tiles along x.
    pub tiles_x: u32,
    /// Number of tiles along y.
    pub tiles_y: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        Self {
            tile_size,
            tiles_x: width.div_ceil(tile_size),
            tiles_y: height.div_ceil(tile_size),
        }
    }

    /// Total number of tiles.
    pub fn num_tiles(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize
    }

    /// Row-major tile id for tile coordinates.
    pub fn tile_id(&self, tx: u32, ty: u32) -> u32 {
        ty * self.tiles_x + tx
    }

    /// Tile coordinates for a tile id.
    pub fn tile_coords(&self, tile_id: u32) -> (u32, u32) {
        (tile_id % self.tiles_x, tile_id / self.tiles_x)
    }

    /// Tile-space bounding box `[min, max)` of a screen-space circle,
    /// clamped to the grid.
    pub fn tile_bbox(&self, center: Vector2<f32>, radius: f32) -> TileBbox {
        let ts = self.tile_size as f32;
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(self.tiles_x);
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(self.tiles_y);
        TileBbox {
            min_x: clamp_x((center.x - radius) / ts),
            min_y: clamp_y((center.y - radius) / ts),
            max_x: clamp_x((center.x + radius) / ts + 1.0),
            max_y: clamp_y((center.y + radius) / ts + 1.0),
        }
    }
}

/// Half-open tile-coordinate bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileBbox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileBbox {
    /// Number of tiles covered; zero when the box is empty or off-grid.
    pub fn area(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x) * self.max_y.saturating_sub(self.min_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions_round_up() {
        let grid = TileGrid::new(100, 60, 16);
        assert_eq!(grid.tiles_x, 7);
        assert_eq!(grid.tiles_y, 4);
        assert_eq!(grid.num_tiles(), 28);
    }

    #[test]
    fn test_tile_id_roundtrip() {
        let grid = TileGrid::new(64, 64, 16);
        for ty in 0..grid.tiles_y {
            for tx in 0..grid.tiles_x {
                assert_eq!(grid.tile_coords(grid.tile_id(tx, ty)), (tx, ty));
            }
        }
    }

    #[test]
    fn test_bbox_clamps_to_grid() {
        let grid = TileGrid::new(64, 64, 16);
        let bbox = grid.tile_bbox(Vector2::new(-100.0, 32.0), 8.0);
        assert_eq!(bbox.area(), 0);

        let bbox = grid.tile_bbox(Vector2::new(8.0, 8.0), 4.0);
        assert_eq!(bbox, TileBbox { min_x: 0, min_y: 0, max_x: 1, max_y: 1 });
        assert_eq!(bbox.area(), 1);
    }

    #[test]
    fn test_bbox_spanning_multiple_tiles() {
        let grid = TileGrid::new(64, 64, 16);
        let bbox = grid.tile_bbox(Vector2::new(32.0, 32.0), 17.0);
        assert_eq!(bbox.min_x, 0);
        assert_eq!(bbox.min_y, 0);
        assert_eq!(bbox.max_x, 4);
        assert_eq!(bbox.max_y, 4);
    }
}
