//! Tile-based rasterization: binning, sorting, range extraction and the
//! forward/backward compositing kernels.

pub mod accum;
pub mod backward;
pub mod binning;
pub mod flat;
pub mod forward;
pub mod ranges;
pub mod sort;

pub use binning::{exclusive_scan, map_splats_to_intersects};
pub use ranges::{tile_bin_edges, TileBins};
pub use sort::{DepthSorter, IntersectSorter};

/// Splat index paired with its sort key for one tile overlap.
///
/// The key packs the tile id in the high 32 bits and the IEEE-754 bits of
/// the camera-space depth in the low 32. Depths are positive (everything
/// behind the near plane is culled), so their bit patterns order like the
/// floats and one ascending sort groups by tile and orders front to back
/// within each tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intersect {
    pub key: u64,
    pub splat_id: u32,
}

impl Intersect {
    pub fn new(tile_id: u32, depth: f32, splat_id: u32) -> Self {
        Self {
            key: (tile_id as u64) << 32 | depth.to_bits() as u64,
            splat_id,
        }
    }

    pub fn tile_id(&self) -> u32 {
        (self.key >> 32) as u32
    }

    pub fn depth_bits(&self) -> u32 {
        self.key as u32
    }
}
