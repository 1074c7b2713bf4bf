//! Expansion of projected splats into per-tile intersection entries.

use nalgebra::Vector2;

use crate::grid::TileGrid;

use super::Intersect;

/// Exclusive prefix sum. Returns the scanned counts and the total.
pub fn exclusive_scan(counts: &[u32]) -> (Vec<u32>, u32) {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut total = 0u32;
    for &c in counts {
        offsets.push(total);
        total += c;
    }
    (offsets, total)
}

/// Emit one `Intersect` per (splat, overlapped tile) pair.
///
/// Entries land at the offsets given by the exclusive scan of
/// `num_tiles_hit`, so the output is grouped by splat id before sorting.
/// Culled splats (zero radius) contribute nothing. The slices come from
/// either projector variant; they are parallel per splat.
pub fn map_splats_to_intersects(
    xys: &[Vector2<f32>],
    depths: &[f32],
    radii: &[u32],
    num_tiles_hit: &[u32],
    grid: &TileGrid,
) -> Vec<Intersect> {
    let (offsets, total) = exclusive_scan(num_tiles_hit);
    let mut isects = Vec::with_capacity(total as usize);

    for idx in 0..radii.len() {
        if radii[idx] == 0 {
            continue;
        }
        debug_assert_eq!(isects.len(), offsets[idx] as usize);

        let bbox = grid.tile_bbox(xys[idx], radii[idx] as f32);
        for ty in bbox.min_y..bbox.max_y {
            for tx in bbox.min_x..bbox.max_x {
                isects.push(Intersect::new(grid.tile_id(tx, ty), depths[idx], idx as u32));
            }
        }
    }
    debug_assert_eq!(isects.len(), total as usize);

    isects
}
