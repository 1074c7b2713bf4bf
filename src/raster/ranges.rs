//! Contiguous per-tile ranges over the sorted intersection list.

use super::Intersect;

/// Half-open index ranges into the sorted intersection list, one per tile.
///
/// Tiles with no splats keep `(0, 0)`. Over the non-empty tiles the ranges
/// partition `0..isects.len()` exactly.
#[derive(Clone, Debug)]
pub struct TileBins {
    pub ranges: Vec<(u32, u32)>,
}

impl TileBins {
    pub fn range(&self, tile_id: u32) -> std::ops::Range<usize> {
        let (start, end) = self.ranges[tile_id as usize];
        start as usize..end as usize
    }
}

/// Scan the sorted list for tile-id boundaries.
pub fn tile_bin_edges(isects: &[Intersect], num_tiles: usize) -> TileBins {
    let mut ranges = vec![(0u32, 0u32); num_tiles];

    for (i, isect) in isects.iter().enumerate() {
        let tile = isect.tile_id() as usize;
        if i == 0 || isects[i - 1].tile_id() as usize != tile {
            ranges[tile].0 = i as u32;
        }
        if i + 1 == isects.len() || isects[i + 1].tile_id() as usize != tile {
            ranges[tile].1 = i as u32 + 1;
        }
    }

    TileBins { ranges }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isect(tile: u32, depth: f32, id: u32) -> Intersect {
        Intersect::new(tile, depth, id)
    }

    #[test]
    fn test_ranges_partition_sorted_list() {
        // Tiles 0 and 2 populated, tile 1 empty.
        let isects = vec![
            isect(0, 1.0, 0),
            isect(0, 2.0, 1),
            isect(2, 0.5, 2),
            isect(2, 0.6, 3),
            isect(2, 0.7, 4),
        ];
        let bins = tile_bin_edges(&isects, 4);

        assert_eq!(bins.range(0), 0..2);
        assert_eq!(bins.range(1), 0..0);
        assert_eq!(bins.range(2), 2..5);
        assert_eq!(bins.range(3), 0..0);

        let covered: usize = bins.ranges.iter().map(|&(s, e)| (e - s) as usize).sum();
        assert_eq!(covered, isects.len());
    }

    #[test]
    fn test_empty_list_yields_empty_bins() {
        let bins = tile_bin_edges(&[], 3);
        assert_eq!(bins.ranges, vec![(0, 0); 3]);
    }
}
