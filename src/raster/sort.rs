//! Sorting of tile/depth intersection keys.
//!
//! The pipeline only needs the intersections ordered by their packed key;
//! how that order is produced is behind a trait so alternative backends
//! (a radix sorter, or a device sort when one exists) can slot in without
//! touching the kernels.

use rayon::prelude::*;

use super::Intersect;

/// Orders intersections by ascending key.
///
/// The sort must be stable with respect to equal keys or at least
/// deterministic, so repeated renders of the same scene bin identically.
pub trait IntersectSorter {
    fn sort(&self, intersects: &mut [Intersect]);
}

/// Default comparison sort. Ties on the full key are broken by splat id,
/// which makes the order total and the output deterministic regardless of
/// the underlying sort's stability.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthSorter;

impl IntersectSorter for DepthSorter {
    fn sort(&self, intersects: &mut [Intersect]) {
        intersects.par_sort_unstable_by_key(|isect| (isect.key, isect.splat_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_groups_by_tile_then_depth() {
        let mut isects = vec![
            Intersect::new(2, 0.5, 0),
            Intersect::new(0, 9.0, 1),
            Intersect::new(2, 0.25, 2),
            Intersect::new(0, 1.0, 3),
            Intersect::new(1, 4.0, 4),
        ];
        DepthSorter.sort(&mut isects);

        let ids: Vec<u32> = isects.iter().map(|i| i.splat_id).collect();
        assert_eq!(ids, vec![3, 1, 4, 2, 0]);

        for w in isects.windows(2) {
            assert!(w[0].key <= w[1].key);
        }
    }

    #[test]
    fn test_sort_equal_keys_is_deterministic() {
        let mut a = vec![
            Intersect::new(0, 1.0, 5),
            Intersect::new(0, 1.0, 2),
            Intersect::new(0, 1.0, 9),
        ];
        let mut b = a.clone();
        b.reverse();

        DepthSorter.sort(&mut a);
        DepthSorter.sort(&mut b);
        assert_eq!(a, b);
        assert_eq!(a[0].splat_id, 2);
    }
}
