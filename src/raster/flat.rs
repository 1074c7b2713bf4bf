//! Compositing kernels for flat splats.
//!
//! The forward kernel intersects each pixel ray with the splat plane through
//! the homogeneous transform, takes the Gaussian falloff at the intersection
//! (or a screen-space low-pass falloff when that is tighter) and composites
//! front to back like the EWA path. Alongside the color image it fills an
//! auxiliary buffer: accumulated alpha, expected depth, median depth, a
//! depth-distortion term and the accumulated normal.
//!
//! The backward kernel is the exact adjoint of everything except the median
//! depth, which is a hard selection and deliberately not differentiated.

use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::grid::TileGrid;

use super::accum::{AccumBuffer, AccumScalar};
use super::forward::{ALPHA_CLAMP, ALPHA_SKIP, T_EPS};
use super::ranges::TileBins;
use super::Intersect;

/// Auxiliary channel layout.
pub const AUX_ALPHA: usize = 0;
pub const AUX_DEPTH: usize = 1;
pub const AUX_MEDIAN: usize = 2;
pub const AUX_DISTORTION: usize = 3;
pub const AUX_NORMAL: usize = 4;
pub const AUX_CHANNELS: usize = 7;

/// Screen-space low-pass: falloff of the 2D fallback ellipse.
pub const FILTER_INV_SQUARE: f32 = 2.0;

/// Rendered image, aux channels and the state the backward pass replays.
#[derive(Clone, Debug)]
pub struct FlatForwardOutputs {
    /// Row-major `height x width x channels`.
    pub image: Vec<f32>,
    /// Row-major `height x width x AUX_CHANNELS`.
    pub aux: Vec<f32>,
    pub final_ts: Vec<f32>,
    pub final_index: Vec<u32>,
    /// Per-pixel distortion running sums (Σw·m, Σw·m²) at termination.
    pub dist_sums: Vec<[f32; 2]>,
}

/// One pixel-ray / splat-plane evaluation, shared verbatim by the forward
/// and backward kernels.
struct PlaneHit {
    h_u: Vector3<f32>,
    h_v: Vector3<f32>,
    p: Vector3<f32>,
    s: Vector2<f32>,
    /// Gaussian exponent argument, already the min of plane and screen
    /// falloff.
    rho: f32,
    /// Plane falloff won the min.
    plane_branch: bool,
    /// View-space depth at the evaluation point.
    m: f32,
}

fn hit_plane(
    transform: &Matrix3<f32>,
    xy: &Vector2<f32>,
    px: f32,
    py: f32,
) -> Option<PlaneHit> {
    let t_u = transform.row(0).transpose();
    let t_v = transform.row(1).transpose();
    let t_w = transform.row(2).transpose();

    let h_u = t_w * px - t_u;
    let h_v = t_w * py - t_v;
    let p = h_u.cross(&h_v);
    if p.z == 0.0 {
        return None;
    }
    let s = Vector2::new(p.x / p.z, p.y / p.z);
    let rho3d = s.x * s.x + s.y * s.y;

    let dx = px - xy.x;
    let dy = py - xy.y;
    let rho2d = FILTER_INV_SQUARE * (dx * dx + dy * dy);

    let plane_branch = rho3d <= rho2d;
    let m = if plane_branch {
        s.x * t_w.x + s.y * t_w.y + t_w.z
    } else {
        t_w.z
    };
    if m <= 0.0 {
        return None;
    }

    Some(PlaneHit {
        h_u,
        h_v,
        p,
        s,
        rho: rho3d.min(rho2d),
        plane_branch,
        m,
    })
}

pub struct FlatInputs<'a> {
    pub isects: &'a [Intersect],
    pub bins: &'a TileBins,
    pub grid: &'a TileGrid,
    pub xys: &'a [Vector2<f32>],
    pub transforms: &'a [Matrix3<f32>],
    pub normals: &'a [Vector3<f32>],
    pub colors: &'a [f32],
    pub opacities: &'a [f32],
    pub channels: usize,
    pub width: u32,
    pub height: u32,
    pub background: &'a [f32],
}

struct FlatTileRender {
    tile_id: u32,
    image: Vec<f32>,
    aux: Vec<f32>,
    final_ts: Vec<f32>,
    final_index: Vec<u32>,
    dist_sums: Vec<[f32; 2]>,
}

fn render_flat_tile<S: AccumScalar>(inp: &FlatInputs, tile_id: u32) -> FlatTileRender {
    let ts = inp.grid.tile_size as usize;
    let pixels = ts * ts;
    let channels = inp.channels;
    let range = inp.bins.range(tile_id);
    let (tx, ty) = inp.grid.tile_coords(tile_id);
    let x0 = tx * inp.grid.tile_size;
    let y0 = ty * inp.grid.tile_size;

    let mut accum = AccumBuffer::<S>::new(pixels, channels);
    let mut aux = vec![0.0f32; pixels * AUX_CHANNELS];
    let mut t_cur = vec![1.0f32; pixels];
    let mut last_idx = vec![range.start as u32; pixels];
    let mut dist_sums = vec![[0.0f32; 2]; pixels];

    for pix in 0..pixels {
        let x = x0 + (pix % ts) as u32;
        let y = y0 + (pix / ts) as u32;
        if x >= inp.width || y >= inp.height {
            continue;
        }
        let px = x as f32 + 0.5;
        let py = y as f32 + 0.5;

        let mut t = 1.0f32;
        let mut d1 = 0.0f32;
        let mut d2 = 0.0f32;
        let abase = pix * AUX_CHANNELS;

        for idx in range.clone() {
            let id = inp.isects[idx].splat_id as usize;
            let hit = match hit_plane(&inp.transforms[id], &inp.xys[id], px, py) {
                Some(h) => h,
                None => continue,
            };
            let alpha = (inp.opacities[id] * (-0.5 * hit.rho).exp()).min(ALPHA_CLAMP);
            if alpha < ALPHA_SKIP {
                continue;
            }
            let next_t = t * (1.0 - alpha);
            if next_t <= T_EPS {
                break;
            }
            let w = alpha * t;

            let cbase = id * channels;
            accum.accumulate(pix, &inp.colors[cbase..cbase + channels], w);

            // Incremental pairwise depth distortion against everything
            // already composited.
            let a_prev = 1.0 - t;
            aux[abase + AUX_DISTORTION] += w * (hit.m * hit.m * a_prev + d2 - 2.0 * hit.m * d1);
            aux[abase + AUX_DEPTH] += w * hit.m;
            d1 += w * hit.m;
            d2 += w * hit.m * hit.m;

            let n = inp.normals[id];
            aux[abase + AUX_NORMAL] += w * n.x;
            aux[abase + AUX_NORMAL + 1] += w * n.y;
            aux[abase + AUX_NORMAL + 2] += w * n.z;

            if t > 0.5 && next_t <= 0.5 {
                aux[abase + AUX_MEDIAN] = hit.m;
            }

            t = next_t;
            last_idx[pix] = idx as u32 + 1;
        }

        aux[abase + AUX_ALPHA] = 1.0 - t;
        t_cur[pix] = t;
        dist_sums[pix] = [d1, d2];
    }

    let mut image = vec![0.0f32; pixels * channels];
    for pix in 0..pixels {
        accum.resolve(
            pix,
            t_cur[pix],
            inp.background,
            &mut image[pix * channels..(pix + 1) * channels],
        );
    }

    FlatTileRender {
        tile_id,
        image,
        aux,
        final_ts: t_cur,
        final_index: last_idx,
        dist_sums,
    }
}

/// Composite flat splats front to back, one tile per worker.
pub fn rasterize_flat_forward<S: AccumScalar>(inp: &FlatInputs) -> FlatForwardOutputs {
    let num_pixels = (inp.width as usize) * (inp.height as usize);
    let channels = inp.channels;
    let mut out = FlatForwardOutputs {
        image: vec![0.0; num_pixels * channels],
        aux: vec![0.0; num_pixels * AUX_CHANNELS],
        final_ts: vec![1.0; num_pixels],
        final_index: vec![0; num_pixels],
        dist_sums: vec![[0.0; 2]; num_pixels],
    };

    let tiles: Vec<FlatTileRender> = (0..inp.grid.num_tiles() as u32)
        .into_par_iter()
        .map(|tile_id| render_flat_tile::<S>(inp, tile_id))
        .collect();

    let ts = inp.grid.tile_size as usize;
    for tile in tiles {
        let (tx, ty) = inp.grid.tile_coords(tile.tile_id);
        let x0 = (tx * inp.grid.tile_size) as usize;
        let y0 = (ty * inp.grid.tile_size) as usize;
        for py in 0..ts {
            let y = y0 + py;
            if y >= inp.height as usize {
                break;
            }
            for px in 0..ts {
                let x = x0 + px;
                if x >= inp.width as usize {
                    break;
                }
                let src = py * ts + px;
                let dst = y * inp.width as usize + x;
                out.image[dst * channels..(dst + 1) * channels]
                    .copy_from_slice(&tile.image[src * channels..(src + 1) * channels]);
                out.aux[dst * AUX_CHANNELS..(dst + 1) * AUX_CHANNELS]
                    .copy_from_slice(&tile.aux[src * AUX_CHANNELS..(src + 1) * AUX_CHANNELS]);
                out.final_ts[dst] = tile.final_ts[src];
                out.final_index[dst] = tile.final_index[src];
                out.dist_sums[dst] = tile.dist_sums[src];
            }
        }
    }

    out
}

/// Per-splat gradients out of the flat compositing stage.
#[derive(Clone, Debug)]
pub struct FlatRasterGradients {
    pub v_transforms: Vec<Matrix3<f32>>,
    pub v_normals: Vec<Vector3<f32>>,
    /// Bounding-box-center gradients (screen-space fallback branch only).
    pub v_xy: Vec<Vector2<f32>>,
    pub v_xy_abs: Vec<Vector2<f32>>,
    pub v_colors: Vec<f32>,
    pub v_opacity: Vec<f32>,
}

impl FlatRasterGradients {
    pub fn zeros(n: usize, channels: usize) -> Self {
        Self {
            v_transforms: vec![Matrix3::zeros(); n],
            v_normals: vec![Vector3::zeros(); n],
            v_xy: vec![Vector2::zeros(); n],
            v_xy_abs: vec![Vector2::zeros(); n],
            v_colors: vec![0.0; n * channels],
            v_opacity: vec![0.0; n],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.v_transforms.iter_mut().zip(other.v_transforms) {
            *a += b;
        }
        for (a, b) in self.v_normals.iter_mut().zip(other.v_normals) {
            *a += b;
        }
        for (a, b) in self.v_xy.iter_mut().zip(other.v_xy) {
            *a += b;
        }
        for (a, b) in self.v_xy_abs.iter_mut().zip(other.v_xy_abs) {
            *a += b;
        }
        for (a, b) in self.v_colors.iter_mut().zip(other.v_colors) {
            *a += b;
        }
        for (a, b) in self.v_opacity.iter_mut().zip(other.v_opacity) {
            *a += b;
        }
        self
    }
}

#[allow(clippy::too_many_arguments)]
fn backward_flat_tile(
    grads: &mut FlatRasterGradients,
    inp: &FlatInputs,
    tile_id: u32,
    final_ts: &[f32],
    final_index: &[u32],
    dist_sums: &[[f32; 2]],
    v_image: &[f32],
    v_aux: &[f32],
) {
    let channels = inp.channels;
    let range = inp.bins.range(tile_id);
    if range.is_empty() {
        return;
    }
    let (tx, ty) = inp.grid.tile_coords(tile_id);
    let x0 = tx * inp.grid.tile_size;
    let y0 = ty * inp.grid.tile_size;
    let mut suffix = vec![0.0f32; channels];

    for py_t in 0..inp.grid.tile_size {
        let y = y0 + py_t;
        if y >= inp.height {
            break;
        }
        for px_t in 0..inp.grid.tile_size {
            let x = x0 + px_t;
            if x >= inp.width {
                break;
            }
            let pix = (y as usize) * (inp.width as usize) + x as usize;
            let bin_final = final_index[pix] as usize;
            if bin_final <= range.start {
                continue;
            }
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;

            let t_final = final_ts[pix];
            let a_final = 1.0 - t_final;
            let [d1_final, d2_final] = dist_sums[pix];
            let mut t_after = t_final;
            suffix.fill(0.0);
            let mut suffix_m = 0.0f32;
            let mut suffix_zeta = 0.0f32;
            let mut suffix_n = Vector3::zeros();

            let v_out = &v_image[pix * channels..(pix + 1) * channels];
            let va = &v_aux[pix * AUX_CHANNELS..(pix + 1) * AUX_CHANNELS];
            let v_out_alpha = va[AUX_ALPHA];
            let v_out_depth = va[AUX_DEPTH];
            let v_out_dist = va[AUX_DISTORTION];
            let v_out_normal =
                Vector3::new(va[AUX_NORMAL], va[AUX_NORMAL + 1], va[AUX_NORMAL + 2]);

            for idx in (range.start..bin_final).rev() {
                let id = inp.isects[idx].splat_id as usize;
                let hit = match hit_plane(&inp.transforms[id], &inp.xys[id], px, py) {
                    Some(h) => h,
                    None => continue,
                };
                let vis = (-0.5 * hit.rho).exp();
                let alpha = (inp.opacities[id] * vis).min(ALPHA_CLAMP);
                if alpha < ALPHA_SKIP {
                    continue;
                }

                let ra = 1.0 / (1.0 - alpha);
                t_after *= ra;
                let t = t_after;
                let fac = alpha * t;
                let m = hit.m;
                // Each splat's pairwise distortion weight against the full
                // composited set.
                let zeta = m * m * a_final - 2.0 * m * d1_final + d2_final;
                let n = inp.normals[id];

                let mut v_alpha = 0.0f32;
                let color = &inp.colors[id * channels..(id + 1) * channels];
                for c in 0..channels {
                    v_alpha += (color[c] * t - suffix[c] * ra) * v_out[c];
                    v_alpha -= t_final * ra * inp.background[c] * v_out[c];
                    suffix[c] += color[c] * fac;
                    grads.v_colors[id * channels + c] += fac * v_out[c];
                }
                v_alpha += t_final * ra * v_out_alpha;
                v_alpha += (m * t - suffix_m * ra) * v_out_depth;
                v_alpha += (zeta * t - suffix_zeta * ra) * v_out_dist;
                v_alpha += (n * t - suffix_n * ra).dot(&v_out_normal);
                suffix_m += m * fac;
                suffix_zeta += zeta * fac;
                suffix_n += n * fac;

                grads.v_normals[id] += fac * v_out_normal;

                let mut v_m = fac * v_out_depth;
                v_m += v_out_dist * 2.0 * fac * (m * a_final - d1_final);

                // alpha = opacity * exp(-rho/2)
                grads.v_opacity[id] += vis * v_alpha;
                let v_power = inp.opacities[id] * vis * v_alpha;
                let v_rho = -0.5 * v_power;

                if hit.plane_branch {
                    let t_w = inp.transforms[id].row(2).transpose();
                    let v_s = Vector2::new(
                        2.0 * hit.s.x * v_rho + t_w.x * v_m,
                        2.0 * hit.s.y * v_rho + t_w.y * v_m,
                    );
                    let v_p = Vector3::new(
                        v_s.x / hit.p.z,
                        v_s.y / hit.p.z,
                        -(v_s.x * hit.p.x + v_s.y * hit.p.y) / (hit.p.z * hit.p.z),
                    );
                    let v_hu = hit.h_v.cross(&v_p);
                    let v_hv = v_p.cross(&hit.h_u);

                    // h_u = px·T_w − T_u, h_v = py·T_w − T_v,
                    // m = s·(T_w.x, T_w.y) + T_w.z
                    let v_tu = -v_hu;
                    let v_tv = -v_hv;
                    let v_tw =
                        px * v_hu + py * v_hv + Vector3::new(hit.s.x * v_m, hit.s.y * v_m, v_m);
                    let vt = &mut grads.v_transforms[id];
                    for k in 0..3 {
                        vt[(0, k)] += v_tu[k];
                        vt[(1, k)] += v_tv[k];
                        vt[(2, k)] += v_tw[k];
                    }
                } else {
                    let dx = px - inp.xys[id].x;
                    let dy = py - inp.xys[id].y;
                    let v_c = Vector2::new(
                        -2.0 * FILTER_INV_SQUARE * dx * v_rho,
                        -2.0 * FILTER_INV_SQUARE * dy * v_rho,
                    );
                    grads.v_xy[id] += v_c;
                    grads.v_xy_abs[id] += v_c.abs();
                    grads.v_transforms[id][(2, 2)] += v_m;
                }
            }
        }
    }
}

/// Differentiate the flat render (color image plus aux channels, median
/// excluded) back to per-splat transforms, normals, centers, colors and
/// opacities.
pub fn rasterize_flat_backward(
    inp: &FlatInputs,
    n_splats: usize,
    fwd: &FlatForwardOutputs,
    v_image: &[f32],
    v_aux: &[f32],
) -> FlatRasterGradients {
    (0..inp.grid.num_tiles() as u32)
        .into_par_iter()
        .fold(
            || FlatRasterGradients::zeros(n_splats, inp.channels),
            |mut grads, tile_id| {
                backward_flat_tile(
                    &mut grads,
                    inp,
                    tile_id,
                    &fwd.final_ts,
                    &fwd.final_index,
                    &fwd.dist_sums,
                    v_image,
                    v_aux,
                );
                grads
            },
        )
        .reduce(
            || FlatRasterGradients::zeros(n_splats, inp.channels),
            FlatRasterGradients::merge,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::ranges::tile_bin_edges;
    use approx::assert_relative_eq;

    /// Face-on unit-depth plane covering the tile: T maps (u, v) to pixels
    /// at 10 px per unit around the center, plane at depth 2.
    fn face_on_transform() -> Matrix3<f32> {
        Matrix3::new(
            10.0, 0.0, 4.0, //
            0.0, 10.0, 4.0, //
            0.0, 0.0, 1.0,
        )
    }

    fn face_on_inputs<'a>(
        isects: &'a [Intersect],
        bins: &'a TileBins,
        grid: &'a TileGrid,
        xys: &'a [Vector2<f32>],
        transforms: &'a [Matrix3<f32>],
        normals: &'a [Vector3<f32>],
        colors: &'a [f32],
        opacities: &'a [f32],
        background: &'a [f32],
    ) -> FlatInputs<'a> {
        FlatInputs {
            isects,
            bins,
            grid,
            xys,
            transforms,
            normals,
            colors,
            opacities,
            channels: 3,
            width: 8,
            height: 8,
            background,
        }
    }

    #[test]
    fn test_face_on_plane_matches_planar_gaussian() {
        let grid = TileGrid::new(8, 8, 8);
        let isects = vec![Intersect::new(0, 1.0, 0)];
        let bins = tile_bin_edges(&isects, 1);
        let xys = vec![Vector2::new(4.0, 4.0)];
        let transforms = vec![face_on_transform()];
        let normals = vec![Vector3::new(0.0, 0.0, -1.0)];
        let colors = vec![1.0, 0.5, 0.25];
        let opacities = vec![0.8];
        let background = [0.0f32; 3];

        let inp = face_on_inputs(
            &isects,
            &bins,
            &grid,
            &xys,
            &transforms,
            &normals,
            &colors,
            &opacities,
            &background,
        );
        let out = rasterize_flat_forward::<f32>(&inp);

        // At pixel (x, y) the plane coordinates are ((x+0.5-4)/10, ...):
        // a planar Gaussian with 10-pixel sigma around (4, 4), except where
        // the screen low-pass is tighter.
        for y in 0..8u32 {
            for x in 0..8u32 {
                let u = (x as f32 + 0.5 - 4.0) / 10.0;
                let v = (y as f32 + 0.5 - 4.0) / 10.0;
                let rho3d = u * u + v * v;
                let dx = x as f32 + 0.5 - 4.0;
                let dy = y as f32 + 0.5 - 4.0;
                let rho2d = FILTER_INV_SQUARE * (dx * dx + dy * dy);
                let alpha = 0.8 * (-0.5 * rho3d.min(rho2d)).exp();
                let pix = (y * 8 + x) as usize;
                assert_relative_eq!(out.image[pix * 3], alpha, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_aux_alpha_complements_final_transmittance() {
        let grid = TileGrid::new(8, 8, 8);
        let isects = vec![Intersect::new(0, 1.0, 0), Intersect::new(0, 2.0, 1)];
        let bins = tile_bin_edges(&isects, 1);
        let xys = vec![Vector2::new(4.0, 4.0); 2];
        let transforms = vec![
            face_on_transform(),
            Matrix3::new(10.0, 0.0, 4.0, 0.0, 10.0, 4.0, 0.0, 0.0, 2.0),
        ];
        let normals = vec![Vector3::new(0.0, 0.0, -1.0); 2];
        let colors = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let opacities = vec![0.6, 0.7];
        let background = [0.0f32; 3];

        let inp = face_on_inputs(
            &isects,
            &bins,
            &grid,
            &xys,
            &transforms,
            &normals,
            &colors,
            &opacities,
            &background,
        );
        let out = rasterize_flat_forward::<f32>(&inp);

        for pix in 0..64 {
            assert_relative_eq!(
                out.aux[pix * AUX_CHANNELS + AUX_ALPHA],
                1.0 - out.final_ts[pix],
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn test_expected_depth_is_weight_times_depth() {
        let grid = TileGrid::new(8, 8, 8);
        let isects = vec![Intersect::new(0, 2.0, 0)];
        let bins = tile_bin_edges(&isects, 1);
        let xys = vec![Vector2::new(4.0, 4.0)];
        // Depth-2 plane.
        let transforms = vec![Matrix3::new(
            10.0, 0.0, 4.0, //
            0.0, 10.0, 4.0, //
            0.0, 0.0, 2.0,
        )];
        let normals = vec![Vector3::new(0.0, 0.0, -1.0)];
        let colors = vec![1.0, 1.0, 1.0];
        let opacities = vec![0.5];
        let background = [0.0f32; 3];

        let inp = face_on_inputs(
            &isects,
            &bins,
            &grid,
            &xys,
            &transforms,
            &normals,
            &colors,
            &opacities,
            &background,
        );
        let out = rasterize_flat_forward::<f32>(&inp);

        for pix in 0..64 {
            let w = out.aux[pix * AUX_CHANNELS + AUX_ALPHA];
            assert_relative_eq!(
                out.aux[pix * AUX_CHANNELS + AUX_DEPTH],
                2.0 * w,
                epsilon = 1e-4
            );
            // One splat: no pairwise spread, zero distortion.
            assert_relative_eq!(
                out.aux[pix * AUX_CHANNELS + AUX_DISTORTION],
                0.0,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_backward_opacity_gradient_from_first_principles() {
        let grid = TileGrid::new(8, 8, 8);
        let isects = vec![Intersect::new(0, 1.0, 0)];
        let bins = tile_bin_edges(&isects, 1);
        let xys = vec![Vector2::new(4.0, 4.0)];
        let transforms = vec![face_on_transform()];
        let normals = vec![Vector3::new(0.0, 0.0, -1.0)];
        let colors = vec![1.0, 0.0, 0.0];
        let opacities = vec![0.5];
        let background = [0.0f32; 3];

        let inp = face_on_inputs(
            &isects,
            &bins,
            &grid,
            &xys,
            &transforms,
            &normals,
            &colors,
            &opacities,
            &background,
        );
        let fwd = rasterize_flat_forward::<f32>(&inp);

        // Seed the red channel of the center pixel only.
        let pix = 4 * 8 + 4;
        let mut v_image = vec![0.0f32; 64 * 3];
        v_image[pix * 3] = 1.0;
        let v_aux = vec![0.0f32; 64 * AUX_CHANNELS];
        let grads = rasterize_flat_backward(&inp, 1, &fwd, &v_image, &v_aux);

        // Single splat, red = alpha = opacity * vis: d red / d opacity = vis.
        let u = 0.5f32 / 10.0;
        let rho3d = 2.0 * u * u;
        let rho2d = FILTER_INV_SQUARE * 2.0 * 0.25;
        let vis = (-0.5f32 * rho3d.min(rho2d)).exp();
        assert_relative_eq!(grads.v_opacity[0], vis, epsilon = 1e-4);
    }
}
