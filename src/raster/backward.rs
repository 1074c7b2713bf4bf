//! Adjoint of the forward compositing kernel.
//!
//! Gradients are exact: each pixel replays the splats it composited, in
//! reverse, reconstructing the forward transmittance from the saved final
//! value instead of re-running the forward pass. Per-splat sums are built in
//! thread-local buffers and folded together, so no worker ever writes a slot
//! another worker reads.

use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;

use crate::grid::TileGrid;

use super::forward::{conic_sigma, ALPHA_CLAMP, ALPHA_SKIP};
use super::ranges::TileBins;
use super::Intersect;

/// Per-splat gradients out of the compositing stage.
#[derive(Clone, Debug)]
pub struct RasterGradients {
    pub v_xy: Vec<Vector2<f32>>,
    /// Sum of |∂L/∂xy| contributions; a densification signal, not a true
    /// gradient.
    pub v_xy_abs: Vec<Vector2<f32>>,
    /// Conic gradients, packed (xx, xy, yy).
    pub v_conic: Vec<Vector3<f32>>,
    /// `N x channels` row-major.
    pub v_colors: Vec<f32>,
    pub v_opacity: Vec<f32>,
}

impl RasterGradients {
    pub fn zeros(n: usize, channels: usize) -> Self {
        Self {
            v_xy: vec![Vector2::zeros(); n],
            v_xy_abs: vec![Vector2::zeros(); n],
            v_conic: vec![Vector3::zeros(); n],
            v_colors: vec![0.0; n * channels],
            v_opacity: vec![0.0; n],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.v_xy.iter_mut().zip(other.v_xy) {
            *a += b;
        }
        for (a, b) in self.v_xy_abs.iter_mut().zip(other.v_xy_abs) {
            *a += b;
        }
        for (a, b) in self.v_conic.iter_mut().zip(other.v_conic) {
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

pub struct BackwardInputs<'a> {
    pub isects: &'a [Intersect],
    pub bins: &'a TileBins,
    pub grid: &'a TileGrid,
    pub xys: &'a [Vector2<f32>],
    pub conics: &'a [Vector3<f32>],
    pub colors: &'a [f32],
    pub opacities: &'a [f32],
    pub channels: usize,
    pub width: u32,
    pub height: u32,
    pub background: &'a [f32],
    pub final_ts: &'a [f32],
    pub final_index: &'a [u32],
}

#[allow(clippy::too_many_arguments)]
fn backward_tile(
    grads: &mut RasterGradients,
    inp: &BackwardInputs,
    tile_id: u32,
    v_image: &[f32],
    v_render_alpha: Option<&[f32]>,
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

    for py in 0..inp.grid.tile_size {
        let y = y0 + py;
        if y >= inp.height {
            break;
        }
        for px in 0..inp.grid.tile_size {
            let x = x0 + px;
            if x >= inp.width {
                break;
            }
            let pix = (y as usize) * (inp.width as usize) + x as usize;
            let bin_final = inp.final_index[pix] as usize;
            if bin_final <= range.start {
                continue;
            }
            let center = Vector2::new(x as f32 + 0.5, y as f32 + 0.5);
            let t_final = inp.final_ts[pix];
            let mut t_after = t_final;
            suffix.fill(0.0);
            let v_out = &v_image[pix * channels..(pix + 1) * channels];
            let v_out_alpha = v_render_alpha.map_or(0.0, |v| v[pix]);

            for idx in (range.start..bin_final).rev() {
                let id = inp.isects[idx].splat_id as usize;
                let delta = inp.xys[id] - center;
                let sigma = conic_sigma(&inp.conics[id], &delta);
                if sigma < 0.0 {
                    continue;
                }
                let vis = (-sigma).exp();
                let alpha = (inp.opacities[id] * vis).min(ALPHA_CLAMP);
                if alpha < ALPHA_SKIP {
                    continue;
                }

                let ra = 1.0 / (1.0 - alpha);
                t_after *= ra;
                let t = t_after;
                let fac = alpha * t;

                let mut v_alpha = 0.0f32;
                let color = &inp.colors[id * channels..(id + 1) * channels];
                for c in 0..channels {
                    v_alpha += (color[c] * t - suffix[c] * ra) * v_out[c];
                    // Background shows through the final transmittance only.
                    v_alpha -= t_final * ra * inp.background[c] * v_out[c];
                    suffix[c] += color[c] * fac;
                    grads.v_colors[id * channels + c] += fac * v_out[c];
                }
                v_alpha += t_final * ra * v_out_alpha;

                let v_sigma = -inp.opacities[id] * vis * v_alpha;
                let conic = inp.conics[id];
                grads.v_conic[id] += Vector3::new(
                    0.5 * v_sigma * delta.x * delta.x,
                    v_sigma * delta.x * delta.y,
                    0.5 * v_sigma * delta.y * delta.y,
                );
                let v_xy = Vector2::new(
                    v_sigma * (conic.x * delta.x + conic.y * delta.y),
                    v_sigma * (conic.y * delta.x + conic.z * delta.y),
                );
                grads.v_xy[id] += v_xy;
                grads.v_xy_abs[id] += v_xy.abs();
                grads.v_opacity[id] += vis * v_alpha;
            }
        }
    }
}

/// Differentiate the rendered image (and optionally the alpha channel,
/// `1 − final_T`) back to per-splat screen-space quantities.
pub fn rasterize_backward(
    inp: &BackwardInputs,
    n_splats: usize,
    v_image: &[f32],
    v_render_alpha: Option<&[f32]>,
) -> RasterGradients {
    (0..inp.grid.num_tiles() as u32)
        .into_par_iter()
        .fold(
            || RasterGradients::zeros(n_splats, inp.channels),
            |mut grads, tile_id| {
                backward_tile(&mut grads, inp, tile_id, v_image, v_render_alpha);
                grads
            },
        )
        .reduce(
            || RasterGradients::zeros(n_splats, inp.channels),
            RasterGradients::merge,
        )
}
