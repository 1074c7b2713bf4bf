//! Forward compositing kernel.

use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;

use crate::grid::TileGrid;

use super::accum::{AccumBuffer, AccumScalar};
use super::ranges::TileBins;
use super::Intersect;

/// Compositing stops once transmittance drops to this.
pub const T_EPS: f32 = 1e-4;

/// Alpha is clamped here so transmittance never reaches exact zero.
pub const ALPHA_CLAMP: f32 = 0.999;

/// Contributions below 1/255 are invisible at 8-bit output depth.
pub const ALPHA_SKIP: f32 = 1.0 / 255.0;

/// Splats are staged into the tile scratch in groups of this size.
const BATCH_SIZE: usize = 64;

/// Rendered image plus the per-pixel state the backward pass replays from.
#[derive(Clone, Debug)]
pub struct ForwardOutputs {
    /// Row-major `height x width x channels`.
    pub image: Vec<f32>,
    /// Transmittance left after the last composited splat.
    pub final_ts: Vec<f32>,
    /// One past the absolute intersection index of the last contributor;
    /// equals the bin start when nothing contributed.
    pub final_index: Vec<u32>,
}

/// One splat's screen-space footprint staged for a tile batch.
#[derive(Clone, Copy)]
struct Staged {
    xy: Vector2<f32>,
    conic: Vector3<f32>,
    opacity: f32,
    splat_id: usize,
}

/// Gaussian falloff exponent at a pixel. Negative means the pixel sits
/// outside the (numerically valid) ellipse and must be skipped.
#[inline]
pub(crate) fn conic_sigma(conic: &Vector3<f32>, delta: &Vector2<f32>) -> f32 {
    0.5 * (conic.x * delta.x * delta.x + conic.z * delta.y * delta.y)
        + conic.y * delta.x * delta.y
}

struct TileRender {
    tile_id: u32,
    image: Vec<f32>,
    final_ts: Vec<f32>,
    final_index: Vec<u32>,
}

#[allow(clippy::too_many_arguments)]
fn render_tile<S: AccumScalar>(
    tile_id: u32,
    isects: &[Intersect],
    bins: &TileBins,
    grid: &TileGrid,
    xys: &[Vector2<f32>],
    conics: &[Vector3<f32>],
    colors: &[f32],
    opacities: &[f32],
    channels: usize,
    width: u32,
    height: u32,
    background: &[f32],
) -> TileRender {
    let ts = grid.tile_size as usize;
    let pixels = ts * ts;
    let range = bins.range(tile_id);
    let (tx, ty) = grid.tile_coords(tile_id);
    let x0 = tx * grid.tile_size;
    let y0 = ty * grid.tile_size;

    let mut accum = AccumBuffer::<S>::new(pixels, channels);
    let mut t_cur = vec![1.0f32; pixels];
    let mut last_idx = vec![range.start as u32; pixels];
    let mut done = vec![false; pixels];
    // Pixels outside the image never retire a splat and never resolve.
    let mut active = 0usize;
    for py in 0..ts {
        for px in 0..ts {
            let inside = x0 + (px as u32) < width && y0 + (py as u32) < height;
            if inside {
                active += 1;
            } else {
                done[py * ts + px] = true;
            }
        }
    }

    let mut scratch: Vec<Staged> = Vec::with_capacity(BATCH_SIZE);
    let mut batch_start = range.start;
    while batch_start < range.end && active > 0 {
        let batch_end = (batch_start + BATCH_SIZE).min(range.end);
        scratch.clear();
        scratch.extend(isects[batch_start..batch_end].iter().map(|isect| {
            let id = isect.splat_id as usize;
            Staged {
                xy: xys[id],
                conic: conics[id],
                opacity: opacities[id],
                splat_id: id,
            }
        }));

        for pix in 0..pixels {
            if done[pix] {
                continue;
            }
            let px_center = (x0 + (pix % ts) as u32) as f32 + 0.5;
            let py_center = (y0 + (pix / ts) as u32) as f32 + 0.5;

            for (off, splat) in scratch.iter().enumerate() {
                let delta = splat.xy - Vector2::new(px_center, py_center);
                let sigma = conic_sigma(&splat.conic, &delta);
                if sigma < 0.0 {
                    continue;
                }
                let alpha = (splat.opacity * (-sigma).exp()).min(ALPHA_CLAMP);
                if alpha < ALPHA_SKIP {
                    continue;
                }
                let next_t = t_cur[pix] * (1.0 - alpha);
                if next_t <= T_EPS {
                    // Saturated; this splat is not composited.
                    done[pix] = true;
                    active -= 1;
                    break;
                }
                let base = splat.splat_id * channels;
                accum.accumulate(pix, &colors[base..base + channels], alpha * t_cur[pix]);
                t_cur[pix] = next_t;
                last_idx[pix] = (batch_start + off) as u32 + 1;
            }
        }
        batch_start = batch_end;
    }

    let mut image = vec![0.0f32; pixels * channels];
    for pix in 0..pixels {
        accum.resolve(
            pix,
            t_cur[pix],
            background,
            &mut image[pix * channels..(pix + 1) * channels],
        );
    }

    TileRender {
        tile_id,
        image,
        final_ts: t_cur,
        final_index: last_idx,
    }
}

/// Composite the sorted intersections front to back, one tile per worker.
///
/// `colors` is `N x channels` row-major; `opacities` are the effective
/// per-splat opacities (compensation already applied by the caller).
#[allow(clippy::too_many_arguments)]
pub fn rasterize_forward<S: AccumScalar>(
    isects: &[Intersect],
    bins: &TileBins,
    grid: &TileGrid,
    xys: &[Vector2<f32>],
    conics: &[Vector3<f32>],
    colors: &[f32],
    opacities: &[f32],
    channels: usize,
    width: u32,
    height: u32,
    background: &[f32],
) -> ForwardOutputs {
    let num_pixels = (width as usize) * (height as usize);
    let mut out = ForwardOutputs {
        image: vec![0.0; num_pixels * channels],
        final_ts: vec![1.0; num_pixels],
        final_index: vec![0; num_pixels],
    };

    let tiles: Vec<TileRender> = (0..grid.num_tiles() as u32)
        .into_par_iter()
        .map(|tile_id| {
            render_tile::<S>(
                tile_id, isects, bins, grid, xys, conics, colors, opacities, channels, width,
                height, background,
            )
        })
        .collect();

    let ts = grid.tile_size as usize;
    for tile in tiles {
        let (tx, ty) = grid.tile_coords(tile.tile_id);
        let x0 = (tx * grid.tile_size) as usize;
        let y0 = (ty * grid.tile_size) as usize;
        for py in 0..ts {
            let y = y0 + py;
            if y >= height as usize {
                break;
            }
            for px in 0..ts {
                let x = x0 + px;
                if x >= width as usize {
                    break;
                }
                let src = py * ts + px;
                let dst = y * width as usize + x;
                out.image[dst * channels..(dst + 1) * channels]
                    .copy_from_slice(&tile.image[src * channels..(src + 1) * channels]);
                out.final_ts[dst] = tile.final_ts[src];
                out.final_index[dst] = tile.final_index[src];
            }
        }
    }

    out
}
