//! Pipeline entry points.
//!
//! [`render_forward`] wires the stages together (project, bin, sort, range,
//! composite) and retains everything the adjoint needs;
//! [`ForwardPass::backward`] replays it. [`render_forward_flat`] /
//! [`FlatForwardPass::backward`] are the same pair for flat splats.
//!
//! All input validation lives here. The kernels index without checks.

use nalgebra::{Vector2, Vector3, Vector4};

use crate::core::{Camera, SplatCloud};
use crate::error::RenderError;
use crate::grid::TileGrid;
use crate::project::backward::project_splats_vjp;
use crate::project::flat::{project_splats_flat, project_splats_flat_vjp, FlatProjectedSplats};
use crate::project::{project_splats, ProjectedSplats};
use crate::raster::backward::{rasterize_backward, BackwardInputs};
use crate::raster::flat::{
    rasterize_flat_backward, rasterize_flat_forward, FlatForwardOutputs, FlatInputs, AUX_CHANNELS,
};
use crate::raster::forward::{rasterize_forward, ForwardOutputs};
use crate::raster::{map_splats_to_intersects, tile_bin_edges, Intersect, IntersectSorter, TileBins};

/// Rendering knobs shared by both splat variants.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// Side length of a square tile, 2..=16 pixels.
    pub tile_size: u32,
    /// Global multiplier on all splat scales.
    pub glob_scale: f32,
    /// Near-plane depth; splats at or behind it are culled. Must be
    /// positive, which also keeps the depth sort keys ordered.
    pub clip_thresh: f32,
    /// Background color, one value per channel.
    pub background: Vec<f32>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tile_size: 16,
            glob_scale: 1.0,
            clip_thresh: 0.01,
            background: vec![0.0; 3],
        }
    }
}

impl RenderConfig {
    fn validate(&self, channels: usize) -> Result<(), RenderError> {
        if !(2..=16).contains(&self.tile_size) {
            return Err(RenderError::TileSize(self.tile_size));
        }
        if !(self.clip_thresh > 0.0) {
            return Err(RenderError::ClipThreshold(self.clip_thresh));
        }
        if self.background.len() != channels {
            return Err(RenderError::BufferLength {
                name: "background",
                expected: channels,
                got: self.background.len(),
            });
        }
        Ok(())
    }
}

fn validate_common(
    cloud: &SplatCloud,
    camera: &Camera,
    config: &RenderConfig,
) -> Result<(), RenderError> {
    cloud.validate()?;
    config.validate(cloud.channels)?;
    if camera.width == 0 || camera.height == 0 {
        return Err(RenderError::ImageSize {
            width: camera.width,
            height: camera.height,
        });
    }
    Ok(())
}

/// Gradients of the loss with respect to every splat parameter.
#[derive(Clone, Debug)]
pub struct SplatGradients {
    pub v_means: Vec<Vector3<f32>>,
    pub v_scales: Vec<Vector3<f32>>,
    pub v_quats: Vec<Vector4<f32>>,
    pub v_opacities: Vec<f32>,
    /// `N x channels` row-major.
    pub v_colors: Vec<f32>,
    /// Screen-space mean gradients.
    pub v_xy: Vec<Vector2<f32>>,
    /// Accumulated |screen-space mean gradient|; the densification signal.
    pub v_xy_abs: Vec<Vector2<f32>>,
}

/// A completed forward render plus the retained state its adjoint replays.
pub struct ForwardPass<'a> {
    cloud: &'a SplatCloud,
    camera: Camera,
    config: RenderConfig,
    grid: TileGrid,
    proj: ProjectedSplats,
    isects: Vec<Intersect>,
    bins: TileBins,
    /// Opacity times blur compensation, the value the kernels composite.
    eff_opacities: Vec<f32>,
    outputs: ForwardOutputs,
}

impl<'a> ForwardPass<'a> {
    /// Rendered image, row-major `height x width x channels`.
    pub fn image(&self) -> &[f32] {
        &self.outputs.image
    }

    /// Per-pixel transmittance left after compositing.
    pub fn final_ts(&self) -> &[f32] {
        &self.outputs.final_ts
    }

    /// Projection results, e.g. for visibility or densification bookkeeping.
    pub fn projected(&self) -> &ProjectedSplats {
        &self.proj
    }

    /// Pull the image gradient (and optionally the gradient of the alpha
    /// channel `1 − final_T`) back to splat parameters.
    pub fn backward(
        &self,
        v_image: &[f32],
        v_render_alpha: Option<&[f32]>,
    ) -> Result<SplatGradients, RenderError> {
        let channels = self.cloud.channels;
        let num_pixels = self.camera.num_pixels();
        if v_image.len() != num_pixels * channels {
            return Err(RenderError::GradientLength {
                expected: num_pixels * channels,
                got: v_image.len(),
            });
        }
        if let Some(v) = v_render_alpha {
            if v.len() != num_pixels {
                return Err(RenderError::GradientLength {
                    expected: num_pixels,
                    got: v.len(),
                });
            }
        }

        let inputs = BackwardInputs {
            isects: &self.isects,
            bins: &self.bins,
            grid: &self.grid,
            xys: &self.proj.xys,
            conics: &self.proj.conics,
            colors: &self.cloud.colors,
            opacities: &self.eff_opacities,
            channels,
            width: self.camera.width,
            height: self.camera.height,
            background: &self.config.background,
            final_ts: &self.outputs.final_ts,
            final_index: &self.outputs.final_index,
        };
        let raster = rasterize_backward(&inputs, self.cloud.len(), v_image, v_render_alpha);

        // The kernels saw opacity·compensation; split that product back into
        // its factors before the projector adjoint.
        let n = self.cloud.len();
        let mut v_opacities = vec![0.0f32; n];
        let mut v_compensation = vec![0.0f32; n];
        for i in 0..n {
            v_opacities[i] = self.proj.compensations[i] * raster.v_opacity[i];
            v_compensation[i] = self.cloud.opacities[i] * raster.v_opacity[i];
        }

        let proj_grads = project_splats_vjp(
            self.cloud,
            &self.camera,
            &self.proj,
            self.config.glob_scale,
            &raster.v_xy,
            None,
            &raster.v_conic,
            &v_compensation,
        );

        Ok(SplatGradients {
            v_means: proj_grads.v_means,
            v_scales: proj_grads.v_scales,
            v_quats: proj_grads.v_quats,
            v_opacities,
            v_colors: raster.v_colors,
            v_xy: raster.v_xy,
            v_xy_abs: raster.v_xy_abs,
        })
    }
}

/// Render a splat cloud. Three-channel clouds composite in `f32`; any other
/// channel count uses the reduced-precision wide path.
pub fn render_forward<'a>(
    cloud: &'a SplatCloud,
    camera: &Camera,
    config: &RenderConfig,
    sorter: &dyn IntersectSorter,
) -> Result<ForwardPass<'a>, RenderError> {
    validate_common(cloud, camera, config)?;
    let grid = TileGrid::new(camera.width, camera.height, config.tile_size);

    let proj = project_splats(cloud, camera, &grid, config.glob_scale, config.clip_thresh);
    let eff_opacities: Vec<f32> = cloud
        .opacities
        .iter()
        .zip(&proj.compensations)
        .map(|(o, c)| o * c)
        .collect();

    let mut isects =
        map_splats_to_intersects(&proj.xys, &proj.depths, &proj.radii, &proj.num_tiles_hit, &grid);
    sorter.sort(&mut isects);
    let bins = tile_bin_edges(&isects, grid.num_tiles());
    log::debug!(
        "forward: {} splats, {} intersections, {} tiles",
        cloud.len(),
        isects.len(),
        grid.num_tiles()
    );

    let channels = cloud.channels;
    let outputs = if channels == 3 {
        rasterize_forward::<f32>(
            &isects,
            &bins,
            &grid,
            &proj.xys,
            &proj.conics,
            &cloud.colors,
            &eff_opacities,
            channels,
            camera.width,
            camera.height,
            &config.background,
        )
    } else {
        rasterize_forward::<half::f16>(
            &isects,
            &bins,
            &grid,
            &proj.xys,
            &proj.conics,
            &cloud.colors,
            &eff_opacities,
            channels,
            camera.width,
            camera.height,
            &config.background,
        )
    };

    Ok(ForwardPass {
        cloud,
        camera: camera.clone(),
        config: config.clone(),
        grid,
        proj,
        isects,
        bins,
        eff_opacities,
        outputs,
    })
}

/// A completed flat-splat render plus its retained adjoint state.
pub struct FlatForwardPass<'a> {
    cloud: &'a SplatCloud,
    camera: Camera,
    config: RenderConfig,
    grid: TileGrid,
    proj: FlatProjectedSplats,
    isects: Vec<Intersect>,
    bins: TileBins,
    outputs: FlatForwardOutputs,
}

impl<'a> FlatForwardPass<'a> {
    pub fn image(&self) -> &[f32] {
        &self.outputs.image
    }

    /// Auxiliary channels, row-major `height x width x AUX_CHANNELS`.
    pub fn aux(&self) -> &[f32] {
        &self.outputs.aux
    }

    pub fn final_ts(&self) -> &[f32] {
        &self.outputs.final_ts
    }

    pub fn projected(&self) -> &FlatProjectedSplats {
        &self.proj
    }

    /// Pull image and aux-channel gradients back to splat parameters. The
    /// median-depth channel is a hard selection and its slot in `v_aux` is
    /// ignored.
    pub fn backward(&self, v_image: &[f32], v_aux: &[f32]) -> Result<SplatGradients, RenderError> {
        let channels = self.cloud.channels;
        let num_pixels = self.camera.num_pixels();
        if v_image.len() != num_pixels * channels {
            return Err(RenderError::GradientLength {
                expected: num_pixels * channels,
                got: v_image.len(),
            });
        }
        if v_aux.len() != num_pixels * AUX_CHANNELS {
            return Err(RenderError::GradientLength {
                expected: num_pixels * AUX_CHANNELS,
                got: v_aux.len(),
            });
        }

        let inputs = FlatInputs {
            isects: &self.isects,
            bins: &self.bins,
            grid: &self.grid,
            xys: &self.proj.xys,
            transforms: &self.proj.transforms,
            normals: &self.proj.normals,
            colors: &self.cloud.colors,
            opacities: &self.cloud.opacities,
            channels,
            width: self.camera.width,
            height: self.camera.height,
            background: &self.config.background,
        };
        let raster =
            rasterize_flat_backward(&inputs, self.cloud.len(), &self.outputs, v_image, v_aux);

        let proj_grads = project_splats_flat_vjp(
            self.cloud,
            &self.camera,
            &self.proj,
            self.config.glob_scale,
            &raster.v_transforms,
            &raster.v_normals,
            &raster.v_xy,
        );

        Ok(SplatGradients {
            v_means: proj_grads.v_means,
            v_scales: proj_grads.v_scales,
            v_quats: proj_grads.v_quats,
            v_opacities: raster.v_opacity,
            v_colors: raster.v_colors,
            v_xy: raster.v_xy,
            v_xy_abs: raster.v_xy_abs,
        })
    }
}

/// Render a cloud of flat splats with auxiliary depth/normal/distortion
/// channels.
pub fn render_forward_flat<'a>(
    cloud: &'a SplatCloud,
    camera: &Camera,
    config: &RenderConfig,
    sorter: &dyn IntersectSorter,
) -> Result<FlatForwardPass<'a>, RenderError> {
    validate_common(cloud, camera, config)?;
    let grid = TileGrid::new(camera.width, camera.height, config.tile_size);

    let proj = project_splats_flat(cloud, camera, &grid, config.glob_scale, config.clip_thresh);
    let mut isects =
        map_splats_to_intersects(&proj.xys, &proj.depths, &proj.radii, &proj.num_tiles_hit, &grid);
    sorter.sort(&mut isects);
    let bins = tile_bin_edges(&isects, grid.num_tiles());
    log::debug!(
        "flat forward: {} splats, {} intersections, {} tiles",
        cloud.len(),
        isects.len(),
        grid.num_tiles()
    );

    let inputs = FlatInputs {
        isects: &isects,
        bins: &bins,
        grid: &grid,
        xys: &proj.xys,
        transforms: &proj.transforms,
        normals: &proj.normals,
        colors: &cloud.colors,
        opacities: &cloud.opacities,
        channels: cloud.channels,
        width: camera.width,
        height: camera.height,
        background: &config.background,
    };
    let outputs = if cloud.channels == 3 {
        rasterize_flat_forward::<f32>(&inputs)
    } else {
        rasterize_flat_forward::<half::f16>(&inputs)
    };

    Ok(FlatForwardPass {
        cloud,
        camera: camera.clone(),
        config: config.clone(),
        grid,
        proj,
        isects,
        bins,
        outputs,
    })
}
