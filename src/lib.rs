//! # tilesplat: tile-based differentiable Gaussian splat rasterization
//!
//! This crate rasterizes a scene of 3D anisotropic Gaussian "splats" into an
//! image and computes exact gradients of a loss with respect to every splat
//! parameter (mean, scale, rotation, opacity, color), for use inside an
//! iterative scene-optimization loop.
//!
//! ## Pipeline
//!
//! 1. `project`: each splat is projected to a 2D screen-space Gaussian
//!    (mean, conic, depth, pixel radius) and assigned a tile-overlap count.
//! 2. `raster::binning`: splats are expanded into one (tile, depth)-keyed
//!    intersection record per overlapping tile, placed by a prefix sum.
//! 3. `raster::sort`: records are sorted by a packed 64-bit key so each
//!    tile's splats form a depth-ordered contiguous run.
//! 4. `raster::ranges`: one scan over the sorted keys yields per-tile bins.
//! 5. `raster::forward`: per tile, splats are composited front-to-back into
//!    every pixel with early termination on saturated transmittance.
//! 6. `raster::backward` + `project::backward`: the exact adjoint, replaying
//!    each tile back-to-front and mapping per-pixel gradients all the way
//!    back to 3D splat parameters.
//!
//! A second "flat" splat variant (degenerate 2D Gaussians rasterized via
//! ray-plane intersection) shares the binning/sorting/range machinery and
//! additionally renders depth/normal/distortion auxiliary channels.
//!
//! The crate is a pure in-memory kernel library: it consumes flat numeric
//! buffers plus a camera and produces flat numeric buffers back. Sorting is
//! pluggable through the [`raster::sort::IntersectSorter`] trait.

pub mod core;
pub mod error;
pub mod grid;
pub mod project;
pub mod raster;
pub mod render;

pub use crate::core::{Camera, SplatCloud};
pub use crate::error::RenderError;
pub use crate::grid::TileGrid;
pub use crate::raster::{DepthSorter, IntersectSorter};
pub use crate::render::{
    render_forward, render_forward_flat, FlatForwardPass, ForwardPass, RenderConfig,
    SplatGradients,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
