//! Splat container: struct-of-arrays, indexed by splat id.
//!
//! All per-splat attributes live in index-parallel flat arrays. There is no
//! per-splat heap allocation anywhere in the pipeline; the splat id is the
//! array index and every derived buffer (projection outputs, gradients) is
//! parallel to these.

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// A collection of 3D Gaussian splats in SoA layout.
///
/// Covariance is stored factorized as scale + rotation:
/// Σ = (R·S)(R·S)ᵀ with S = diag(scale · glob_scale).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SplatCloud {
    /// Positions (mean μ)
    pub means: Vec<Vector3<f32>>,

    /// Per-axis scales (linear space, positive)
    pub scales: Vec<Vector3<f32>>,

    /// Unit quaternions in (w, x, y, z) order
    pub quats: Vec<Vector4<f32>>,

    /// Opacities in [0, 1]
    pub opacities: Vec<f32>,

    /// Colors, flat `len() * channels` row-major
    pub colors: Vec<f32>,

    /// Color channel count (3 for RGB, arbitrary for feature rendering)
    pub channels: usize,
}

impl SplatCloud {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }

    /// Number of splats in the cloud.
    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Append one splat. Test and setup convenience; bulk callers fill the
    /// arrays directly.
    pub fn push(
        &mut self,
        mean: Vector3<f32>,
        scale: Vector3<f32>,
        quat: Vector4<f32>,
        opacity: f32,
        color: &[f32],
    ) {
        debug_assert_eq!(color.len(), self.channels);
        self.means.push(mean);
        self.scales.push(scale);
        self.quats.push(quat);
        self.opacities.push(opacity);
        self.colors.extend_from_slice(color);
    }

    /// Color slice for one splat.
    pub fn color(&self, idx: usize) -> &[f32] {
        &self.colors[idx * self.channels..(idx + 1) * self.channels]
    }

    /// Check that every attribute array is parallel to `means`.
    ///
    /// This is the boundary-layer contract check: the kernels index all
    /// arrays with the same splat id and never re-validate.
    pub fn validate(&self) -> Result<(), RenderError> {
        let n = self.means.len();
        if self.channels == 0 {
            return Err(RenderError::ChannelCount(self.channels));
        }
        for (name, got) in [
            ("scales", self.scales.len()),
            ("quats", self.quats.len()),
            ("opacities", self.opacities.len()),
        ] {
            if got != n {
                return Err(RenderError::BufferLength {
                    name,
                    expected: n,
                    got,
                });
            }
        }
        if self.colors.len() != n * self.channels {
            return Err(RenderError::BufferLength {
                name: "colors",
                expected: n * self.channels,
                got: self.colors.len(),
            });
        }
        Ok(())
    }
}
