//! Pinhole camera model (intrinsics + world-to-camera extrinsics).

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A pinhole camera with intrinsic and extrinsic parameters.
///
/// The extrinsics map world coordinates into camera coordinates
/// (`p_cam = R * p_world + t`), with the camera looking down +z.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in X (pixels)
    pub fx: f32,

    /// Focal length in Y (pixels)
    pub fy: f32,

    /// Principal point X (pixels)
    pub cx: f32,

    /// Principal point Y (pixels)
    pub cy: f32,

    /// Image width (pixels)
    pub width: u32,

    /// Image height (pixels)
    pub height: u32,

    /// Rotation from world to camera coordinates
    pub rotation: Matrix3<f32>,

    /// Translation from world to camera coordinates
    pub translation: Vector3<f32>,
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f32,
        fy: f32,
        cx: f32,
        cy: f32,
        width: u32,
        height: u32,
        rotation: Matrix3<f32>,
        translation: Vector3<f32>,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            rotation,
            translation,
        }
    }

    /// Transform a point from world coordinates to camera coordinates.
    pub fn world_to_camera(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * point_world + self.translation
    }

    /// Project a camera-space point to pixel coordinates.
    ///
    /// [u, v] = [fx * x/z + cx, fy * y/z + cy]
    pub fn project(&self, point_camera: &Vector3<f32>) -> Vector2<f32> {
        let rz = 1.0 / point_camera.z;
        Vector2::new(
            self.fx * point_camera.x * rz + self.cx,
            self.fy * point_camera.y * rz + self.cy,
        )
    }

    /// Tangent of the horizontal half field of view.
    pub fn tan_fovx(&self) -> f32 {
        0.5 * self.width as f32 / self.fx
    }

    /// Tangent of the vertical half field of view.
    pub fn tan_fovy(&self) -> f32 {
        0.5 * self.height as f32 / self.fy
    }

    /// Jacobian of the perspective projection at a camera-space point.
    ///
    /// J = | fx/z    0      -fx*x/z² |
    ///     |  0     fy/z    -fy*y/z² |
    pub fn projection_jacobian(&self, point_camera: &Vector3<f32>) -> Matrix2x3<f32> {
        let z_inv = 1.0 / point_camera.z;
        let z_inv_sq = z_inv * z_inv;
        Matrix2x3::new(
            self.fx * z_inv,
            0.0,
            -self.fx * point_camera.x * z_inv_sq,
            0.0,
            self.fy * z_inv,
            -self.fy * point_camera.y * z_inv_sq,
        )
    }

    /// Upper-triangular affine intrinsics, mapping camera-space points to
    /// homogeneous pixel coordinates (x·w, y·w, w).
    pub fn intrinsics_affine(&self) -> Matrix3<f32> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn num_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
