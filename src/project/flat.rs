//! Projection of flat (zero-thickness) splats.
//!
//! A flat splat is the unit Gaussian disk on a 3D plane. Instead of an EWA
//! covariance it projects exactly: the 3×3 homogeneous transform `T` maps
//! splat-plane coordinates (u, v, 1) to homogeneous pixel coordinates, and
//! the rasterizer intersects each pixel ray with the plane through `T`
//! directly. The screen bounding box comes from the dual conic of the unit
//! disk pushed through `T`.

use nalgebra::{Matrix3, Vector2, Vector3, Vector4};
use rayon::prelude::*;

use crate::core::{quat_to_rotmat, quat_to_rotmat_vjp, Camera, SplatCloud};
use crate::grid::TileGrid;

/// Screen-space outputs of the flat projector, one slot per splat.
#[derive(Clone, Debug, Default)]
pub struct FlatProjectedSplats {
    /// Screen-space bounding-box centers, pixel coordinates.
    pub xys: Vec<Vector2<f32>>,
    /// Camera-space depths of the splat centers.
    pub depths: Vec<f32>,
    /// Splat-plane (u, v, 1) to homogeneous pixel coordinates.
    pub transforms: Vec<Matrix3<f32>>,
    /// View-space unit normals, sign flipped toward the camera.
    pub normals: Vec<Vector3<f32>>,
    pub radii: Vec<u32>,
    pub num_tiles_hit: Vec<u32>,
}

impl FlatProjectedSplats {
    fn zeros(n: usize) -> Self {
        Self {
            xys: vec![Vector2::zeros(); n],
            depths: vec![0.0; n],
            transforms: vec![Matrix3::zeros(); n],
            normals: vec![Vector3::zeros(); n],
            radii: vec![0; n],
            num_tiles_hit: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }
}

/// Bounding box of the unit disk through `T`, from its dual conic.
/// Returns `(center, half-extents squared)`, or `None` when the plane is
/// degenerate under this view.
fn dual_conic_bbox(t: &Matrix3<f32>) -> Option<(Vector2<f32>, Vector2<f32>)> {
    let t0 = t.row(0).transpose();
    let t1 = t.row(1).transpose();
    let tw = t.row(2).transpose();
    let disk = Vector3::new(1.0, 1.0, -1.0);

    let d = disk.dot(&tw.component_mul(&tw));
    if d == 0.0 {
        return None;
    }
    let f = disk / d;
    let center = Vector2::new(
        f.dot(&t0.component_mul(&tw)),
        f.dot(&t1.component_mul(&tw)),
    );
    let half_sq = Vector2::new(
        center.x * center.x - f.dot(&t0.component_mul(&t0)),
        center.y * center.y - f.dot(&t1.component_mul(&t1)),
    );
    if half_sq.x <= 0.0 || half_sq.y <= 0.0 {
        return None;
    }
    Some((center, half_sq))
}

struct FlatProjection {
    xy: Vector2<f32>,
    depth: f32,
    transform: Matrix3<f32>,
    normal: Vector3<f32>,
    radius: u32,
    num_tiles_hit: u32,
}

fn project_flat_one(
    cloud: &SplatCloud,
    camera: &Camera,
    grid: &TileGrid,
    glob_scale: f32,
    clip_thresh: f32,
    idx: usize,
) -> Option<FlatProjection> {
    let p_view = camera.world_to_camera(&cloud.means[idx]);
    if p_view.z <= clip_thresh {
        return None;
    }

    let rot = quat_to_rotmat(&cloud.quats[idx]);
    let w = camera.rotation;
    let sx = cloud.scales[idx].x * glob_scale;
    let sy = cloud.scales[idx].y * glob_scale;

    let m = Matrix3::from_columns(&[
        w * (rot.column(0) * sx),
        w * (rot.column(1) * sy),
        p_view,
    ]);
    let transform = camera.intrinsics_affine() * m;

    let (center, half_sq) = dual_conic_bbox(&transform)?;
    let radius = (3.0 * half_sq.x.max(half_sq.y).sqrt()).ceil();

    let bbox = grid.tile_bbox(center, radius);
    let num_tiles_hit = bbox.area();
    if num_tiles_hit == 0 {
        return None;
    }

    // Plane normal in view space, kept facing the camera.
    let mut normal = w * rot.column(2);
    if normal.dot(&p_view) > 0.0 {
        normal = -normal;
    }

    Some(FlatProjection {
        xy: center,
        depth: p_view.z,
        transform,
        normal,
        radius: radius as u32,
        num_tiles_hit,
    })
}

/// Project every flat splat. Same culling contract as the EWA projector.
pub fn project_splats_flat(
    cloud: &SplatCloud,
    camera: &Camera,
    grid: &TileGrid,
    glob_scale: f32,
    clip_thresh: f32,
) -> FlatProjectedSplats {
    let n = cloud.len();
    let mut out = FlatProjectedSplats::zeros(n);

    let projections: Vec<Option<FlatProjection>> = (0..n)
        .into_par_iter()
        .map(|idx| project_flat_one(cloud, camera, grid, glob_scale, clip_thresh, idx))
        .collect();

    for (idx, proj) in projections.into_iter().enumerate() {
        if let Some(p) = proj {
            out.xys[idx] = p.xy;
            out.depths[idx] = p.depth;
            out.transforms[idx] = p.transform;
            out.normals[idx] = p.normal;
            out.radii[idx] = p.radius;
            out.num_tiles_hit[idx] = p.num_tiles_hit;
        }
    }

    out
}

/// Gradients with respect to the flat splat parameters.
#[derive(Clone, Debug)]
pub struct FlatProjectionGradients {
    pub v_means: Vec<Vector3<f32>>,
    pub v_scales: Vec<Vector3<f32>>,
    pub v_quats: Vec<Vector4<f32>>,
}

struct FlatSplatGrads {
    v_mean: Vector3<f32>,
    v_scale: Vector3<f32>,
    v_quat: Vector4<f32>,
}

fn flat_backward_one(
    cloud: &SplatCloud,
    camera: &Camera,
    glob_scale: f32,
    idx: usize,
    v_transform: &Matrix3<f32>,
    v_normal: &Vector3<f32>,
    v_xy: &Vector2<f32>,
) -> FlatSplatGrads {
    let p_view = camera.world_to_camera(&cloud.means[idx]);
    let rot = quat_to_rotmat(&cloud.quats[idx]);
    let w = camera.rotation;
    let sx = cloud.scales[idx].x * glob_scale;
    let sy = cloud.scales[idx].y * glob_scale;

    // T = K·M; M columns are W·(s.x·R₀), W·(s.y·R₁), p_view.
    let v_m: Matrix3<f32> = camera.intrinsics_affine().transpose() * v_transform;

    let wc0 = w * rot.column(0);
    let wc1 = w * rot.column(1);
    let v_scale = Vector3::new(
        wc0.dot(&v_m.column(0)) * glob_scale,
        wc1.dot(&v_m.column(1)) * glob_scale,
        0.0,
    );

    let mut v_rot = Matrix3::zeros();
    v_rot.set_column(0, &(w.transpose() * v_m.column(0) * sx));
    v_rot.set_column(1, &(w.transpose() * v_m.column(1) * sy));

    // The normal's camera-facing flip is a fixed sign chosen in the forward
    // pass.
    let raw_normal = w * rot.column(2);
    let sign = if raw_normal.dot(&p_view) > 0.0 { -1.0 } else { 1.0 };
    v_rot.set_column(2, &(w.transpose() * v_normal * sign));

    let v_quat = quat_to_rotmat_vjp(&cloud.quats[idx], &v_rot);

    // Mean: through M's third column, plus the bbox-center gradient mapped
    // through the pinhole projection of the center.
    let j = camera.projection_jacobian(&p_view);
    let v_p_view = v_m.column(2).into_owned() + j.transpose() * v_xy;
    let v_mean = w.transpose() * v_p_view;

    FlatSplatGrads {
        v_mean,
        v_scale,
        v_quat,
    }
}

/// Push transform/normal/center gradients back to flat splat parameters.
#[allow(clippy::too_many_arguments)]
pub fn project_splats_flat_vjp(
    cloud: &SplatCloud,
    camera: &Camera,
    proj: &FlatProjectedSplats,
    glob_scale: f32,
    v_transforms: &[Matrix3<f32>],
    v_normals: &[Vector3<f32>],
    v_xy: &[Vector2<f32>],
) -> FlatProjectionGradients {
    let n = cloud.len();
    let mut out = FlatProjectionGradients {
        v_means: vec![Vector3::zeros(); n],
        v_scales: vec![Vector3::zeros(); n],
        v_quats: vec![Vector4::zeros(); n],
    };

    let grads: Vec<Option<FlatSplatGrads>> = (0..n)
        .into_par_iter()
        .map(|idx| {
            if proj.radii[idx] == 0 {
                return None;
            }
            Some(flat_backward_one(
                cloud,
                camera,
                glob_scale,
                idx,
                &v_transforms[idx],
                &v_normals[idx],
                &v_xy[idx],
            ))
        })
        .collect();

    for (idx, g) in grads.into_iter().enumerate() {
        if let Some(g) = g {
            out.v_means[idx] = g.v_mean;
            out.v_scales[idx] = g.v_scale;
            out.v_quats[idx] = g.v_quat;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Camera {
        Camera::new(
            100.0,
            100.0,
            32.0,
            32.0,
            64,
            64,
            Matrix3::identity(),
            Vector3::zeros(),
        )
    }

    fn face_on_cloud() -> SplatCloud {
        let mut cloud = SplatCloud::new(3);
        // Disk in the xy plane facing the camera.
        cloud.push(
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(0.2, 0.2, 1.0),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            0.9,
            &[1.0, 1.0, 1.0],
        );
        cloud
    }

    #[test]
    fn test_face_on_disk_centers_at_principal_point() {
        let camera = test_camera();
        let grid = TileGrid::new(64, 64, 16);
        let cloud = face_on_cloud();
        let proj = project_splats_flat(&cloud, &camera, &grid, 1.0, 0.01);

        assert!(proj.radii[0] > 0);
        assert_relative_eq!(proj.xys[0].x, 32.0, epsilon = 1e-3);
        assert_relative_eq!(proj.xys[0].y, 32.0, epsilon = 1e-3);
        assert_relative_eq!(proj.depths[0], 2.0, epsilon = 1e-6);

        // Face-on at z=2 with fx=100: the 1-sigma disk spans
        // scale * fx / z = 10 pixels, so the 3-sigma radius is 30 up to
        // rounding in the dual-conic arithmetic.
        assert!(
            (29..=31).contains(&proj.radii[0]),
            "radius {} outside 3-sigma band",
            proj.radii[0]
        );
    }

    #[test]
    fn test_normal_faces_camera() {
        let camera = test_camera();
        let grid = TileGrid::new(64, 64, 16);
        let cloud = face_on_cloud();
        let proj = project_splats_flat(&cloud, &camera, &grid, 1.0, 0.01);

        // Camera at origin looking down +z: a camera-facing normal has
        // negative dot with the view ray.
        assert!(proj.normals[0].dot(&Vector3::new(0.0, 0.0, 2.0)) < 0.0);
        assert_relative_eq!(proj.normals[0].norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_degenerate_plane_has_no_bbox() {
        // w-row with |offset| equal to the basis part: the dual conic
        // denominator vanishes and the plane projects to a line.
        let t = Matrix3::new(
            10.0, 0.0, 32.0, //
            0.0, 10.0, 32.0, //
            1.0, 0.0, 1.0,
        );
        assert!(dual_conic_bbox(&t).is_none());
    }

    #[test]
    fn test_behind_camera_is_culled() {
        let camera = test_camera();
        let grid = TileGrid::new(64, 64, 16);
        let mut cloud = SplatCloud::new(3);
        cloud.push(
            Vector3::new(0.0, 0.0, -2.0),
            Vector3::new(0.2, 0.2, 1.0),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            0.9,
            &[1.0, 1.0, 1.0],
        );
        let proj = project_splats_flat(&cloud, &camera, &grid, 1.0, 0.01);
        assert_eq!(proj.radii[0], 0);
    }
}
