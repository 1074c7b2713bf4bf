//! Projection of 3D splats into screen space.
//!
//! The forward pass maps each splat independently to a 2D Gaussian:
//! mean, conic (inverse 2D covariance), camera-space depth, pixel radius and
//! tile-overlap count, via the EWA splatting approximation (Jacobian of the
//! perspective projection evaluated at a clamped camera-space position).
//!
//! A splat is culled (every output slot zeroed) when it fails the
//! near-plane test, its blurred 2D covariance is singular, or its bounding
//! box misses the tile grid entirely. Culling never aborts the batch.

pub mod backward;
pub mod flat;

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::core::{quat_to_rotmat, Camera, SplatCloud};
use crate::grid::TileGrid;

/// Isotropic blur added to both diagonal 2D covariance terms.
pub const COV_BLUR: f32 = 0.3;

/// Multiplier on tan(half-fov) bounding the EWA Jacobian evaluation point.
pub const FOV_CLAMP_MARGIN: f32 = 1.3;

/// Screen-space projection outputs, one slot per input splat.
///
/// Culled splats keep zeroed slots (`radii == 0`, `num_tiles_hit == 0`).
/// The buffers are retained across the forward pass and reused verbatim by
/// the backward pass so the adjoint replays exactly what the forward saw.
#[derive(Clone, Debug, Default)]
pub struct ProjectedSplats {
    /// 3D covariance, packed symmetric (xx, xy, xz, yy, yz, zz).
    pub cov3d: Vec<[f32; 6]>,
    /// Blurred 2D covariance, packed symmetric (xx, xy, yy).
    pub cov2d: Vec<Vector3<f32>>,
    /// Projected 2D means in pixel coordinates.
    pub xys: Vec<Vector2<f32>>,
    /// Camera-space depths.
    pub depths: Vec<f32>,
    /// Conservative pixel radii (3-sigma).
    pub radii: Vec<u32>,
    /// Conics (inverse 2D covariance), packed symmetric (xx, xy, yy).
    pub conics: Vec<Vector3<f32>>,
    /// Opacity attenuation compensating the covariance blur.
    pub compensations: Vec<f32>,
    /// Number of tiles each splat's bounding box overlaps.
    pub num_tiles_hit: Vec<u32>,
}

impl ProjectedSplats {
    fn zeros(n: usize) -> Self {
        Self {
            cov3d: vec![[0.0; 6]; n],
            cov2d: vec![Vector3::zeros(); n],
            xys: vec![Vector2::zeros(); n],
            depths: vec![0.0; n],
            radii: vec![0; n],
            conics: vec![Vector3::zeros(); n],
            compensations: vec![0.0; n],
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

/// One splat's projection, or `None` when culled.
struct Projection {
    cov3d: [f32; 6],
    cov2d: Vector3<f32>,
    xy: Vector2<f32>,
    depth: f32,
    radius: u32,
    conic: Vector3<f32>,
    compensation: f32,
    num_tiles_hit: u32,
}

/// Σ = (R·S)(R·S)ᵀ, packed upper-triangular.
pub(crate) fn scale_rot_to_cov3d(
    scale: &Vector3<f32>,
    glob_scale: f32,
    rot: &Matrix3<f32>,
) -> [f32; 6] {
    let s = Matrix3::from_diagonal(&(scale * glob_scale));
    let m = rot * s;
    let sigma = m * m.transpose();
    [
        sigma[(0, 0)],
        sigma[(0, 1)],
        sigma[(0, 2)],
        sigma[(1, 1)],
        sigma[(1, 2)],
        sigma[(2, 2)],
    ]
}

pub(crate) fn unpack_cov3d(c: &[f32; 6]) -> Matrix3<f32> {
    Matrix3::new(c[0], c[1], c[2], c[1], c[3], c[4], c[2], c[4], c[5])
}

/// Clamp the camera-space evaluation point so |x/z| stays within the fov
/// margin, preventing divergent Jacobians for off-screen points. Returns the
/// clamped point; clamping only touches x/y.
pub(crate) fn clamp_to_fov(p_view: &Vector3<f32>, camera: &Camera) -> Vector3<f32> {
    let lim_x = FOV_CLAMP_MARGIN * camera.tan_fovx();
    let lim_y = FOV_CLAMP_MARGIN * camera.tan_fovy();
    let rz = 1.0 / p_view.z;
    Vector3::new(
        (p_view.x * rz).clamp(-lim_x, lim_x) * p_view.z,
        (p_view.y * rz).clamp(-lim_y, lim_y) * p_view.z,
        p_view.z,
    )
}

/// EWA projection of a 3D covariance through T = J·W.
pub(crate) fn project_cov2d_ewa(
    p_view: &Vector3<f32>,
    cov3d: &[f32; 6],
    camera: &Camera,
) -> Matrix2<f32> {
    let t = clamp_to_fov(p_view, camera);
    let j: Matrix2x3<f32> = camera.projection_jacobian(&t);
    let tm = j * camera.rotation;
    tm * unpack_cov3d(cov3d) * tm.transpose()
}

fn project_one(
    cloud: &SplatCloud,
    camera: &Camera,
    grid: &TileGrid,
    glob_scale: f32,
    clip_thresh: f32,
    idx: usize,
) -> Option<Projection> {
    let p_view = camera.world_to_camera(&cloud.means[idx]);
    if p_view.z <= clip_thresh {
        return None;
    }

    let rot = quat_to_rotmat(&cloud.quats[idx]);
    let cov3d = scale_rot_to_cov3d(&cloud.scales[idx], glob_scale, &rot);

    let sigma2d = project_cov2d_ewa(&p_view, &cov3d, camera);
    let c00 = sigma2d[(0, 0)];
    let c01 = sigma2d[(0, 1)];
    let c11 = sigma2d[(1, 1)];

    let det_orig = c00 * c11 - c01 * c01;
    let b00 = c00 + COV_BLUR;
    let b11 = c11 + COV_BLUR;
    let det = b00 * b11 - c01 * c01;
    if det == 0.0 {
        return None;
    }
    let compensation = (det_orig / det).max(0.0).sqrt();

    let inv_det = 1.0 / det;
    let conic = Vector3::new(b11 * inv_det, -c01 * inv_det, b00 * inv_det);

    // 3-sigma radius from the larger eigenvalue; the discriminant is floored
    // to keep the sqrt real for near-degenerate covariances.
    let b = 0.5 * (b00 + b11);
    let disc = (b * b - det).max(0.1).sqrt();
    let lambda_max = (b + disc).max(b - disc);
    let radius = (3.0 * lambda_max.sqrt()).ceil();

    let xy = camera.project(&p_view);
    let bbox = grid.tile_bbox(xy, radius);
    let num_tiles_hit = bbox.area();
    if num_tiles_hit == 0 {
        return None;
    }

    Some(Projection {
        cov3d,
        cov2d: Vector3::new(b00, c01, b11),
        xy,
        depth: p_view.z,
        radius: radius as u32,
        conic,
        compensation,
        num_tiles_hit,
    })
}

/// Project every splat in the cloud. One worker per splat; each writes only
/// its own output slots.
pub fn project_splats(
    cloud: &SplatCloud,
    camera: &Camera,
    grid: &TileGrid,
    glob_scale: f32,
    clip_thresh: f32,
) -> ProjectedSplats {
    let n = cloud.len();
    let mut out = ProjectedSplats::zeros(n);

    let projections: Vec<Option<Projection>> = (0..n)
        .into_par_iter()
        .map(|idx| project_one(cloud, camera, grid, glob_scale, clip_thresh, idx))
        .collect();

    let mut culled = 0usize;
    for (idx, proj) in projections.into_iter().enumerate() {
        match proj {
            Some(p) => {
                out.cov3d[idx] = p.cov3d;
                out.cov2d[idx] = p.cov2d;
                out.xys[idx] = p.xy;
                out.depths[idx] = p.depth;
                out.radii[idx] = p.radius;
                out.conics[idx] = p.conic;
                out.compensations[idx] = p.compensation;
                out.num_tiles_hit[idx] = p.num_tiles_hit;
            }
            None => culled += 1,
        }
    }
    if culled > 0 {
        log::debug!("projected {} splats, {} culled", n - culled, culled);
    }

    out
}
