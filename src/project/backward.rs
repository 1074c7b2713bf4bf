//! Adjoint of the splat projector.
//!
//! Consumes the screen-space gradients produced by the compositing adjoint
//! (2D mean, conic, effective-opacity compensation, optionally depth) and
//! pushes them back to world-space means, scales and quaternions. Pure math,
//! one worker per splat; culled splats keep zero gradients.

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3, Vector4};
use rayon::prelude::*;

use crate::core::{quat_to_rotmat, quat_to_rotmat_vjp, Camera, SplatCloud};

use super::{clamp_to_fov, unpack_cov3d, ProjectedSplats, COV_BLUR, FOV_CLAMP_MARGIN};

/// Gradients with respect to the splat parameters.
#[derive(Clone, Debug)]
pub struct ProjectionGradients {
    pub v_means: Vec<Vector3<f32>>,
    pub v_scales: Vec<Vector3<f32>>,
    pub v_quats: Vec<Vector4<f32>>,
}

/// Gradient of the packed blurred 2D covariance given the packed conic
/// gradient. For `K = Σ⁻¹`, `v_Σ = −K G K` with the packed cross term split
/// across the two symmetric slots.
fn conic_vjp(cov2d: &Vector3<f32>, v_conic: &Vector3<f32>) -> Vector3<f32> {
    let det = cov2d.x * cov2d.z - cov2d.y * cov2d.y;
    if det == 0.0 {
        return Vector3::zeros();
    }
    let inv_det = 1.0 / det;
    let conic = Matrix2::new(
        cov2d.z * inv_det,
        -cov2d.y * inv_det,
        -cov2d.y * inv_det,
        cov2d.x * inv_det,
    );
    let g = Matrix2::new(v_conic.x, 0.5 * v_conic.y, 0.5 * v_conic.y, v_conic.z);
    let m = -conic * g * conic;
    Vector3::new(m[(0, 0)], 2.0 * m[(0, 1)], m[(1, 1)])
}

/// Gradient of the packed blurred 2D covariance given the compensation
/// gradient. `comp² = det(Σ − blur·I) / det(Σ)`.
fn compensation_vjp(cov2d: &Vector3<f32>, comp: f32, v_comp: f32) -> Vector3<f32> {
    if comp <= 0.0 || v_comp == 0.0 {
        return Vector3::zeros();
    }
    let (a, b, c) = (cov2d.x, cov2d.y, cov2d.z);
    let det_blur = a * c - b * b;
    let det_orig = (a - COV_BLUR) * (c - COV_BLUR) - b * b;
    if det_blur == 0.0 {
        return Vector3::zeros();
    }
    let v_ratio = v_comp / (2.0 * comp);
    let v_det_orig = v_ratio / det_blur;
    let v_det_blur = -v_ratio * det_orig / (det_blur * det_blur);
    Vector3::new(
        v_det_orig * (c - COV_BLUR) + v_det_blur * c,
        v_det_orig * (-2.0 * b) + v_det_blur * (-2.0 * b),
        v_det_orig * (a - COV_BLUR) + v_det_blur * a,
    )
}

struct SplatGrads {
    v_mean: Vector3<f32>,
    v_scale: Vector3<f32>,
    v_quat: Vector4<f32>,
}

#[allow(clippy::too_many_arguments)]
fn backward_one(
    cloud: &SplatCloud,
    camera: &Camera,
    proj: &ProjectedSplats,
    glob_scale: f32,
    idx: usize,
    v_xy: &Vector2<f32>,
    v_depth: f32,
    v_conic: &Vector3<f32>,
    v_comp: f32,
) -> SplatGrads {
    let p_view = camera.world_to_camera(&cloud.means[idx]);
    let t = clamp_to_fov(&p_view, camera);
    let rz = 1.0 / t.z;
    let rz2 = rz * rz;
    let j = camera.projection_jacobian(&t);
    let w = camera.rotation;
    let tm: Matrix2x3<f32> = j * w;

    // Conic and compensation both land on the blurred 2D covariance; the
    // blur is additive so the same gradient applies to T Σ Tᵀ.
    let v_cov2d =
        conic_vjp(&proj.cov2d[idx], v_conic) + compensation_vjp(&proj.cov2d[idx], proj.compensations[idx], v_comp);
    let g2 = Matrix2::new(v_cov2d.x, 0.5 * v_cov2d.y, 0.5 * v_cov2d.y, v_cov2d.z);

    let cov3d = unpack_cov3d(&proj.cov3d[idx]);
    let v_cov3d: Matrix3<f32> = tm.transpose() * g2 * tm;
    let v_tm: Matrix2x3<f32> = (g2 + g2.transpose()) * tm * cov3d;
    let v_j: Matrix2x3<f32> = v_tm * w.transpose();

    // Perspective Jacobian entries depend on the clamped point only.
    let mut v_t = Vector3::new(
        -camera.fx * rz2 * v_j[(0, 2)],
        -camera.fy * rz2 * v_j[(1, 2)],
        -camera.fx * rz2 * v_j[(0, 0)] - camera.fy * rz2 * v_j[(1, 1)]
            + 2.0 * camera.fx * t.x * rz2 * rz * v_j[(0, 2)]
            + 2.0 * camera.fy * t.y * rz2 * rz * v_j[(1, 2)],
    );

    // A clamped coordinate is s·lim·t.z: its own slot stops flowing and the
    // chain reroutes through depth.
    let lim_x = FOV_CLAMP_MARGIN * camera.tan_fovx();
    let lim_y = FOV_CLAMP_MARGIN * camera.tan_fovy();
    let pz_inv = 1.0 / p_view.z;
    if (p_view.x * pz_inv).abs() > lim_x {
        v_t.z += (p_view.x * pz_inv).signum() * lim_x * v_t.x;
        v_t.x = 0.0;
    }
    if (p_view.y * pz_inv).abs() > lim_y {
        v_t.z += (p_view.y * pz_inv).signum() * lim_y * v_t.y;
        v_t.y = 0.0;
    }

    // 2D mean goes through the unclamped projection.
    let j_mean = camera.projection_jacobian(&p_view);
    let mut v_p_view = v_t + j_mean.transpose() * v_xy;
    v_p_view.z += v_depth;
    let v_mean = w.transpose() * v_p_view;

    // Σ = (R S)(R S)ᵀ back to scale and quaternion.
    let rot = quat_to_rotmat(&cloud.quats[idx]);
    let s = Matrix3::from_diagonal(&(cloud.scales[idx] * glob_scale));
    let m = rot * s;
    let v_m: Matrix3<f32> = 2.0 * v_cov3d * m;
    let mut v_scale = Vector3::zeros();
    for jcol in 0..3 {
        v_scale[jcol] = rot.column(jcol).dot(&v_m.column(jcol)) * glob_scale;
    }
    let v_rot: Matrix3<f32> = v_m * s;
    let v_quat = quat_to_rotmat_vjp(&cloud.quats[idx], &v_rot);

    SplatGrads {
        v_mean,
        v_scale,
        v_quat,
    }
}

/// Push screen-space gradients back to splat parameters.
pub fn project_splats_vjp(
    cloud: &SplatCloud,
    camera: &Camera,
    proj: &ProjectedSplats,
    glob_scale: f32,
    v_xy: &[Vector2<f32>],
    v_depths: Option<&[f32]>,
    v_conic: &[Vector3<f32>],
    v_compensation: &[f32],
) -> ProjectionGradients {
    let n = cloud.len();
    let mut out = ProjectionGradients {
        v_means: vec![Vector3::zeros(); n],
        v_scales: vec![Vector3::zeros(); n],
        v_quats: vec![Vector4::zeros(); n],
    };

    let grads: Vec<Option<SplatGrads>> = (0..n)
        .into_par_iter()
        .map(|idx| {
            if proj.radii[idx] == 0 {
                return None;
            }
            Some(backward_one(
                cloud,
                camera,
                proj,
                glob_scale,
                idx,
                &v_xy[idx],
                v_depths.map_or(0.0, |v| v[idx]),
                &v_conic[idx],
                v_compensation[idx],
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

    #[test]
    fn test_conic_vjp_against_finite_differences() {
        let cov2d = Vector3::new(2.0, 0.3, 1.5);
        let v_conic = Vector3::new(0.7, -0.2, 0.4);
        let analytic = conic_vjp(&cov2d, &v_conic);

        let conic_of = |c: Vector3<f64>| -> Vector3<f64> {
            let det = c.x * c.z - c.y * c.y;
            Vector3::new(c.z / det, -c.y / det, c.x / det)
        };
        let c64 = Vector3::new(cov2d.x as f64, cov2d.y as f64, cov2d.z as f64);
        let seed = Vector3::new(v_conic.x as f64, v_conic.y as f64, v_conic.z as f64);
        let eps = 1e-6;
        for i in 0..3 {
            let mut hi = c64;
            let mut lo = c64;
            hi[i] += eps;
            lo[i] -= eps;
            let num = (conic_of(hi) - conic_of(lo)).dot(&seed) / (2.0 * eps);
            assert_relative_eq!(analytic[i] as f64, num, epsilon = 1e-4, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_compensation_vjp_against_finite_differences() {
        let cov2d = Vector3::new(1.2, 0.1, 0.9);
        let det_blur = cov2d.x * cov2d.z - cov2d.y * cov2d.y;
        let det_orig = (cov2d.x - COV_BLUR) * (cov2d.z - COV_BLUR) - cov2d.y * cov2d.y;
        let comp = (det_orig / det_blur).max(0.0).sqrt();
        let analytic = compensation_vjp(&cov2d, comp, 1.0);

        let comp_of = |c: Vector3<f64>| -> f64 {
            let blur = COV_BLUR as f64;
            let det_b = c.x * c.z - c.y * c.y;
            let det_o = (c.x - blur) * (c.z - blur) - c.y * c.y;
            (det_o / det_b).max(0.0).sqrt()
        };
        let c64 = Vector3::new(cov2d.x as f64, cov2d.y as f64, cov2d.z as f64);
        let eps = 1e-6;
        for i in 0..3 {
            let mut hi = c64;
            let mut lo = c64;
            hi[i] += eps;
            lo[i] -= eps;
            let num = (comp_of(hi) - comp_of(lo)) / (2.0 * eps);
            assert_relative_eq!(analytic[i] as f64, num, epsilon = 1e-4, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_culled_splats_get_zero_gradients() {
        use crate::grid::TileGrid;
        use crate::project::project_splats;
        use nalgebra::Matrix3;

        let camera = Camera::new(
            100.0,
            100.0,
            32.0,
            32.0,
            64,
            64,
            Matrix3::identity(),
            Vector3::zeros(),
        );
        let grid = TileGrid::new(64, 64, 16);
        let mut cloud = SplatCloud::new(3);
        cloud.push(
            Vector3::new(0.0, 0.0, -5.0),
            Vector3::new(0.1, 0.1, 0.1),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            0.8,
            &[1.0, 0.0, 0.0],
        );
        let proj = project_splats(&cloud, &camera, &grid, 1.0, 0.01);

        let grads = project_splats_vjp(
            &cloud,
            &camera,
            &proj,
            1.0,
            &[Vector2::new(1.0, 1.0)],
            None,
            &[Vector3::new(1.0, 1.0, 1.0)],
            &[1.0],
        );
        assert_eq!(grads.v_means[0], Vector3::zeros());
        assert_eq!(grads.v_scales[0], Vector3::zeros());
        assert_eq!(grads.v_quats[0], Vector4::zeros());
    }
}
