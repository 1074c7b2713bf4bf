//! Shared math: quaternion <-> rotation matrix and its adjoint.
//!
//! Quaternions are raw 4-vectors in (w, x, y, z) order and are normalized
//! inside the conversion, so the optimizer never has to maintain the unit
//! constraint itself; the vjp includes the normalization chain.

use nalgebra::{Matrix3, Vector4};

/// Convert a raw quaternion (w,x,y,z) to a rotation matrix, normalizing first.
pub fn quat_to_rotmat(q_raw: &Vector4<f32>) -> Matrix3<f32> {
    let n = q_raw.norm();
    let q = q_raw / n;
    let (w, x, y, z) = (q.x, q.y, q.z, q.w);

    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Gradient of [`quat_to_rotmat`] w.r.t. the raw quaternion.
///
/// `v_r` is dL/dR (3×3); returns dL/dq_raw in (w,x,y,z) order.
pub fn quat_to_rotmat_vjp(q_raw: &Vector4<f32>, v_r: &Matrix3<f32>) -> Vector4<f32> {
    let n = q_raw.norm();
    let q = q_raw / n;
    let (w, x, y, z) = (q.x, q.y, q.z, q.w);

    let g00 = v_r[(0, 0)];
    let g01 = v_r[(0, 1)];
    let g02 = v_r[(0, 2)];
    let g10 = v_r[(1, 0)];
    let g11 = v_r[(1, 1)];
    let g12 = v_r[(1, 2)];
    let g20 = v_r[(2, 0)];
    let g21 = v_r[(2, 1)];
    let g22 = v_r[(2, 2)];

    // Differentiate the closed-form matrix entries w.r.t. the unit quaternion.
    let dw = g01 * (-2.0 * z)
        + g02 * (2.0 * y)
        + g10 * (2.0 * z)
        + g12 * (-2.0 * x)
        + g20 * (-2.0 * y)
        + g21 * (2.0 * x);

    let dx = g01 * (2.0 * y)
        + g02 * (2.0 * z)
        + g10 * (2.0 * y)
        + g11 * (-4.0 * x)
        + g12 * (-2.0 * w)
        + g20 * (2.0 * z)
        + g21 * (2.0 * w)
        + g22 * (-4.0 * x);

    let dy = g00 * (-4.0 * y)
        + g01 * (2.0 * x)
        + g02 * (2.0 * w)
        + g10 * (2.0 * x)
        + g12 * (2.0 * z)
        + g20 * (-2.0 * w)
        + g21 * (2.0 * z)
        + g22 * (-4.0 * y);

    let dz = g00 * (-4.0 * z)
        + g01 * (-2.0 * w)
        + g02 * (2.0 * x)
        + g10 * (2.0 * w)
        + g11 * (-4.0 * z)
        + g12 * (2.0 * y)
        + g20 * (2.0 * x)
        + g21 * (2.0 * y);

    let grad_unit = Vector4::new(dw, dx, dy, dz);

    // Through the normalization q = q_raw / ||q_raw||:
    // dL/dq_raw = (I - q qᵀ) dL/dq / ||q_raw||
    let dot = q.dot(&grad_unit);
    (grad_unit - q * dot) / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_identity_quaternion() {
        let r = quat_to_rotmat(&Vector4::new(1.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(r, Matrix3::identity(), epsilon = 1e-6);
    }

    #[test]
    fn test_rotation_is_orthonormal() {
        let mut rng = StdRng::seed_from_u64(0x207A_7E5);
        for _ in 0..50 {
            let q = Vector4::new(
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
            );
            if q.norm() < 1e-3 {
                continue;
            }
            let r = quat_to_rotmat(&q);
            assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-5);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_vjp_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(0x0A76_A4D1);
        for _ in 0..100 {
            let mut q = Vector4::new(
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
            );
            if q.norm() < 1e-3 {
                q.x = 1.0;
            }

            let v_r = Matrix3::from_fn(|_, _| rng.gen_range(-1.0f32..1.0));
            let ana = quat_to_rotmat_vjp(&q, &v_r);

            let loss = |q: &Vector4<f32>| -> f64 {
                let r = quat_to_rotmat(q);
                let mut l = 0.0f64;
                for i in 0..3 {
                    for j in 0..3 {
                        l += r[(i, j)] as f64 * v_r[(i, j)] as f64;
                    }
                }
                l
            };

            let eps = 1e-3f32;
            for k in 0..4 {
                let mut plus = q;
                let mut minus = q;
                plus[k] += eps;
                minus[k] -= eps;
                let num = ((loss(&plus) - loss(&minus)) / (2.0 * eps as f64)) as f32;
                let abs_err = (ana[k] - num).abs();
                assert!(
                    abs_err < 5e-3,
                    "quat vjp mismatch k={k}: num={num} ana={} abs_err={abs_err}",
                    ana[k]
                );
            }
        }
    }
}
