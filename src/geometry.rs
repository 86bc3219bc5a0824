//! Primitive SO(3) and unit-vector helpers shared by the tracker and the
//! adaptive layer.

use nalgebra::{Matrix3, Vector3};

use crate::error::{ControlError, Result};

/// Norms below this are treated as zero by [`normalize`] and
/// [`derivative_of_unit_vector`].
pub const NORM_EPSILON: f64 = 1e-9;

/// Skew-symmetric (hat) matrix of `v`, so that `skew(v) * x == v.cross(x)`.
///
/// ```text
/// [v]x = [ 0  -z   y]
///        [ z   0  -x]
///        [-y   x   0]
/// ```
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Vee map, the inverse of [`skew`].
///
/// Averages the mirrored off-diagonal pairs, so inputs that are only
/// approximately antisymmetric (such as `RcᵀR − RᵀRc` formed in floating
/// point) still map to the nearest axial vector.
pub fn unskew(s: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(
        s[(2, 1)] - s[(1, 2)],
        s[(0, 2)] - s[(2, 0)],
        s[(1, 0)] - s[(0, 1)],
    ) / 2.0
}

/// Returns `v / |v|`, or [`ControlError::DegenerateVector`] if `|v|` is
/// below [`NORM_EPSILON`].
pub fn normalize(v: &Vector3<f64>, what: &'static str) -> Result<Vector3<f64>> {
    let norm = v.norm();
    if norm < NORM_EPSILON || !norm.is_finite() {
        return Err(ControlError::DegenerateVector { what, norm });
    }
    Ok(v / norm)
}

/// A unit vector together with its first two time derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitVectorDerivatives {
    pub u: Vector3<f64>,
    pub u_dot: Vector3<f64>,
    pub u_ddot: Vector3<f64>,
}

/// Differentiates `u = q / |q|` twice given `q`, `q̇` and `q̈`.
///
/// ```text
/// u̇ = q̇/n − q (q·q̇)/n³
/// ü = q̈/n − 2 q̇ (q·q̇)/n³ − q (q̇·q̇ + q·q̈)/n³ + 3 q (q·q̇)²/n⁵
/// ```
pub fn derivative_of_unit_vector(
    q: &Vector3<f64>,
    q_dot: &Vector3<f64>,
    q_ddot: &Vector3<f64>,
    what: &'static str,
) -> Result<UnitVectorDerivatives> {
    let u = normalize(q, what)?;
    let nq = q.norm();
    let nq3 = nq.powi(3);
    let nq5 = nq.powi(5);

    let q_qdot = q.dot(q_dot);
    let u_dot = q_dot / nq - q * q_qdot / nq3;
    let u_ddot = q_ddot / nq
        - q_dot * (2.0 * q_qdot) / nq3
        - q * (q_dot.dot(q_dot) + q.dot(q_ddot)) / nq3
        + q * 3.0 * q_qdot * q_qdot / nq5;

    Ok(UnitVectorDerivatives { u, u_dot, u_ddot })
}

/// Desired heading axis `b1d = [cos ψ, sin ψ, 0]` and its first two time
/// derivatives.
pub fn heading_axis(yaw: f64, yaw_dot: f64, yaw_ddot: f64) -> UnitVectorDerivatives {
    let (s, c) = yaw.sin_cos();
    UnitVectorDerivatives {
        u: Vector3::new(c, s, 0.0),
        u_dot: Vector3::new(-yaw_dot * s, yaw_dot * c, 0.0),
        u_ddot: Vector3::new(
            -yaw_ddot * s - yaw_dot * yaw_dot * c,
            yaw_ddot * c - yaw_dot * yaw_dot * s,
            0.0,
        ),
    }
}

/// Checks that `r` is orthonormal with determinant +1 within `tolerance`.
pub fn is_rotation(r: &Matrix3<f64>, tolerance: f64) -> bool {
    let orthogonality = (r.transpose() * r - Matrix3::identity()).abs().max();
    orthogonality < tolerance && (r.determinant() - 1.0).abs() < tolerance
}
