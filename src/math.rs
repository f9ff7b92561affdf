//! Types, aliases and helper operations for doing math with `nalgebra`.
//!
//! Jacobian matrices throughout the solver store one constraint axis per
//! row, so velocities map into constraint space with a plain multiply and
//! impulses map back out through `tr_mul`. The helpers here cover the
//! operations the constraints need beyond what `nalgebra` provides.

use nalgebra as na;

pub type Vec3 = na::Vector3<f32>;
pub type Quat = na::Quaternion<f32>;
pub type Mat3 = na::Matrix3<f32>;

/// Threshold value used for floating point comparisons.
pub const EPSILON: f32 = 1e-7;

pub fn up() -> Vec3 {
    Vec3::new(0.0, 1.0, 0.0)
}

pub fn right() -> Vec3 {
    Vec3::new(1.0, 0.0, 0.0)
}

/// Creates a quaternion representing a rotation of `angle` radians around
/// a unit-length `axis`.
pub fn quat_from_axis_angle(axis: Vec3, angle: f32) -> Quat {
    let half = angle * 0.5;
    let s = half.sin();
    Quat::new(half.cos(), axis.x * s, axis.y * s, axis.z * s)
}

/// Rotates a vector by a unit quaternion.
pub fn rotate(v: Vec3, rotation: Quat) -> Vec3 {
    // Optimized-down version of v' = q * v * q^-1 with the conjugate
    // standing in for the inverse of a unit quaternion.
    let x2 = rotation.i + rotation.i;
    let y2 = rotation.j + rotation.j;
    let z2 = rotation.k + rotation.k;
    let xx2 = rotation.i * x2;
    let xy2 = rotation.i * y2;
    let xz2 = rotation.i * z2;
    let yy2 = rotation.j * y2;
    let yz2 = rotation.j * z2;
    let zz2 = rotation.k * z2;
    let wx2 = rotation.w * x2;
    let wy2 = rotation.w * y2;
    let wz2 = rotation.w * z2;
    Vec3::new(
        v.x * ((1.0 - yy2) - zz2) + v.y * (xy2 - wz2) + v.z * (xz2 + wy2),
        v.x * (xy2 + wz2) + v.y * ((1.0 - xx2) - zz2) + v.z * (yz2 - wx2),
        v.x * (xz2 - wy2) + v.y * (yz2 + wx2) + v.z * ((1.0 - xx2) - yy2),
    )
}

/// Multiplies two quaternions in reverse order, producing the rotation
/// equivalent to applying `a` first and then `b`.
pub fn concatenate(a: Quat, b: Quat) -> Quat {
    b * a
}

/// Computes the axis-angle representation of a normalized quaternion.
///
/// Quaternions within 1e-12 of identity return the up axis with a zero
/// angle rather than dividing by a vanishing sine.
pub fn axis_angle(q: Quat) -> (Vec3, f32) {
    let (qx, qy, qz, qw) = if q.w < 0.0 {
        (-q.i, -q.j, -q.k, -q.w)
    } else {
        (q.i, q.j, q.k, q.w)
    };
    // The threshold is below f32 resolution; compare in f64.
    if qw as f64 > 1.0 - 1e-12 {
        (up(), 0.0)
    } else {
        let angle = 2.0 * qw.acos();
        let denominator = 1.0 / (1.0 - qw * qw).sqrt();
        (
            Vec3::new(qx * denominator, qy * denominator, qz * denominator),
            angle,
        )
    }
}

/// Computes the quaternion rotation between two unit-length vectors.
///
/// Opposing parallel vectors have no unique rotation axis; that case
/// deterministically picks an axis perpendicular to `v1`.
pub fn between_unit_vectors(v1: Vec3, v2: Vec3) -> Quat {
    let dot = v1.dot(&v2);
    let q = if dot < -0.9999 {
        Quat::new(0.0, -v1.z, v1.y, v1.x)
    } else {
        let axis = v1.cross(&v2);
        Quat::new(dot + 1.0, axis.x, axis.y, axis.z)
    };
    q.normalize()
}

/// Creates a 3x3 matrix representing the orientation stored in the quaternion.
pub fn matrix_from_quaternion(q: Quat) -> Mat3 {
    let xx = 2.0 * q.i * q.i;
    let yy = 2.0 * q.j * q.j;
    let zz = 2.0 * q.k * q.k;
    let xy = 2.0 * q.i * q.j;
    let xz = 2.0 * q.i * q.k;
    let xw = 2.0 * q.i * q.w;
    let yz = 2.0 * q.j * q.k;
    let yw = 2.0 * q.j * q.w;
    let zw = 2.0 * q.k * q.w;
    Mat3::new(
        1.0 - yy - zz,
        xy + zw,
        xz - yw,
        xy - zw,
        1.0 - xx - zz,
        yz + xw,
        xz + yw,
        yz - xw,
        1.0 - xx - yy,
    )
}

/// Creates the skew-symmetric matrix M from vector a such that M * b is
/// the cross product of a and b.
pub fn cross_matrix(v: Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Packs a single 1x3 jacobian row into the top row of a matrix.
pub(crate) fn single_row(row: Vec3) -> Mat3 {
    Mat3::new(row.x, row.y, row.z, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
}

/// Packs two 1x3 jacobian rows into the top rows of a matrix.
pub(crate) fn two_rows(row0: Vec3, row1: Vec3) -> Mat3 {
    Mat3::new(
        row0.x, row0.y, row0.z, row1.x, row1.y, row1.z, 0.0, 0.0, 0.0,
    )
}

fn determinant(m: &Mat3) -> f32 {
    m[(0, 0)] * m[(1, 1)] * m[(2, 2)]
        + m[(0, 1)] * m[(1, 2)] * m[(2, 0)]
        + m[(0, 2)] * m[(1, 0)] * m[(2, 1)]
        - m[(2, 0)] * m[(1, 1)] * m[(0, 2)]
        - m[(2, 1)] * m[(1, 2)] * m[(0, 0)]
        - m[(2, 2)] * m[(1, 0)] * m[(0, 1)]
}

/// Inverts the given matrix. The caller is responsible for the matrix
/// being nonsingular; use [`adaptive_invert`] otherwise.
pub fn invert(m: &Mat3) -> Mat3 {
    let determinant_inverse = 1.0 / determinant(m);
    Mat3::new(
        (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)]) * determinant_inverse,
        (m[(0, 2)] * m[(2, 1)] - m[(2, 2)] * m[(0, 1)]) * determinant_inverse,
        (m[(0, 1)] * m[(1, 2)] - m[(1, 1)] * m[(0, 2)]) * determinant_inverse,
        (m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)]) * determinant_inverse,
        (m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)]) * determinant_inverse,
        (m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)]) * determinant_inverse,
        (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)]) * determinant_inverse,
        (m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)]) * determinant_inverse,
        (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]) * determinant_inverse,
    )
}

/// Calculates the determinant of the largest nonsingular submatrix,
/// excluding 2x2's that involve M13 or M31 and 1x1's that involve
/// nondiagonal elements.
///
/// The returned code identifies the submatrix used: 0 is the full 3x3,
/// 1 the upper left 2x2, 2 the lower right 2x2, 3 the four corners,
/// 4 is M11, 5 is M22, 6 is M33, and -1 means completely singular.
fn adaptive_determinant(m: &Mat3) -> (f32, i32) {
    // Try the full matrix first. The zero comparisons are numerically
    // flimsy in general, but the way constraints build these matrices,
    // degenerate rows are exactly zero.
    let det = determinant(m);
    if det != 0.0 {
        return (det, 0);
    }
    let det = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];
    if det != 0.0 {
        return (det, 1);
    }
    let det = m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)];
    if det != 0.0 {
        return (det, 2);
    }
    let det = m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)];
    if det != 0.0 {
        return (det, 3);
    }
    if m[(0, 0)] != 0.0 {
        return (m[(0, 0)], 4);
    }
    if m[(1, 1)] != 0.0 {
        return (m[(1, 1)], 5);
    }
    if m[(2, 2)] != 0.0 {
        return (m[(2, 2)], 6);
    }
    (0.0, -1)
}

/// Inverts the largest nonsingular submatrix in the matrix, zeroing the
/// rows and columns outside it.
///
/// Constraints with fewer than three rows produce effective mass matrices
/// with zero rows; a plain inverse would blow up on them, while this
/// selects the pseudo-inverse of the populated block. The fallback order
/// of [`adaptive_determinant`] decides which block that is.
pub fn adaptive_invert(m: &Mat3) -> Mat3 {
    let (det, submatrix) = adaptive_determinant(m);
    let di = 1.0 / det;
    match submatrix {
        0 => Mat3::new(
            (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)]) * di,
            (m[(0, 2)] * m[(2, 1)] - m[(2, 2)] * m[(0, 1)]) * di,
            (m[(0, 1)] * m[(1, 2)] - m[(1, 1)] * m[(0, 2)]) * di,
            (m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)]) * di,
            (m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)]) * di,
            (m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)]) * di,
            (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)]) * di,
            (m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)]) * di,
            (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]) * di,
        ),
        1 => Mat3::new(
            m[(1, 1)] * di,
            -m[(0, 1)] * di,
            0.0,
            -m[(1, 0)] * di,
            m[(0, 0)] * di,
            0.0,
            0.0,
            0.0,
            0.0,
        ),
        2 => Mat3::new(
            0.0,
            0.0,
            0.0,
            0.0,
            m[(2, 2)] * di,
            -m[(1, 2)] * di,
            0.0,
            -m[(2, 1)] * di,
            m[(1, 1)] * di,
        ),
        3 => Mat3::new(
            m[(2, 2)] * di,
            0.0,
            -m[(0, 2)] * di,
            0.0,
            0.0,
            0.0,
            -m[(2, 0)] * di,
            0.0,
            m[(0, 0)] * di,
        ),
        4 => {
            let mut result = Mat3::zeros();
            result[(0, 0)] = 1.0 / m[(0, 0)];
            result
        }
        5 => {
            let mut result = Mat3::zeros();
            result[(1, 1)] = 1.0 / m[(1, 1)];
            result
        }
        6 => {
            let mut result = Mat3::zeros();
            result[(2, 2)] = 1.0 / m[(2, 2)];
            result
        }
        // Completely singular.
        _ => Mat3::zeros(),
    }
}

//
// tests
//
