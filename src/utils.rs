//! Miscellaneous numerical utilities.

use crate::math::{Matrix, Real, Vector};

pub(crate) const INV_EPSILON: Real = 1.0e-20;

/// A guarded reciprocal: returns `0.0` instead of an infinity when `val` is
/// too close to zero.
pub(crate) fn inv(val: Real) -> Real {
    if (-INV_EPSILON..=INV_EPSILON).contains(&val) {
        0.0
    } else {
        1.0 / val
    }
}

/// Trait to compute the cross-product between various entities.
pub trait WCross<Rhs>: Sized {
    /// The result of the cross product.
    type Result;
    /// Computes the cross product between `self` and `rhs`.
    fn gcross(&self, rhs: Rhs) -> Self::Result;
}

impl WCross<Vector<Real>> for Vector<Real> {
    type Result = Self;

    #[inline]
    fn gcross(&self, rhs: Vector<Real>) -> Self::Result {
        self.cross(&rhs)
    }
}

/// Trait to compute the dot product between various entities.
pub trait WDot<Rhs>: Sized {
    /// The result of the dot product.
    type Result;
    /// Computes the dot product between `self` and `rhs`.
    fn gdot(&self, rhs: Rhs) -> Self::Result;
}

impl WDot<Vector<Real>> for Vector<Real> {
    type Result = Real;

    #[inline]
    fn gdot(&self, rhs: Vector<Real>) -> Self::Result {
        self.dot(&rhs)
    }
}

/// Trait to compute the orthonormal basis of a vector.
pub trait WBasis: Sized {
    /// The type of the array of orthonormal vectors.
    type Basis;
    /// Computes the vectors which, when combined with `self`, form an orthonormal basis.
    fn orthonormal_basis(self) -> Self::Basis;
}

impl WBasis for Vector<Real> {
    type Basis = [Vector<Real>; 2];

    // Robust and branchless implementation from Pixar:
    // https://graphics.pixar.com/library/OrthonormalB/paper.pdf
    fn orthonormal_basis(self) -> [Vector<Real>; 2] {
        let sign = (1.0 as Real).copysign(self.z);
        let a = -1.0 / (sign + self.z);
        let b = self.x * self.y * a;

        [
            Vector::new(1.0 + sign * self.x * self.x * a, sign * b, -sign * self.x),
            Vector::new(b, sign + self.y * self.y * a, -self.y),
        ]
    }
}

/// The maximum number of Jacobi sweeps performed by [`symmetric_eigen3`].
const MAX_JACOBI_SWEEPS: usize = 50;

/// Eigen-decomposition of a symmetric 3×3 matrix with the classic cyclic
/// Jacobi rotation sweep.
///
/// Returns the eigenvalues and the matrix whose columns are the matching
/// eigenvectors. Iterates until the off-diagonal norm falls below a fixed
/// relative tolerance, or [`MAX_JACOBI_SWEEPS`] sweeps elapse, whichever
/// comes first.
///
/// The input is assumed symmetric; only its upper triangle is read.
pub fn symmetric_eigen3(mat: &Matrix<Real>) -> (Vector<Real>, Matrix<Real>) {
    let mut a = mat.upper_triangle();
    a[(1, 0)] = a[(0, 1)];
    a[(2, 0)] = a[(0, 2)];
    a[(2, 1)] = a[(1, 2)];

    let mut v = Matrix::identity();
    let tol = Real::EPSILON * 100.0 * a.norm().max(1.0e-30);

    for _ in 0..MAX_JACOBI_SWEEPS {
        let off = (a[(0, 1)] * a[(0, 1)] + a[(0, 2)] * a[(0, 2)] + a[(1, 2)] * a[(1, 2)]).sqrt();
        if off <= tol {
            break;
        }

        for &(p, q) in &[(0usize, 1usize), (0, 2), (1, 2)] {
            let apq = a[(p, q)];
            if apq.abs() <= tol * 1.0e-3 {
                continue;
            }

            let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
            let t = (1.0 as Real).copysign(theta) / (theta.abs() + (1.0 + theta * theta).sqrt());
            let c = 1.0 / (1.0 + t * t).sqrt();
            let s = t * c;

            let mut j = Matrix::identity();
            j[(p, p)] = c;
            j[(q, q)] = c;
            j[(p, q)] = s;
            j[(q, p)] = -s;

            a = j.transpose() * a * j;
            v *= j;
        }
    }

    (Vector::new(a[(0, 0)], a[(1, 1)], a[(2, 2)]), v)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn check_eigen(m: Matrix<Real>) {
        let (vals, vecs) = symmetric_eigen3(&m);

        // Reconstruction: V * diag(λ) * Vᵗ must equal the input.
        let rebuilt = vecs * Matrix::from_diagonal(&vals) * vecs.transpose();
        assert_relative_eq!(rebuilt, m, epsilon = 1.0e-3 * m.norm().max(1.0));

        // Eigenvectors must be mutually orthonormal.
        for i in 0..3 {
            assert_relative_eq!(vecs.column(i).norm(), 1.0, epsilon = 1.0e-4);
            for j in 0..3 {
                if i != j {
                    assert!(vecs.column(i).dot(&vecs.column(j)).abs() < 1.0e-4);
                }
            }
        }
    }

    #[test]
    fn eigen_diagonal() {
        check_eigen(Matrix::from_diagonal(&Vector::new(3.0, 1.0, 2.0)));
    }

    #[test]
    fn eigen_dense_symmetric() {
        check_eigen(Matrix::new(
            4.0, 1.0, -2.0, //
            1.0, 3.0, 0.5, //
            -2.0, 0.5, 5.0,
        ));
    }

    #[test]
    fn eigen_near_degenerate_pair() {
        // Two nearly equal eigenvalues still decompose cleanly.
        check_eigen(Matrix::new(
            2.0, 1.0e-4, 0.0, //
            1.0e-4, 2.0, 0.0, //
            0.0, 0.0, 7.0,
        ));
    }

    #[test]
    fn orthonormal_basis_is_orthonormal() {
        for dir in [
            Vector::new(0.0, 1.0, 0.0),
            Vector::new(0.0, 0.0, -1.0),
            Vector::new(1.0, 2.0, -3.0).normalize(),
        ] {
            let [u, v] = dir.orthonormal_basis();
            assert_relative_eq!(u.norm(), 1.0, epsilon = 1.0e-5);
            assert_relative_eq!(v.norm(), 1.0, epsilon = 1.0e-5);
            assert!(u.dot(&v).abs() < 1.0e-5);
            assert!(u.dot(&dir).abs() < 1.0e-5);
            assert!(v.dot(&dir).abs() < 1.0e-5);
        }
    }

    #[test]
    fn inv_guards_near_zero() {
        assert_eq!(inv(0.0), 0.0);
        assert_eq!(inv(2.0), 0.5);
    }
}
