//! Mass properties of a rigid body.

use crate::math::{AngVector, Isometry, Matrix, Point, Real, Rotation};
use crate::utils;
use na::Rotation3;
use num::Zero;

/// The local mass properties of a rigid-body.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// The center of mass of a rigid-body expressed in its local-space.
    pub local_com: Point<Real>,
    /// The inverse of the mass of a rigid-body.
    ///
    /// If this is zero, the rigid-body is assumed to have infinite mass.
    pub inv_mass: Real,
    /// The inverse of the principal angular inertia of the rigid-body.
    ///
    /// Components set to zero are assumed to be infinite along the
    /// corresponding principal axis.
    pub inv_principal_inertia: AngVector<Real>,
    /// The principal vectors of the local angular inertia tensor of the
    /// rigid-body.
    pub principal_inertia_local_frame: Rotation<Real>,
}

impl MassProperties {
    /// Initializes the mass properties from the given center-of-mass, mass,
    /// and principal angular inertia along the local coordinate axes.
    pub fn new(local_com: Point<Real>, mass: Real, principal_inertia: AngVector<Real>) -> Self {
        Self::with_principal_inertia_frame(
            local_com,
            mass,
            principal_inertia,
            Rotation::identity(),
        )
    }

    /// Initializes the mass properties from principal angular inertia values
    /// expressed in the frame `principal_inertia_local_frame`.
    pub fn with_principal_inertia_frame(
        local_com: Point<Real>,
        mass: Real,
        principal_inertia: AngVector<Real>,
        principal_inertia_local_frame: Rotation<Real>,
    ) -> Self {
        Self {
            local_com,
            inv_mass: utils::inv(mass),
            inv_principal_inertia: principal_inertia.map(utils::inv),
            principal_inertia_local_frame,
        }
    }

    /// Initializes the mass properties from a full angular inertia tensor.
    ///
    /// The (symmetric) tensor is diagonalized with a Jacobi eigen-sweep; the
    /// eigenvectors become the principal inertia frame.
    pub fn with_inertia_matrix(local_com: Point<Real>, mass: Real, inertia: Matrix<Real>) -> Self {
        let (principal, mut axes) = utils::symmetric_eigen3(&inertia);

        // Keep the eigenbasis right-handed before turning it into a rotation.
        if axes.determinant() < 0.0 {
            axes.column_mut(2).neg_mut();
        }
        let frame = Rotation::from_rotation_matrix(&Rotation3::from_matrix_unchecked(axes));

        Self::with_principal_inertia_frame(local_com, mass, principal, frame)
    }

    /// The mass of the rigid-body, zero standing for infinite.
    pub fn mass(&self) -> Real {
        utils::inv(self.inv_mass)
    }

    /// The world-space center of mass of the rigid-body.
    pub fn world_com(&self, pos: &Isometry<Real>) -> Point<Real> {
        pos * self.local_com
    }

    /// The world-space inverse angular inertia tensor of the rigid-body.
    pub fn world_inv_inertia(&self, rot: &Rotation<Real>) -> Matrix<Real> {
        if self.inv_principal_inertia.is_zero() {
            return Matrix::zeros();
        }
        let frame = (rot * self.principal_inertia_local_frame)
            .to_rotation_matrix()
            .into_inner();
        frame * Matrix::from_diagonal(&self.inv_principal_inertia) * frame.transpose()
    }

    /// Reconstructs the angular inertia tensor of the rigid body from its
    /// principal inertia values and axes.
    pub fn reconstruct_inertia_matrix(&self) -> Matrix<Real> {
        let principal = self.inv_principal_inertia.map(utils::inv);
        let frame = self.principal_inertia_local_frame.to_rotation_matrix().into_inner();
        frame * Matrix::from_diagonal(&principal) * frame.transpose()
    }
}
