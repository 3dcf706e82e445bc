//! # Axletree
//!
//! Axletree is a small constrained rigid-body dynamics solver specialized for
//! vehicle-like articulated systems: one chassis body, up to [`MAX_TIRES`]
//! wheel sub-bodies, and the ground/obstacle bodies they currently touch.
//!
//! Each simulation step the solver builds a sparse Jacobian for all bilateral
//! (suspension, steering, drivetrain) and contact (normal, friction)
//! constraint rows touching a vehicle's bodies, then solves the resulting
//! box-bounded system with a projected conjugate-residual iteration with
//! active-set management, and writes the solved forces back to the bodies.
//!
//! The crate also carries the robustness infrastructure such a solver needs:
//! adaptive-precision floating-point expansions for exact geometric
//! predicates, an incremental 3D convex-hull builder used for wheel collision
//! proxies, a Jacobi eigen-decomposition for diagonalizing inertia tensors,
//! a generational arena, and a size-class memory pool with explicit handles.
//!
//! [`MAX_TIRES`]: crate::dynamics::MAX_TIRES

#![deny(bare_trait_objects)]
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)] // In the math code using indices adds clarity.
#![allow(clippy::module_inception)]

pub extern crate nalgebra as na;
#[cfg(feature = "serde-serialize")]
#[macro_use]
extern crate serde;
extern crate num_traits as num;

#[cfg(all(feature = "f32", feature = "f64"))]
std::compile_error!("The `f32` and `f64` features cannot be enabled at the same time.");

pub(crate) const INVALID_U32: u32 = u32::MAX;

/// The string version of axletree.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod data;
pub mod dynamics;
pub mod error;
pub mod geometry;
pub mod utils;

pub use error::Error;

/// Elementary mathematical entities (vectors, matrices, isometries, etc).
pub mod math {
    /// The scalar type used throughout the solver.
    #[cfg(feature = "f64")]
    pub type Real = f64;

    /// The scalar type used throughout the solver.
    #[cfg(not(feature = "f64"))]
    pub type Real = f32;

    /// The dimension of the simulated space.
    pub const DIM: usize = 3;

    /// The maximum number of possible rotations and translations of a rigid body.
    pub const SPATIAL_DIM: usize = 6;

    /// The maximum number of rotational degrees of freedom of a rigid-body.
    pub const ANG_DIM: usize = 3;

    /// The vector type.
    pub type Vector<N> = na::Vector3<N>;

    /// The angular vector type.
    pub type AngVector<N> = na::Vector3<N>;

    /// The point type.
    pub type Point<N> = na::Point3<N>;

    /// The matrix type.
    pub type Matrix<N> = na::Matrix3<N>;

    /// The orientation type.
    pub type Rotation<N> = na::UnitQuaternion<N>;

    /// The translation type.
    pub type Translation<N> = na::Translation3<N>;

    /// The transformation matrix type.
    pub type Isometry<N> = na::Isometry3<N>;
}

/// Prelude containing the common types defined by axletree.
pub mod prelude {
    pub use crate::data::{Arena, Index, MemoryPool, PoolHandle};
    pub use crate::dynamics::{
        BodyType, IntegrationParameters, MassProperties, RigidBody, RigidBodyHandle, RigidBodySet,
        Tire, TireContact, TireDesc, TireHandle, VehicleConstraint, VehicleHandle, VehicleSet,
        VehicleUpdateHandler,
    };
    pub use crate::error::Error;
    pub use crate::geometry::ConvexHull3;
    pub use crate::math::*;
    pub extern crate nalgebra;
}
