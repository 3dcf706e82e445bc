//! Contact data consumed by the vehicle solver.

use crate::dynamics::{RigidBodyHandle, TireHandle};
use crate::math::{Point, Real, Vector};

/// A single contact point between a tire and the ground or an obstacle.
///
/// Contacts are produced by the caller's collision pipeline (an external
/// collaborator of this crate) and consumed read-only by the solver during
/// row construction: the solver never creates or destroys contacts.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TireContact {
    /// The tire touching the ground.
    pub tire: TireHandle,
    /// The body being touched. `None` stands for the static environment
    /// (infinite mass).
    pub body: Option<RigidBodyHandle>,
    /// The world-space contact point.
    pub point: Point<Real>,
    /// The world-space contact normal, unit length, pointing from the ground
    /// towards the tire.
    pub normal: Vector<Real>,
    /// How deep the tire currently penetrates the ground.
    pub penetration: Real,
    /// Longitudinal friction coefficient while the tire is gripping.
    pub static_friction_longitudinal: Real,
    /// Longitudinal friction coefficient once the tire slides.
    pub dynamic_friction_longitudinal: Real,
    /// Lateral friction coefficient while the tire is gripping.
    pub static_friction_lateral: Real,
    /// Lateral friction coefficient once the tire slides.
    pub dynamic_friction_lateral: Real,
}

impl TireContact {
    /// A contact with the given geometry and a uniform friction coefficient
    /// for every direction and slip regime.
    pub fn new(
        tire: TireHandle,
        point: Point<Real>,
        normal: Vector<Real>,
        penetration: Real,
        friction: Real,
    ) -> Self {
        Self {
            tire,
            body: None,
            point,
            normal,
            penetration,
            static_friction_longitudinal: friction,
            dynamic_friction_longitudinal: friction,
            static_friction_lateral: friction,
            dynamic_friction_lateral: friction,
        }
    }

    /// Sets the touched body.
    pub fn with_body(mut self, body: RigidBodyHandle) -> Self {
        self.body = Some(body);
        self
    }
}
