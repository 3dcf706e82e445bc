//! Rigid bodies and their set.

use crate::data::arena::{Arena, Index};
use crate::dynamics::MassProperties;
use crate::math::{Isometry, Matrix, Point, Real, Rotation, Vector};
use crate::utils::WCross;

/// The status of a body, governing how it is affected by external forces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum BodyType {
    /// Moves under the effect of forces and constraints.
    Dynamic,
    /// Never moves; infinite mass and inertia.
    Fixed,
}

/// A rigid body.
///
/// The vehicle solver borrows rigid bodies for one step through their
/// [`RigidBodySet`] and never owns them: it reads positions, velocities and
/// mass properties, and writes back force/torque accumulators which the
/// embedding simulation loop integrates.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RigidBody {
    position: Isometry<Real>,
    linvel: Vector<Real>,
    angvel: Vector<Real>,
    mprops: MassProperties,
    force: Vector<Real>,
    torque: Vector<Real>,
    body_type: BodyType,
    /// User-defined data associated to this body.
    pub user_data: u128,
}

impl RigidBody {
    /// Creates a dynamic body with the given mass properties.
    pub fn new_dynamic(position: Isometry<Real>, mprops: MassProperties) -> Self {
        Self {
            position,
            linvel: Vector::zeros(),
            angvel: Vector::zeros(),
            mprops,
            force: Vector::zeros(),
            torque: Vector::zeros(),
            body_type: BodyType::Dynamic,
            user_data: 0,
        }
    }

    /// Creates a fixed body: infinite mass, never moves.
    pub fn new_fixed(position: Isometry<Real>) -> Self {
        Self {
            position,
            linvel: Vector::zeros(),
            angvel: Vector::zeros(),
            mprops: MassProperties::new(Point::origin(), 0.0, Vector::zeros()),
            force: Vector::zeros(),
            torque: Vector::zeros(),
            body_type: BodyType::Fixed,
            user_data: 0,
        }
    }

    /// The status of this body.
    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    /// Is this body dynamic?
    pub fn is_dynamic(&self) -> bool {
        self.body_type == BodyType::Dynamic
    }

    /// The world-space position of this body.
    pub fn position(&self) -> &Isometry<Real> {
        &self.position
    }

    /// Sets the world-space position of this body.
    pub fn set_position(&mut self, position: Isometry<Real>) {
        self.position = position;
    }

    /// The linear velocity of this body.
    pub fn linvel(&self) -> &Vector<Real> {
        &self.linvel
    }

    /// The angular velocity of this body.
    pub fn angvel(&self) -> &Vector<Real> {
        &self.angvel
    }

    /// Sets the linear velocity of this body.
    pub fn set_linvel(&mut self, linvel: Vector<Real>) {
        self.linvel = linvel;
    }

    /// Sets the angular velocity of this body.
    pub fn set_angvel(&mut self, angvel: Vector<Real>) {
        self.angvel = angvel;
    }

    /// The mass properties of this body.
    pub fn mass_properties(&self) -> &MassProperties {
        &self.mprops
    }

    /// The mass of this body, zero standing for infinite.
    pub fn mass(&self) -> Real {
        match self.body_type {
            BodyType::Dynamic => self.mprops.mass(),
            BodyType::Fixed => 0.0,
        }
    }

    /// The inverse mass, taking the body type into account.
    pub fn effective_inv_mass(&self) -> Real {
        match self.body_type {
            BodyType::Dynamic => self.mprops.inv_mass,
            BodyType::Fixed => 0.0,
        }
    }

    /// The world-space inverse inertia tensor, taking the body type into
    /// account.
    pub fn effective_world_inv_inertia(&self) -> Matrix<Real> {
        match self.body_type {
            BodyType::Dynamic => self.mprops.world_inv_inertia(&self.position.rotation),
            BodyType::Fixed => Matrix::zeros(),
        }
    }

    /// The world-space center of mass.
    pub fn center_of_mass(&self) -> Point<Real> {
        self.mprops.world_com(&self.position)
    }

    /// The velocity of the material point of this body located at `point`.
    pub fn velocity_at_point(&self, point: &Point<Real>) -> Vector<Real> {
        self.linvel + self.angvel.gcross(point - self.center_of_mass())
    }

    /// The force accumulated on this body for the current step.
    pub fn force(&self) -> &Vector<Real> {
        &self.force
    }

    /// The torque accumulated on this body for the current step.
    pub fn torque(&self) -> &Vector<Real> {
        &self.torque
    }

    /// Adds a force applied at the center of mass.
    pub fn add_force(&mut self, force: Vector<Real>) {
        if self.is_dynamic() {
            self.force += force;
        }
    }

    /// Adds a torque.
    pub fn add_torque(&mut self, torque: Vector<Real>) {
        if self.is_dynamic() {
            self.torque += torque;
        }
    }

    /// Adds a force applied at the given world-space point.
    pub fn add_force_at_point(&mut self, force: Vector<Real>, point: Point<Real>) {
        if self.is_dynamic() {
            self.force += force;
            self.torque += (point - self.center_of_mass()).gcross(force);
        }
    }

    /// Clears the force and torque accumulators.
    pub fn reset_forces(&mut self) {
        self.force = Vector::zeros();
        self.torque = Vector::zeros();
    }

    /// Semi-implicit Euler integration of the accumulated forces, gravity,
    /// and the resulting velocities.
    ///
    /// Small embeddings and tests drive bodies with this; a full engine may
    /// read the accumulators and integrate on its own instead.
    pub fn integrate(&mut self, dt: Real, gravity: &Vector<Real>) {
        if !self.is_dynamic() {
            return;
        }

        self.linvel += (self.force * self.mprops.inv_mass + gravity) * dt;
        self.angvel += self.effective_world_inv_inertia() * self.torque * dt;

        self.position.translation.vector += self.linvel * dt;
        let dq = Rotation::new(self.angvel * dt);
        self.position.rotation = dq * self.position.rotation;
    }
}

/// The handle of a rigid body added to a [`RigidBodySet`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct RigidBodyHandle(pub Index);

impl RigidBodyHandle {
    /// An always-invalid handle.
    pub fn invalid() -> Self {
        Self(Index::from_raw_parts(crate::INVALID_U32, crate::INVALID_U32))
    }
}

/// A set of rigid bodies that can be handled by the vehicle solver.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RigidBodySet {
    bodies: Arena<RigidBody>,
}

impl RigidBodySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            bodies: Arena::new(),
        }
    }

    /// The number of bodies in the set.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Adds a body and returns its handle.
    pub fn insert(&mut self, body: RigidBody) -> RigidBodyHandle {
        RigidBodyHandle(self.bodies.insert(body))
    }

    /// Removes a body from the set.
    pub fn remove(&mut self, handle: RigidBodyHandle) -> Option<RigidBody> {
        self.bodies.remove(handle.0)
    }

    /// Gets a reference to the body with the given handle.
    pub fn get(&self, handle: RigidBodyHandle) -> Option<&RigidBody> {
        self.bodies.get(handle.0)
    }

    /// Gets a mutable reference to the body with the given handle.
    pub fn get_mut(&mut self, handle: RigidBodyHandle) -> Option<&mut RigidBody> {
        self.bodies.get_mut(handle.0)
    }

    /// Iterates over the bodies.
    pub fn iter(&self) -> impl Iterator<Item = (RigidBodyHandle, &RigidBody)> {
        self.bodies.iter().map(|(i, b)| (RigidBodyHandle(i), b))
    }

    /// Mutably iterates over the bodies.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RigidBodyHandle, &mut RigidBody)> {
        self.bodies.iter_mut().map(|(i, b)| (RigidBodyHandle(i), b))
    }
}

impl std::ops::Index<RigidBodyHandle> for RigidBodySet {
    type Output = RigidBody;

    fn index(&self, handle: RigidBodyHandle) -> &RigidBody {
        &self.bodies[handle.0]
    }
}

impl std::ops::IndexMut<RigidBodyHandle> for RigidBodySet {
    fn index_mut(&mut self, handle: RigidBodyHandle) -> &mut RigidBody {
        &mut self.bodies[handle.0]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn velocity_at_point_accounts_for_rotation() {
        let mprops = MassProperties::new(Point::origin(), 1.0, Vector::new(1.0, 1.0, 1.0));
        let mut rb = RigidBody::new_dynamic(Isometry::identity(), mprops);
        rb.set_angvel(Vector::new(0.0, 0.0, 1.0));

        let v = rb.velocity_at_point(&Point::new(1.0, 0.0, 0.0));
        assert_relative_eq!(v, Vector::new(0.0, 1.0, 0.0), epsilon = 1.0e-6);
    }

    #[test]
    fn fixed_bodies_ignore_forces() {
        let mut rb = RigidBody::new_fixed(Isometry::identity());
        rb.add_force(Vector::new(100.0, 0.0, 0.0));
        rb.integrate(1.0 / 60.0, &Vector::new(0.0, -9.81, 0.0));
        assert_eq!(*rb.linvel(), Vector::zeros());
        assert_eq!(rb.position().translation.vector, Vector::zeros());
    }

    #[test]
    fn free_fall_integration() {
        let mprops = MassProperties::new(Point::origin(), 2.0, Vector::new(1.0, 1.0, 1.0));
        let mut rb = RigidBody::new_dynamic(Isometry::identity(), mprops);
        let gravity = Vector::new(0.0, -10.0, 0.0);
        let dt = 0.01;
        for _ in 0..100 {
            rb.integrate(dt, &gravity);
        }
        assert_relative_eq!(rb.linvel().y, -10.0, epsilon = 1.0e-3);
    }

    #[test]
    fn set_handles_are_generation_checked() {
        let mut set = RigidBodySet::new();
        let h = set.insert(RigidBody::new_fixed(Isometry::identity()));
        assert!(set.get(h).is_some());
        set.remove(h);
        assert!(set.get(h).is_none());
        let h2 = set.insert(RigidBody::new_fixed(Isometry::identity()));
        assert!(set.get(h).is_none());
        assert!(set.get(h2).is_some());
    }
}
