//! The world-level registry of vehicles.

use super::vehicle::{VehicleConstraint, VehicleUpdateHandler};
use crate::data::arena::{Arena, Index};
use crate::dynamics::{IntegrationParameters, RigidBodySet};
use crate::error::Error;
use crate::geometry::TireContact;
use crate::math::{Real, Vector};

/// The handle of a vehicle added to a [`VehicleSet`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct VehicleHandle(pub(crate) Index);

/// A set of vehicles stepped together by the embedding simulation loop.
#[derive(Default)]
pub struct VehicleSet {
    vehicles: Arena<VehicleConstraint>,
}

impl VehicleSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            vehicles: Arena::new(),
        }
    }

    /// The number of registered vehicles.
    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Registers a vehicle and returns its handle.
    pub fn insert(&mut self, vehicle: VehicleConstraint) -> VehicleHandle {
        VehicleHandle(self.vehicles.insert(vehicle))
    }

    /// Removes a vehicle from the set, destroying its tires.
    pub fn remove(&mut self, handle: VehicleHandle) -> Option<VehicleConstraint> {
        self.vehicles.remove(handle.0)
    }

    /// A reference to a vehicle.
    pub fn get(&self, handle: VehicleHandle) -> Option<&VehicleConstraint> {
        self.vehicles.get(handle.0)
    }

    /// A mutable reference to a vehicle.
    pub fn get_mut(&mut self, handle: VehicleHandle) -> Option<&mut VehicleConstraint> {
        self.vehicles.get_mut(handle.0)
    }

    /// Iterates over the vehicles.
    pub fn iter(&self) -> impl Iterator<Item = (VehicleHandle, &VehicleConstraint)> {
        self.vehicles.iter().map(|(i, v)| (VehicleHandle(i), v))
    }

    /// Mutably iterates over the vehicles.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (VehicleHandle, &mut VehicleConstraint)> {
        self.vehicles.iter_mut().map(|(i, v)| (VehicleHandle(i), v))
    }

    /// Steps every vehicle once.
    ///
    /// `contacts` maps each vehicle to the contact batch its tires are
    /// currently involved in; tire handles are only meaningful within their
    /// own vehicle, so contacts are supplied per vehicle rather than as one
    /// flat list.
    pub fn update_all<'a>(
        &mut self,
        gravity: &Vector<Real>,
        params: &IntegrationParameters,
        bodies: &mut RigidBodySet,
        mut contacts: impl FnMut(VehicleHandle) -> &'a [TireContact],
        handler: &mut dyn VehicleUpdateHandler,
    ) -> Result<(), Error> {
        for (index, vehicle) in self.vehicles.iter_mut() {
            let handle = VehicleHandle(index);
            vehicle.update(gravity, params, bodies, contacts(handle), handler)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dynamics::{MassProperties, RigidBody, TireDesc};
    use crate::math::{Isometry, Point};

    fn make_vehicle(bodies: &mut RigidBodySet) -> VehicleConstraint {
        let mprops = MassProperties::new(Point::origin(), 500.0, Vector::repeat(500.0));
        let chassis = bodies.insert(RigidBody::new_dynamic(Isometry::identity(), mprops));
        let mut vehicle = VehicleConstraint::new(chassis, Vector::y());
        vehicle
            .add_tire(&TireDesc::new(Isometry::translation(0.0, -0.2, 0.0)))
            .unwrap();
        vehicle
    }

    #[test]
    fn registry_round_trip() {
        let mut bodies = RigidBodySet::new();
        let mut set = VehicleSet::new();
        let a = set.insert(make_vehicle(&mut bodies));
        let b = set.insert(make_vehicle(&mut bodies));
        assert_eq!(set.len(), 2);
        assert!(set.get(a).is_some());

        let removed = set.remove(a).unwrap();
        assert_eq!(removed.num_tires(), 1);
        assert!(set.get(a).is_none());
        assert!(set.get(b).is_some());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn update_all_steps_every_vehicle() {
        let mut bodies = RigidBodySet::new();
        let mut set = VehicleSet::new();
        set.insert(make_vehicle(&mut bodies));
        set.insert(make_vehicle(&mut bodies));

        let gravity = Vector::new(0.0, -9.8, 0.0);
        set.update_all(
            &gravity,
            &IntegrationParameters::default(),
            &mut bodies,
            |_| &[],
            &mut (),
        )
        .unwrap();

        // Airborne vehicles: every tire reports no load.
        for (_, vehicle) in set.iter() {
            for (_, tire) in vehicle.tires() {
                assert!(tire.is_airborne());
            }
        }
    }
}
