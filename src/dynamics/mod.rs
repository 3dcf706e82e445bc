//! Structures related to the dynamics of rigid bodies and vehicles.

pub mod integration_parameters;
pub mod mass_properties;
pub mod rigid_body;
pub mod vehicle;

pub use integration_parameters::IntegrationParameters;
pub use mass_properties::MassProperties;
pub use rigid_body::{BodyType, RigidBody, RigidBodyHandle, RigidBodySet};
pub use vehicle::{
    Tire, TireDesc, TireHandle, VehicleConstraint, VehicleHandle, VehicleSet,
    VehicleUpdateHandler, MAX_DOF, MAX_TIRES,
};

pub use crate::geometry::TireContact;
