//! Vehicle constraints: tires, the per-vehicle force solver, and the vehicle
//! registry.

pub(crate) mod solver;
mod tire;
mod vehicle;
mod vehicle_set;

pub use solver::{MAX_DOF, MAX_TIRES};
pub use tire::{Tire, TireDesc};
pub use vehicle::{TireHandle, VehicleConstraint, VehicleUpdateHandler};
pub use vehicle_set::{VehicleHandle, VehicleSet};
