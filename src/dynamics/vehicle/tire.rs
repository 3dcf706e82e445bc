//! Tires and their registration descriptors.

use crate::error::Error;
use crate::geometry::ConvexHull3;
use crate::math::{Isometry, Point, Real, Vector};
use crate::utils;

/// Radial segments of the tire collision proxy cloud.
const PROXY_SEGMENTS: usize = 16;

/// Objects used to initialize a tire.
///
/// The tire frame is expressed in chassis space with `x` pointing forward,
/// `y` up (the suspension travels along `-y`), and `z` along the axle.
#[derive(Clone, Debug)]
pub struct TireDesc {
    /// The mounting frame of the tire, relative to the chassis. Its
    /// translation is the suspension hard point.
    pub local_matrix: Isometry<Real>,
    /// The steering axis in tire-local space.
    pub pin: Vector<Real>,
    /// The tire mass.
    pub mass: Real,
    /// The tire width.
    pub width: Real,
    /// The tire radius.
    pub radius: Real,
    /// The suspension damper coefficient, in N·s/m.
    pub suspension_shock: Real,
    /// The suspension spring stiffness, in N/m.
    pub suspension_spring: Real,
    /// The rest length of the suspension.
    pub suspension_length: Real,
    /// User-defined data attached to the tire.
    pub user_data: u128,
}

impl TireDesc {
    /// A descriptor with middle-of-the-road passenger-car values; adjust the
    /// public fields before registering the tire.
    pub fn new(local_matrix: Isometry<Real>) -> Self {
        Self {
            local_matrix,
            pin: Vector::y(),
            mass: 15.0,
            width: 0.25,
            radius: 0.35,
            suspension_shock: 700.0,
            suspension_spring: 15_000.0,
            suspension_length: 0.25,
            user_data: 0,
        }
    }
}

/// A wheel attached to a vehicle.
///
/// Owned exclusively by the [`VehicleConstraint`] that created it; per-step
/// inputs (steering, drive torque, brakes) are public fields meant to be set
/// from the vehicle update handler, while mass and radius go through setters
/// so the derived inverse mass and inertia stay consistent.
///
/// [`VehicleConstraint`]: crate::dynamics::VehicleConstraint
#[derive(Clone, Debug)]
pub struct Tire {
    local_matrix: Isometry<Real>,
    pin: Vector<Real>,

    mass: Real,
    width: Real,
    radius: Real,
    inv_mass: Real,
    inv_inertia: Real,

    /// The suspension spring stiffness, in N/m.
    pub suspension_spring: Real,
    /// The suspension damper coefficient, in N·s/m.
    pub suspension_shock: Real,
    /// The rest length of the suspension.
    pub suspension_length: Real,

    /// The steering angle, in radians, around the steering pin.
    pub steer_angle: Real,
    /// The drive torque applied around the axle this step.
    pub drive_torque: Real,
    /// The maximum friction torque the brake can exert. Zero disables the
    /// brake row entirely.
    pub brake: Real,
    /// Optional explicit target angular acceleration while braking; when
    /// zero, the brake tries to stop the wheel's relative spin in one step.
    pub brake_acceleration: Real,

    /// Slip speed above which longitudinal friction switches from the static
    /// to the dynamic coefficient.
    pub max_longitudinal_slip: Real,
    /// Slip speed above which lateral friction switches from the static to
    /// the dynamic coefficient.
    pub max_lateral_slip: Real,
    /// Multiplier applied to the dynamic longitudinal friction coefficient.
    pub longitudinal_slip_coefficient: Real,
    /// Multiplier applied to the dynamic lateral friction coefficient.
    pub lateral_slip_coefficient: Real,

    // Parametric suspension state: distance travelled from the hard point
    // along the suspension direction, in [0, suspension_length].
    pub(crate) posit: Real,
    pub(crate) posit_speed: Real,
    pub(crate) spin_angle: Real,
    pub(crate) spin_omega: Real,

    // Per-step solve results.
    pub(crate) force: Vector<Real>,
    pub(crate) torque: Vector<Real>,
    pub(crate) normal_load: Real,
    pub(crate) longitudinal_speed: Real,
    pub(crate) lateral_speed: Real,
    pub(crate) longitudinal_force: Real,
    pub(crate) lateral_force: Real,
    pub(crate) longitudinal_limit: Real,
    pub(crate) lateral_limit: Real,
    pub(crate) in_contact: bool,
    pub(crate) lost_side_grip: bool,
    pub(crate) lost_traction: bool,
    pub(crate) world_matrix: Isometry<Real>,

    collision: ConvexHull3,

    /// User-defined data attached to this tire.
    pub user_data: u128,
}

impl Tire {
    pub(crate) fn new(desc: &TireDesc) -> Result<Self, Error> {
        if desc.mass <= 0.0 || desc.radius <= 0.0 {
            return Err(Error::IllConditionedSystem(
                "tire mass and radius must be positive",
            ));
        }

        let collision = build_collision_proxy(desc.width, desc.radius)?;
        let pin = desc
            .pin
            .try_normalize(1.0e-6)
            .unwrap_or_else(Vector::y);

        let mut tire = Self {
            local_matrix: desc.local_matrix,
            pin,
            mass: desc.mass,
            width: desc.width,
            radius: desc.radius,
            inv_mass: 0.0,
            inv_inertia: 0.0,
            suspension_spring: desc.suspension_spring,
            suspension_shock: desc.suspension_shock,
            suspension_length: desc.suspension_length,
            steer_angle: 0.0,
            drive_torque: 0.0,
            brake: 0.0,
            brake_acceleration: 0.0,
            max_longitudinal_slip: 1.0,
            max_lateral_slip: 1.0,
            longitudinal_slip_coefficient: 1.0,
            lateral_slip_coefficient: 1.0,
            posit: desc.suspension_length,
            posit_speed: 0.0,
            spin_angle: 0.0,
            spin_omega: 0.0,
            force: Vector::zeros(),
            torque: Vector::zeros(),
            normal_load: 0.0,
            longitudinal_speed: 0.0,
            lateral_speed: 0.0,
            longitudinal_force: 0.0,
            lateral_force: 0.0,
            longitudinal_limit: 0.0,
            lateral_limit: 0.0,
            in_contact: false,
            lost_side_grip: false,
            lost_traction: false,
            world_matrix: desc.local_matrix,
            collision,
            user_data: desc.user_data,
        };
        tire.refresh_mass_properties();
        Ok(tire)
    }

    // `inv_mass` and `inv_inertia` are derived quantities and must be
    // re-established whenever mass or radius changes.
    fn refresh_mass_properties(&mut self) {
        self.inv_mass = utils::inv(self.mass);
        // Solid-disk approximation of the wheel inertia.
        self.inv_inertia = utils::inv(0.4 * self.mass * self.radius * self.radius);
    }

    /// The mounting frame of the tire in chassis space.
    pub fn local_matrix(&self) -> &Isometry<Real> {
        &self.local_matrix
    }

    /// The steering axis in tire-local space.
    pub fn pin(&self) -> &Vector<Real> {
        &self.pin
    }

    /// The tire mass.
    pub fn mass(&self) -> Real {
        self.mass
    }

    /// Sets the tire mass, re-deriving its inverse mass and inertia.
    pub fn set_mass(&mut self, mass: Real) {
        self.mass = mass.max(1.0e-6);
        self.refresh_mass_properties();
    }

    /// The tire width.
    pub fn width(&self) -> Real {
        self.width
    }

    /// The tire radius.
    pub fn radius(&self) -> Real {
        self.radius
    }

    /// Sets the tire radius, re-deriving its inverse inertia.
    pub fn set_radius(&mut self, radius: Real) {
        self.radius = radius.max(1.0e-6);
        self.refresh_mass_properties();
    }

    /// The inverse of the tire mass.
    pub fn inv_mass(&self) -> Real {
        self.inv_mass
    }

    /// The inverse of the tire spin inertia.
    pub fn inv_inertia(&self) -> Real {
        self.inv_inertia
    }

    /// The convex collision proxy registered for this tire.
    pub fn collision_shape(&self) -> &ConvexHull3 {
        &self.collision
    }

    /// The current suspension travel from the hard point, in
    /// `[0, suspension_length]`.
    pub fn suspension_posit(&self) -> Real {
        self.posit
    }

    /// The rate of change of the suspension travel.
    pub fn suspension_speed(&self) -> Real {
        self.posit_speed
    }

    /// How much the suspension spring is currently compressed.
    pub fn suspension_compression(&self) -> Real {
        self.suspension_length - self.posit
    }

    /// The wheel spin angle around its axle.
    pub fn spin_angle(&self) -> Real {
        self.spin_angle
    }

    /// The wheel spin angular velocity around its axle.
    pub fn spin_omega(&self) -> Real {
        self.spin_omega
    }

    /// The total normal force carried by this tire during the last step.
    pub fn normal_load(&self) -> Real {
        self.normal_load
    }

    /// The measured slip speed along the rolling direction.
    pub fn longitudinal_speed(&self) -> Real {
        self.longitudinal_speed
    }

    /// The measured slip speed along the axle direction.
    pub fn lateral_speed(&self) -> Real {
        self.lateral_speed
    }

    /// The solved friction force along the rolling direction.
    pub fn longitudinal_force(&self) -> Real {
        self.longitudinal_force
    }

    /// The solved friction force along the axle direction.
    pub fn lateral_force(&self) -> Real {
        self.lateral_force
    }

    /// The friction-cone bound the longitudinal force was limited by.
    pub fn longitudinal_limit(&self) -> Real {
        self.longitudinal_limit
    }

    /// The friction-cone bound the lateral force was limited by.
    pub fn lateral_limit(&self) -> Real {
        self.lateral_limit
    }

    /// Did the tire touch nothing during the last step?
    pub fn is_airborne(&self) -> bool {
        !self.in_contact
    }

    /// Did lateral slip exceed its threshold during the last step?
    pub fn lost_side_grip(&self) -> bool {
        self.lost_side_grip
    }

    /// Did longitudinal slip exceed its threshold during the last step?
    pub fn lost_traction(&self) -> bool {
        self.lost_traction
    }

    /// The world-space frame of the tire, including steering and spin,
    /// refreshed by every solve.
    pub fn world_matrix(&self) -> &Isometry<Real> {
        &self.world_matrix
    }

    /// The accumulated force applied to the tire body by the last solve.
    pub fn tire_force(&self) -> &Vector<Real> {
        &self.force
    }

    /// The accumulated torque applied to the tire body by the last solve.
    pub fn tire_torque(&self) -> &Vector<Real> {
        &self.torque
    }
}

/// Chamfer-cylinder point cloud around the tire-local axle (`z`) axis, fed to
/// the convex hull builder to produce the collision proxy.
fn build_collision_proxy(width: Real, radius: Real) -> Result<ConvexHull3, Error> {
    let width = width.max(1.0e-3);
    let radius = radius.max(1.0e-3);
    let chamfer = (radius * 0.1).min(width * 0.25);

    let mut points = Vec::with_capacity(PROXY_SEGMENTS * 3);
    for i in 0..PROXY_SEGMENTS {
        let angle = std::f64::consts::TAU as Real * i as Real / PROXY_SEGMENTS as Real;
        let (sin, cos) = (angle.sin(), angle.cos());

        // Full radius at the center ring, chamfered rims at both sides.
        points.push(Point::new(radius * cos, radius * sin, 0.0));
        let rim = radius - chamfer;
        points.push(Point::new(rim * cos, rim * sin, width * 0.5));
        points.push(Point::new(rim * cos, rim * sin, -width * 0.5));
    }

    ConvexHull3::try_new(&points, radius * 1.0e-4)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn derived_quantities_follow_mass_and_radius() {
        let mut desc = TireDesc::new(Isometry::identity());
        desc.mass = 20.0;
        desc.radius = 0.3;
        let mut tire = Tire::new(&desc).unwrap();

        assert_relative_eq!(tire.inv_mass(), 1.0 / 20.0);
        assert_relative_eq!(tire.inv_inertia(), 1.0 / (0.4 * 20.0 * 0.09), epsilon = 1.0e-4);

        tire.set_mass(10.0);
        assert_relative_eq!(tire.inv_mass(), 0.1);
        assert_relative_eq!(tire.inv_inertia(), 1.0 / (0.4 * 10.0 * 0.09), epsilon = 1.0e-4);

        tire.set_radius(0.5);
        assert_relative_eq!(tire.inv_inertia(), 1.0 / (0.4 * 10.0 * 0.25), epsilon = 1.0e-4);
    }

    #[test]
    fn rejects_non_physical_descriptors() {
        let mut desc = TireDesc::new(Isometry::identity());
        desc.mass = 0.0;
        assert!(matches!(
            Tire::new(&desc),
            Err(Error::IllConditionedSystem(_))
        ));
    }

    #[test]
    fn collision_proxy_matches_tire_dimensions() {
        let mut desc = TireDesc::new(Isometry::identity());
        desc.radius = 0.4;
        desc.width = 0.3;
        let tire = Tire::new(&desc).unwrap();
        let hull = tire.collision_shape();

        // The proxy must stay inside the tire's bounding cylinder and reach
        // its full radius somewhere.
        let mut max_r: Real = 0.0;
        for v in hull.vertices() {
            let r = (v.x * v.x + v.y * v.y).sqrt();
            assert!(r <= 0.4 + 1.0e-4);
            assert!(v.z.abs() <= 0.15 + 1.0e-4);
            max_r = max_r.max(r);
        }
        assert!(max_r > 0.39);
    }
}
