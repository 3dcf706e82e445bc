//! The vehicle constraint: tires, per-step row construction, and force
//! distribution.

use super::solver::{
    ForceMiniSolver, Jacobian, RowKind, SolverBody, SolverRow, MAX_BOUND, MAX_TIRES, NO_TIRE,
};
use super::tire::{Tire, TireDesc};
use crate::data::arena::{Arena, Index};
use crate::dynamics::{IntegrationParameters, RigidBodyHandle, RigidBodySet};
use crate::error::Error;
use crate::geometry::TireContact;
use crate::math::{Isometry, Matrix, Point, Real, Rotation, Translation, Vector};
use crate::utils::{WBasis, WCross};
use arrayvec::ArrayVec;

/// Extra relative regularization applied to contact rows, avoiding numerical
/// stiffness when a light tire touches a much heavier (or static) body.
const CONTACT_SLIP: Real = 1.0e-3;

/// Mass ratio above which the other contact body counts as "much heavier".
const HEAVY_MASS_RATIO: Real = 50.0;

/// Hard clamp on the tire surface speed, avoiding numerical blow-up from a
/// near-zero effective wheel radius or runaway drive torque.
const MAX_SURFACE_SPEED: Real = 400.0;

/// The handle of a tire registered on a [`VehicleConstraint`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct TireHandle(pub(crate) Index);

/// The per-step configuration surface of a vehicle: invoked once per step,
/// before the solve, so the caller can set steering, drive torque and brakes
/// on each tire.
pub trait VehicleUpdateHandler {
    /// Called at the beginning of every [`VehicleConstraint::update`].
    fn update_vehicle(&mut self, vehicle: &mut VehicleConstraint, dt: Real);
}

impl VehicleUpdateHandler for () {
    fn update_vehicle(&mut self, _: &mut VehicleConstraint, _: Real) {}
}

/// Per-tire staging data gathered before row construction.
#[derive(Clone, Copy)]
struct TireStage {
    handle: TireHandle,
    body: usize,
    hard_point: Point<Real>,
    center: Point<Real>,
    front: Vector<Real>,
    lateral: Vector<Real>,
    up: Vector<Real>,
    dir: Vector<Real>,
    prev_normal: Real,
    spring_estimate: Real,
}

/// A constraint tying a chassis body, its tires, and the ground bodies the
/// tires currently touch.
///
/// The vehicle owns its tires exclusively; rigid bodies are borrowed from the
/// [`RigidBodySet`] for the duration of one [`update`](Self::update) call.
pub struct VehicleConstraint {
    chassis: RigidBodyHandle,
    up_local: Vector<Real>,
    tires: Arena<Tire>,
    solver: ForceMiniSolver,
    /// User-defined data attached to this vehicle.
    pub user_data: u128,
}

impl VehicleConstraint {
    /// Creates a vehicle around the given chassis body.
    ///
    /// `up_local` is the chassis-local up axis used as the default steering
    /// pin direction; it is normalized, falling back to `+y` when degenerate.
    pub fn new(chassis: RigidBodyHandle, up_local: Vector<Real>) -> Self {
        Self {
            chassis,
            up_local: up_local.try_normalize(1.0e-6).unwrap_or_else(Vector::y),
            tires: Arena::new(),
            solver: ForceMiniSolver::new(),
            user_data: 0,
        }
    }

    /// The handle of the chassis body.
    pub fn chassis(&self) -> RigidBodyHandle {
        self.chassis
    }

    /// The chassis-local up axis.
    pub fn up_axis(&self) -> &Vector<Real> {
        &self.up_local
    }

    /// The number of registered tires.
    pub fn num_tires(&self) -> usize {
        self.tires.len()
    }

    /// Registers a new wheel, building its convex collision proxy.
    ///
    /// Fails with [`Error::CapacityExceeded`] once the solver's fixed tire
    /// budget is reached, rather than silently truncating.
    pub fn add_tire(&mut self, desc: &TireDesc) -> Result<TireHandle, Error> {
        if self.tires.len() >= MAX_TIRES {
            return Err(Error::CapacityExceeded("vehicle tire budget"));
        }
        let tire = Tire::new(desc)?;
        Ok(TireHandle(self.tires.insert(tire)))
    }

    /// Deregisters a wheel, releasing its collision proxy.
    pub fn remove_tire(&mut self, handle: TireHandle) -> Option<Tire> {
        self.tires.remove(handle.0)
    }

    /// A reference to a tire.
    pub fn tire(&self, handle: TireHandle) -> Option<&Tire> {
        self.tires.get(handle.0)
    }

    /// A mutable reference to a tire.
    pub fn tire_mut(&mut self, handle: TireHandle) -> Option<&mut Tire> {
        self.tires.get_mut(handle.0)
    }

    /// Iterates over the registered tires.
    pub fn tires(&self) -> impl Iterator<Item = (TireHandle, &Tire)> {
        self.tires.iter().map(|(i, t)| (TireHandle(i), t))
    }

    /// Mutably iterates over the registered tires.
    pub fn tires_mut(&mut self) -> impl Iterator<Item = (TireHandle, &mut Tire)> {
        self.tires.iter_mut().map(|(i, t)| (TireHandle(i), t))
    }

    /// Sets the steering angle of a tire, in radians around its pin.
    pub fn set_steer_angle(&mut self, tire: TireHandle, angle: Real) {
        if let Some(t) = self.tires.get_mut(tire.0) {
            t.steer_angle = angle;
        }
    }

    /// Sets the drive torque applied around a tire's axle.
    pub fn set_drive_torque(&mut self, tire: TireHandle, torque: Real) {
        if let Some(t) = self.tires.get_mut(tire.0) {
            t.drive_torque = torque;
        }
    }

    /// Configures a tire's brake: a target angular acceleration (zero means
    /// "stop the wheel") limited by a maximum friction torque.
    pub fn set_brake(&mut self, tire: TireHandle, acceleration: Real, max_friction_torque: Real) {
        if let Some(t) = self.tires.get_mut(tire.0) {
            t.brake_acceleration = acceleration;
            t.brake = max_friction_torque;
        }
    }

    /// Sets the multiplier applied to a tire's dynamic lateral friction.
    pub fn set_lateral_slip_coefficient(&mut self, tire: TireHandle, coefficient: Real) {
        if let Some(t) = self.tires.get_mut(tire.0) {
            t.lateral_slip_coefficient = coefficient;
        }
    }

    /// Sets the multiplier applied to a tire's dynamic longitudinal friction.
    pub fn set_longitudinal_slip_coefficient(&mut self, tire: TireHandle, coefficient: Real) {
        if let Some(t) = self.tires.get_mut(tire.0) {
            t.longitudinal_slip_coefficient = coefficient;
        }
    }

    /// The total normal force carried by a tire during the last step.
    pub fn tire_normal_load(&self, tire: TireHandle) -> Option<Real> {
        self.tire(tire).map(|t| t.normal_load())
    }

    /// The measured lateral slip speed of a tire.
    pub fn tire_lateral_speed(&self, tire: TireHandle) -> Option<Real> {
        self.tire(tire).map(|t| t.lateral_speed())
    }

    /// The measured longitudinal slip speed of a tire.
    pub fn tire_longitudinal_speed(&self, tire: TireHandle) -> Option<Real> {
        self.tire(tire).map(|t| t.longitudinal_speed())
    }

    /// Did the tire touch nothing during the last step?
    pub fn is_tire_airborne(&self, tire: TireHandle) -> Option<bool> {
        self.tire(tire).map(|t| t.is_airborne())
    }

    /// Did the tire lose side grip during the last step?
    pub fn tire_lost_side_grip(&self, tire: TireHandle) -> Option<bool> {
        self.tire(tire).map(|t| t.lost_side_grip())
    }

    /// Did the tire lose traction during the last step?
    pub fn tire_lost_traction(&self, tire: TireHandle) -> Option<bool> {
        self.tire(tire).map(|t| t.lost_traction())
    }

    /// The world-space frame of a tire, including steering and spin.
    pub fn tire_world_matrix(&self, tire: TireHandle) -> Option<Isometry<Real>> {
        self.tire(tire).map(|t| *t.world_matrix())
    }

    /// Advances the vehicle by one step.
    ///
    /// Gathers the current body/tire/contact state, builds the constraint
    /// rows, solves them, writes the resulting forces back to the chassis and
    /// any dynamic ground bodies, and integrates each tire's suspension and
    /// spin state. The embedding loop integrates the rigid bodies afterwards.
    pub fn update(
        &mut self,
        gravity: &Vector<Real>,
        params: &IntegrationParameters,
        bodies: &mut RigidBodySet,
        contacts: &[TireContact],
        handler: &mut dyn VehicleUpdateHandler,
    ) -> Result<(), Error> {
        handler.update_vehicle(self, params.dt);

        let dt = params.dt;
        let inv_dt = params.inv_dt();
        if dt <= 0.0 {
            return Ok(());
        }

        // Chassis snapshot.
        let (ch_pos, ch_com, ch_linvel, ch_angvel, ch_inv_mass, ch_inv_inertia);
        let (ch_ext_force, ch_ext_torque);
        {
            let rb = bodies
                .get(self.chassis)
                .ok_or(Error::InvalidHandle("vehicle chassis"))?;
            if !rb.is_dynamic() || rb.effective_inv_mass() == 0.0 {
                return Err(Error::IllConditionedSystem(
                    "vehicle chassis must be a dynamic body with finite mass",
                ));
            }
            ch_pos = *rb.position();
            ch_com = rb.center_of_mass();
            ch_linvel = *rb.linvel();
            ch_angvel = *rb.angvel();
            ch_inv_mass = rb.effective_inv_mass();
            ch_inv_inertia = rb.effective_world_inv_inertia();
            ch_ext_force = *rb.force() + gravity * rb.mass();
            ch_ext_torque = *rb.torque();
        }

        self.solver.clear();
        let chassis_body = self
            .solver
            .push_body(SolverBody {
                inv_mass: ch_inv_mass,
                inv_inertia: ch_inv_inertia,
                linvel: ch_linvel,
                angvel: ch_angvel,
                ext_force: ch_ext_force,
                ext_torque: ch_ext_torque,
                force: Vector::zeros(),
                torque: Vector::zeros(),
            })
            .expect("fresh solver has body capacity");
        let world_body = self
            .solver
            .push_body(SolverBody {
                inv_mass: 0.0,
                inv_inertia: Matrix::zeros(),
                linvel: Vector::zeros(),
                angvel: Vector::zeros(),
                ext_force: Vector::zeros(),
                ext_torque: Vector::zeros(),
                force: Vector::zeros(),
                torque: Vector::zeros(),
            })
            .expect("fresh solver has body capacity");

        // Tire staging: world frames, solver bodies, per-step state reset.
        let mut stages: ArrayVec<TireStage, MAX_TIRES> = ArrayVec::new();
        for (index, tire) in self.tires.iter_mut() {
            let steer = Rotation::new(*tire.pin() * tire.steer_angle);
            let frame = ch_pos * tire.local_matrix() * Isometry::from_parts(Translation::identity(), steer);
            let front = frame * Vector::x();
            let up = frame * Vector::y();
            let lateral = frame * Vector::z();
            let hard_point = Point::from(frame.translation.vector);
            let dir = -up;
            let center = hard_point + dir * tire.posit;

            let spin = Rotation::new(Vector::z() * tire.spin_angle);
            tire.world_matrix =
                Isometry::from_parts(Translation::from(center.coords), frame.rotation * spin);

            let linvel =
                ch_linvel + ch_angvel.gcross(hard_point - ch_com) + dir * tire.posit_speed;
            let angvel = ch_angvel + lateral * tire.spin_omega;

            let body = self
                .solver
                .push_body(SolverBody {
                    inv_mass: tire.inv_mass(),
                    inv_inertia: Matrix::identity() * tire.inv_inertia(),
                    linvel,
                    angvel,
                    ext_force: gravity * tire.mass(),
                    ext_torque: lateral * tire.drive_torque,
                    force: Vector::zeros(),
                    torque: Vector::zeros(),
                })
                .expect("tire budget is below the solver body budget");

            let compression = tire.suspension_length - tire.posit;
            let spring_estimate =
                tire.suspension_spring * compression - tire.suspension_shock * tire.posit_speed;

            stages.push(TireStage {
                handle: TireHandle(index),
                body,
                hard_point,
                center,
                front,
                lateral,
                up,
                dir,
                prev_normal: tire.normal_load,
                spring_estimate,
            });

            tire.in_contact = false;
            tire.lost_side_grip = false;
            tire.lost_traction = false;
            tire.normal_load = 0.0;
            tire.longitudinal_speed = 0.0;
            tire.lateral_speed = 0.0;
            tire.longitudinal_force = 0.0;
            tire.lateral_force = 0.0;
            tire.longitudinal_limit = 0.0;
            tire.lateral_limit = 0.0;
        }

        // Dynamic ground bodies discovered through the contacts.
        let mut ground: ArrayVec<(RigidBodyHandle, usize), MAX_TIRES> = ArrayVec::new();

        // Row construction.
        for (slot, stage) in stages.iter().enumerate() {
            let slot = slot as u32;
            let (spring, shock, rest_length, posit, tire_mass, brake, brake_accel);
            let (max_long_slip, max_lat_slip, long_coef, lat_coef);
            {
                let tire = self.tires.get(stage.handle.0).expect("staged tire is live");
                spring = tire.suspension_spring;
                shock = tire.suspension_shock;
                rest_length = tire.suspension_length;
                posit = tire.posit;
                tire_mass = tire.mass();
                brake = tire.brake;
                brake_accel = tire.brake_acceleration;
                max_long_slip = tire.max_longitudinal_slip;
                max_lat_slip = tire.max_lateral_slip;
                long_coef = tire.longitudinal_slip_coefficient;
                lat_coef = tire.lateral_slip_coefficient;
            }

            // Linear ties along the front and lateral axes keep the tire on
            // its mounting line; the up axis is governed by the suspension.
            for axis in [stage.front, stage.lateral] {
                let jac0 = Jacobian {
                    linear: axis,
                    angular: (stage.center - ch_com).gcross(axis),
                };
                let jac1 = Jacobian {
                    linear: -axis,
                    angular: Vector::zeros(),
                };
                let jv = self.solver.bodies[chassis_body].velocity_along(&jac0)
                    + self.solver.bodies[stage.body].velocity_along(&jac1);
                let centripetal = ch_angvel
                    .gcross(ch_angvel.gcross(stage.center - ch_com))
                    .dot(&axis);
                self.push_row(SolverRow {
                    jac0,
                    jac1,
                    body0: chassis_body,
                    body1: stage.body,
                    rhs: -jv * inv_dt - centripetal,
                    low: -MAX_BOUND,
                    high: MAX_BOUND,
                    regularizer: 0.0,
                    cfm: 0.0,
                    force: 0.0,
                    kind: RowKind::LinearTie,
                    tire: slot,
                });
            }

            // Suspension: an implicitly discretized spring-damper expressed as
            // a compliant row. Folding the compliance into the row diagonal
            // makes the discrete update `f = ks·x' + kd·vc'` at the end of
            // the step, which keeps `ks·x = load` as the exact static fixed
            // point while staying stable at large stiffness.
            {
                let jac0 = Jacobian {
                    linear: stage.up,
                    angular: (stage.center - ch_com).gcross(stage.up),
                };
                let jac1 = Jacobian {
                    linear: -stage.up,
                    angular: Vector::zeros(),
                };
                let compression = rest_length - posit;
                let jv = self.solver.bodies[chassis_body].velocity_along(&jac0)
                    + self.solver.bodies[stage.body].velocity_along(&jac1);
                let k = shock + dt * spring;
                let k = k.max(1.0e-6);
                self.push_row(SolverRow {
                    jac0,
                    jac1,
                    body0: chassis_body,
                    body1: stage.body,
                    rhs: (spring * compression - k * jv) / (k * dt),
                    low: -MAX_BOUND,
                    high: MAX_BOUND,
                    regularizer: 0.0,
                    cfm: 1.0 / (k * dt),
                    force: 0.0,
                    kind: RowKind::Suspension,
                    tire: slot,
                });
            }

            // Angular ties around the up and front axes: the tire spins
            // freely only around its axle.
            for axis in [stage.up, stage.front] {
                let jac0 = Jacobian {
                    linear: Vector::zeros(),
                    angular: axis,
                };
                let jac1 = Jacobian {
                    linear: Vector::zeros(),
                    angular: -axis,
                };
                let jv = self.solver.bodies[chassis_body].velocity_along(&jac0)
                    + self.solver.bodies[stage.body].velocity_along(&jac1);
                self.push_row(SolverRow {
                    jac0,
                    jac1,
                    body0: chassis_body,
                    body1: stage.body,
                    rhs: -jv * inv_dt,
                    low: -MAX_BOUND,
                    high: MAX_BOUND,
                    regularizer: 0.0,
                    cfm: 0.0,
                    force: 0.0,
                    kind: RowKind::AngularTie,
                    tire: slot,
                });
            }

            // Brake row around the axle, bounded by the brake's friction
            // torque.
            if brake > 0.0 {
                let jac0 = Jacobian {
                    linear: Vector::zeros(),
                    angular: stage.lateral,
                };
                let jac1 = Jacobian {
                    linear: Vector::zeros(),
                    angular: -stage.lateral,
                };
                let jv = self.solver.bodies[chassis_body].velocity_along(&jac0)
                    + self.solver.bodies[stage.body].velocity_along(&jac1);
                let rhs = if brake_accel != 0.0 {
                    brake_accel
                } else {
                    -jv * inv_dt
                };
                self.push_row(SolverRow {
                    jac0,
                    jac1,
                    body0: chassis_body,
                    body1: stage.body,
                    rhs,
                    low: -brake,
                    high: brake,
                    regularizer: 0.0,
                    cfm: 0.0,
                    force: 0.0,
                    kind: RowKind::Brake,
                    tire: slot,
                });
            }

            // Contact rows.
            for contact in contacts.iter().filter(|c| c.tire == stage.handle) {
                let Some(normal) = contact.normal.try_normalize(1.0e-6) else {
                    log::debug!("vehicle: skipping contact with a degenerate normal");
                    continue;
                };

                let (other_body, other_com, heavy) = match contact.body {
                    None => (world_body, contact.point, true),
                    Some(handle) => match bodies.get(handle) {
                        None => {
                            log::debug!("vehicle: skipping contact with a dead body handle");
                            continue;
                        }
                        Some(rb) if !rb.is_dynamic() => (world_body, contact.point, true),
                        Some(rb) => {
                            let staged = ground.iter().find(|(h, _)| *h == handle).map(|(_, i)| *i);
                            let idx = match staged {
                                Some(idx) => idx,
                                None if !ground.is_full() => {
                                    let body = SolverBody {
                                        inv_mass: rb.effective_inv_mass(),
                                        inv_inertia: rb.effective_world_inv_inertia(),
                                        linvel: *rb.linvel(),
                                        angvel: *rb.angvel(),
                                        ext_force: *rb.force() + gravity * rb.mass(),
                                        ext_torque: *rb.torque(),
                                        force: Vector::zeros(),
                                        torque: Vector::zeros(),
                                    };
                                    match self.solver.push_body(body) {
                                        Some(idx) => {
                                            ground.push((handle, idx));
                                            idx
                                        }
                                        None => world_body,
                                    }
                                }
                                None => {
                                    log::debug!(
                                        "vehicle: ground body budget reached, \
                                         treating contact as static"
                                    );
                                    world_body
                                }
                            };
                            let heavy = rb.mass() > tire_mass * HEAVY_MASS_RATIO;
                            (idx, rb.center_of_mass(), heavy)
                        }
                    },
                };

                // Normal row: non-negative force, Baumgarte-stabilized.
                let r_tire = contact.point - stage.center;
                let r_other = contact.point - other_com;
                let jac0 = Jacobian {
                    linear: normal,
                    angular: r_tire.gcross(normal),
                };
                let jac1 = Jacobian {
                    linear: -normal,
                    angular: -(r_other.gcross(normal)),
                };
                let jv = self.solver.bodies[stage.body].velocity_along(&jac0)
                    + self.solver.bodies[other_body].velocity_along(&jac1);
                let pen = (contact.penetration - params.allowed_linear_error).max(0.0);
                let v_bias = (params.erp * pen * inv_dt).min(params.max_corrective_velocity);
                let regularizer = if heavy { CONTACT_SLIP } else { 0.0 };
                self.push_row(SolverRow {
                    jac0,
                    jac1,
                    body0: stage.body,
                    body1: other_body,
                    rhs: (v_bias - jv) * inv_dt,
                    low: 0.0,
                    high: MAX_BOUND,
                    regularizer,
                    cfm: 0.0,
                    force: 0.0,
                    kind: RowKind::Normal,
                    tire: slot,
                });

                if let Some(tire) = self.tires.get_mut(stage.handle.0) {
                    tire.in_contact = true;
                }

                // Friction rows exist only under an estimated positive load.
                let load = if stage.prev_normal > 0.0 {
                    stage.prev_normal
                } else {
                    (stage.spring_estimate + tire_mass * (-gravity.dot(&normal)).max(0.0)).max(0.0)
                };
                if load <= 0.0 {
                    continue;
                }

                // Contact-plane projection of the tire's axle, falling back
                // to an arbitrary tangent when the axle is parallel to the
                // normal.
                let axle = stage.lateral - normal * stage.lateral.dot(&normal);
                let axle = axle
                    .try_normalize(1.0e-5)
                    .unwrap_or_else(|| normal.orthonormal_basis()[0]);
                let forward = normal.gcross(axle);

                let v_tire = self.solver.bodies[stage.body].linvel
                    + self.solver.bodies[stage.body].angvel.gcross(r_tire);
                let v_other = self.solver.bodies[other_body].linvel
                    + self.solver.bodies[other_body].angvel.gcross(r_other);
                let rel = v_tire - v_other;
                let long_slip = rel.dot(&forward);
                let lat_slip = rel.dot(&axle);

                // Simple static/kinetic friction model: static coefficients
                // below the per-tire slip threshold, dynamic above it.
                let sliding_long = long_slip.abs() > max_long_slip;
                let mu_long = if sliding_long {
                    contact.dynamic_friction_longitudinal * long_coef
                } else {
                    contact.static_friction_longitudinal
                };
                let sliding_lat = lat_slip.abs() > max_lat_slip;
                let mu_lat = if sliding_lat {
                    contact.dynamic_friction_lateral * lat_coef
                } else {
                    contact.static_friction_lateral
                };

                let long_limit = load * mu_long;
                let lat_limit = load * mu_lat;

                for (dir, limit, jvel, kind) in [
                    (forward, long_limit, long_slip, RowKind::FrictionLongitudinal),
                    (axle, lat_limit, lat_slip, RowKind::FrictionLateral),
                ] {
                    if limit <= 0.0 {
                        continue;
                    }
                    let jac0 = Jacobian {
                        linear: dir,
                        angular: r_tire.gcross(dir),
                    };
                    let jac1 = Jacobian {
                        linear: -dir,
                        angular: -(r_other.gcross(dir)),
                    };
                    self.push_row(SolverRow {
                        jac0,
                        jac1,
                        body0: stage.body,
                        body1: other_body,
                        rhs: -jvel * inv_dt,
                        low: -limit,
                        high: limit,
                        regularizer,
                        cfm: 0.0,
                        force: 0.0,
                        kind,
                        tire: slot,
                    });
                }

                if let Some(tire) = self.tires.get_mut(stage.handle.0) {
                    tire.longitudinal_speed = long_slip;
                    tire.lateral_speed = lat_slip;
                    tire.longitudinal_limit = long_limit;
                    tire.lateral_limit = lat_limit;
                    tire.lost_traction = sliding_long;
                    tire.lost_side_grip = sliding_lat;
                }
            }
        }

        self.solver.solve();

        // Chassis and ground writeback.
        if let Some(rb) = bodies.get_mut(self.chassis) {
            rb.add_force(self.solver.bodies[chassis_body].force);
            rb.add_torque(self.solver.bodies[chassis_body].torque);
        }
        for (handle, idx) in &ground {
            if let Some(rb) = bodies.get_mut(*handle) {
                rb.add_force(self.solver.bodies[*idx].force);
                rb.add_torque(self.solver.bodies[*idx].torque);
            }
        }

        // Per-tire telemetry gathered from the solved rows.
        let mut normal_acc = [0.0 as Real; MAX_TIRES];
        let mut long_acc = [0.0 as Real; MAX_TIRES];
        let mut lat_acc = [0.0 as Real; MAX_TIRES];
        for row in &self.solver.rows {
            if row.tire == NO_TIRE {
                continue;
            }
            let slot = row.tire as usize;
            match row.kind {
                RowKind::Normal => normal_acc[slot] += row.force,
                RowKind::FrictionLongitudinal => long_acc[slot] += row.force,
                RowKind::FrictionLateral => lat_acc[slot] += row.force,
                _ => {}
            }
        }

        // Tire 1-DOF integration: suspension coordinate and spin, both
        // semi-implicit.
        let ch = &self.solver.bodies[chassis_body];
        let a_ch_lin = (ch.force + ch.ext_force) * ch_inv_mass;
        let a_ch_ang = ch_inv_inertia * (ch.torque + ch.ext_torque);

        for (slot, stage) in stages.iter().enumerate() {
            let body = &self.solver.bodies[stage.body];
            let tire = self.tires.get_mut(stage.handle.0).expect("staged tire is live");

            tire.force = body.force;
            tire.torque = body.torque;
            tire.normal_load = normal_acc[slot];
            tire.longitudinal_force = long_acc[slot];
            tire.lateral_force = lat_acc[slot];

            let a_tire = (body.force + body.ext_force) * tire.inv_mass();
            let r = stage.hard_point - ch_com;
            let a_hard = a_ch_lin + a_ch_ang.gcross(r) + ch_angvel.gcross(ch_angvel.gcross(r));

            tire.posit_speed += (a_tire - a_hard).dot(&stage.dir) * dt;
            tire.posit += tire.posit_speed * dt;
            if tire.posit < 0.0 {
                // Hard stop at full compression.
                tire.posit = 0.0;
                tire.posit_speed = 0.0;
            } else if tire.posit > tire.suspension_length {
                tire.posit = tire.suspension_length;
                tire.posit_speed = 0.0;
            }

            let spin_accel =
                (body.torque + body.ext_torque).dot(&stage.lateral) * tire.inv_inertia();
            tire.spin_omega += spin_accel * dt;
            let max_omega = MAX_SURFACE_SPEED / tire.radius();
            tire.spin_omega = tire.spin_omega.clamp(-max_omega, max_omega);
            tire.spin_angle =
                (tire.spin_angle + tire.spin_omega * dt) % (std::f64::consts::TAU as Real);
        }

        Ok(())
    }

    /// Pushes a row, logging instead of failing once the fixed row budget is
    /// reached: the solve then runs with the rows that fit.
    fn push_row(&mut self, row: SolverRow) {
        if !self.solver.push_row(row) {
            log::debug!("vehicle: row budget reached, dropping a constraint row");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dynamics::{MassProperties, RigidBody};
    use approx::assert_relative_eq;

    const G: Real = 9.8;

    struct TestWorld {
        bodies: RigidBodySet,
        vehicle: VehicleConstraint,
        params: IntegrationParameters,
        gravity: Vector<Real>,
        plane_y: Real,
        friction: Real,
    }

    fn make_world(
        chassis_mass: Real,
        wheel_offsets: &[Vector<Real>],
        tire_mass: Real,
        spring: Real,
        shock: Real,
        radius: Real,
    ) -> TestWorld {
        let mut bodies = RigidBodySet::new();
        let inertia = Vector::repeat(chassis_mass);
        let mprops = MassProperties::new(Point::origin(), chassis_mass, inertia);
        let chassis = bodies.insert(RigidBody::new_dynamic(Isometry::identity(), mprops));

        let mut vehicle = VehicleConstraint::new(chassis, Vector::y());
        for off in wheel_offsets {
            let mut desc = TireDesc::new(Isometry::translation(off.x, off.y, off.z));
            desc.mass = tire_mass;
            desc.radius = radius;
            desc.suspension_spring = spring;
            desc.suspension_shock = shock;
            desc.suspension_length = 0.25;
            vehicle.add_tire(&desc).unwrap();
        }

        // The ground plane touches the tires at full suspension droop.
        let plane_y = wheel_offsets[0].y - 0.25 - radius;

        TestWorld {
            bodies,
            vehicle,
            params: IntegrationParameters::default(),
            gravity: Vector::new(0.0, -G, 0.0),
            plane_y,
            friction: 1.0,
        }
    }

    /// Fabricates the tire/plane contacts a collision pipeline would report.
    fn ground_contacts(w: &TestWorld) -> Vec<TireContact> {
        let ch_pos = *w.bodies[w.vehicle.chassis()].position();
        let mut out = Vec::new();
        for (handle, tire) in w.vehicle.tires() {
            let frame = ch_pos * tire.local_matrix();
            let up = frame * Vector::y();
            let hard = Point::from(frame.translation.vector);
            let center = hard - up * tire.suspension_posit();
            let bottom = center.y - tire.radius();
            let pen = w.plane_y - bottom;
            if pen > -1.0e-3 {
                let point = Point::new(center.x, w.plane_y, center.z);
                out.push(TireContact::new(
                    handle,
                    point,
                    Vector::y(),
                    pen.max(0.0),
                    w.friction,
                ));
            }
        }
        out
    }

    fn step(w: &mut TestWorld, steps: usize) {
        for _ in 0..steps {
            let handles: Vec<_> = w.bodies.iter().map(|(h, _)| h).collect();
            for &h in &handles {
                w.bodies[h].reset_forces();
            }

            let contacts = ground_contacts(w);
            let gravity = w.gravity;
            w.vehicle
                .update(&gravity, &w.params, &mut w.bodies, &contacts, &mut ())
                .unwrap();

            for (_, rb) in w.bodies.iter_mut() {
                rb.integrate(w.params.dt, &gravity);
            }
        }
    }

    #[test]
    fn static_equilibrium_matches_spring_preload() {
        // A 20 kg load on one wheel: at steady state the suspension
        // compression must satisfy ks·x ≈ m·g.
        let mut w = make_world(
            20.0,
            &[Vector::new(0.0, -0.2, 0.0)],
            1.0,
            50_000.0,
            4_000.0,
            0.3,
        );
        step(&mut w, 3000);

        let (handle, tire) = w.vehicle.tires().next().unwrap();
        let compression = tire.suspension_compression();
        assert_relative_eq!(50_000.0 * compression, 20.0 * G, max_relative = 0.05);
        assert!(!w.vehicle.is_tire_airborne(handle).unwrap());

        // Force balance at the fixed point: the constraint forces written to
        // the chassis cancel gravity.
        let handles: Vec<_> = w.bodies.iter().map(|(h, _)| h).collect();
        for &h in &handles {
            w.bodies[h].reset_forces();
        }
        let contacts = ground_contacts(&w);
        let gravity = w.gravity;
        w.vehicle
            .update(&gravity, &w.params, &mut w.bodies, &contacts, &mut ())
            .unwrap();
        let chassis_force = *w.bodies[w.vehicle.chassis()].force();
        assert_relative_eq!(chassis_force.y, 20.0 * G, max_relative = 0.05);

        // Steady state is a fixed point: further steps with zero input change
        // leave the configuration in place.
        let posit_before = w.vehicle.tires().next().unwrap().1.suspension_posit();
        let chassis_y_before = w.bodies[w.vehicle.chassis()].position().translation.y;
        step(&mut w, 50);
        let posit_after = w.vehicle.tires().next().unwrap().1.suspension_posit();
        let chassis_y_after = w.bodies[w.vehicle.chassis()].position().translation.y;
        assert!((posit_after - posit_before).abs() < 1.0e-3);
        assert!((chassis_y_after - chassis_y_before).abs() < 1.0e-3);
    }

    fn four_wheel_offsets() -> Vec<Vector<Real>> {
        vec![
            Vector::new(1.0, -0.2, 0.6),
            Vector::new(1.0, -0.2, -0.6),
            Vector::new(-1.0, -0.2, 0.6),
            Vector::new(-1.0, -0.2, -0.6),
        ]
    }

    #[test]
    fn no_creep_on_flat_ground() {
        // Zero input, flat ground, full friction: friction forces stay at
        // zero instead of making the vehicle creep.
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        step(&mut w, 2400);

        assert!(w.bodies[w.vehicle.chassis()].linvel().norm() < 1.0e-2);
        for (_, tire) in w.vehicle.tires() {
            let load = tire.normal_load();
            assert!(load > 0.0);
            assert!(tire.longitudinal_force().abs() < load * 5.0e-3);
            assert!(tire.lateral_force().abs() < load * 5.0e-3);
        }
    }

    #[test]
    fn incline_sliding_saturates_friction() {
        // 45° incline with µ = 0.3 < tan(45°): the vehicle must slide, with
        // every longitudinal friction row clipped exactly at its bound.
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        w.friction = 0.3;
        step(&mut w, 1200);

        // Tilting gravity is equivalent to tilting the plane.
        let a = std::f32::consts::FRAC_PI_4 as Real;
        w.gravity = Vector::new(G * a.sin(), -G * a.cos(), 0.0);
        step(&mut w, 30);

        // The chassis accelerates down the slope.
        assert!(w.bodies[w.vehicle.chassis()].linvel().x > 0.1);

        for (_, tire) in w.vehicle.tires() {
            let limit = tire.longitudinal_limit();
            assert!(limit > 0.0);
            // Saturated exactly at the friction-cone bound.
            assert_relative_eq!(tire.longitudinal_force().abs(), limit, max_relative = 1.0e-3);
            // The friction-cone bounds hold on both axes.
            assert!(tire.longitudinal_force().abs() <= limit * (1.0 + 1.0e-4));
            assert!(tire.lateral_force().abs() <= tire.lateral_limit() * (1.0 + 1.0e-4) + 1.0e-6);
        }
    }

    #[test]
    fn airborne_wheels_report_no_load() {
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        // Lift the plane away so nothing touches.
        w.plane_y = -100.0;
        step(&mut w, 2);

        for (handle, tire) in w.vehicle.tires() {
            assert!(w.vehicle.is_tire_airborne(handle).unwrap());
            assert_eq!(tire.normal_load(), 0.0);
        }
    }

    #[test]
    fn tire_budget_is_a_checked_error() {
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        for _ in w.vehicle.num_tires()..MAX_TIRES {
            let desc = TireDesc::new(Isometry::translation(0.0, -0.2, 0.0));
            w.vehicle.add_tire(&desc).unwrap();
        }
        let desc = TireDesc::new(Isometry::translation(0.0, -0.2, 0.0));
        assert!(matches!(
            w.vehicle.add_tire(&desc),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn removed_tires_stop_resolving() {
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        let (handle, _) = w.vehicle.tires().next().unwrap();
        assert!(w.vehicle.remove_tire(handle).is_some());
        assert!(w.vehicle.remove_tire(handle).is_none());
        assert!(w.vehicle.tire(handle).is_none());
        assert_eq!(w.vehicle.num_tires(), 3);
        step(&mut w, 5);

        // A contact that names the dead tire is ignored, not a crash.
        let stale = TireContact::new(handle, Point::origin(), Vector::y(), 0.0, 1.0);
        let gravity = w.gravity;
        w.vehicle
            .update(&gravity, &w.params, &mut w.bodies, &[stale], &mut ())
            .unwrap();
    }

    struct Throttle {
        torque: Real,
        calls: usize,
    }

    impl VehicleUpdateHandler for Throttle {
        fn update_vehicle(&mut self, vehicle: &mut VehicleConstraint, _dt: Real) {
            self.calls += 1;
            let handles: Vec<_> = vehicle.tires().map(|(h, _)| h).collect();
            for h in handles {
                vehicle.set_drive_torque(h, self.torque);
            }
        }
    }

    #[test]
    fn update_handler_sets_per_step_inputs() {
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        let mut throttle = Throttle {
            torque: -120.0,
            calls: 0,
        };

        let contacts = ground_contacts(&w);
        let gravity = w.gravity;
        w.vehicle
            .update(&gravity, &w.params, &mut w.bodies, &contacts, &mut throttle)
            .unwrap();

        assert_eq!(throttle.calls, 1);
        for (_, tire) in w.vehicle.tires() {
            assert_eq!(tire.drive_torque, -120.0);
        }
    }

    #[test]
    fn invalid_chassis_is_reported() {
        let mut w = make_world(800.0, &four_wheel_offsets(), 15.0, 60_000.0, 3_000.0, 0.35);
        let chassis = w.vehicle.chassis();
        w.bodies.remove(chassis);
        let gravity = w.gravity;
        let err = w
            .vehicle
            .update(&gravity, &w.params, &mut w.bodies, &[], &mut ())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
    }

    #[test]
    fn fixed_chassis_is_reported() {
        let mut bodies = RigidBodySet::new();
        let chassis = bodies.insert(RigidBody::new_fixed(Isometry::identity()));
        let mut vehicle = VehicleConstraint::new(chassis, Vector::y());
        let err = vehicle
            .update(
                &Vector::new(0.0, -G, 0.0),
                &IntegrationParameters::default(),
                &mut bodies,
                &[],
                &mut (),
            )
            .unwrap_err();
        assert!(matches!(err, Error::IllConditionedSystem(_)));
    }
}
