//! The per-vehicle constraint force solver.
//!
//! Rows are rebuilt from scratch every step: each scalar constraint carries a
//! pair of 6-component Jacobian blocks (one per body touched), a target
//! relative acceleration, a diagonal regularization/compliance term, and box
//! bounds on its force. The resulting system is solved by a projected
//! conjugate-residual iteration: the `J·M⁻¹·Jᵗ` product is formed
//! matrix-free by scattering the search direction into per-body
//! delta-velocity accumulators, steps are clipped exactly at the first
//! violated bound, the violating row leaves the active working set, and the
//! search restarts from the preconditioned residual. Termination is
//! bounded-iteration, not bounded-error: callers must tolerate approximate
//! convergence under tight pass budgets.

use crate::math::{Matrix, Real, Vector};
use crate::utils::WDot;
use arrayvec::ArrayVec;

/// The maximum number of tires a vehicle can carry.
pub const MAX_TIRES: usize = 16;

/// The maximum number of simultaneous constraint rows of one vehicle solve.
pub const MAX_DOF: usize = 128;

/// Chassis + static environment + tires + newly discovered ground bodies.
pub(crate) const MAX_BODIES: usize = 2 + 2 * MAX_TIRES;

/// Relative inflation of the preconditioner diagonal.
const DIAG_DAMP: Real = 1.0e-4;

/// Residual infinity-norm below which the iteration stops.
const FREEZE_MAG: Real = 1.0e-2;

/// Stand-in for an unbounded constraint force.
pub(crate) const MAX_BOUND: Real = 1.0e15;

pub(crate) const NO_TIRE: u32 = crate::INVALID_U32;

/// Which constraint a row implements; used to route solved forces back into
/// per-tire telemetry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RowKind {
    LinearTie,
    Suspension,
    AngularTie,
    Brake,
    Normal,
    FrictionLongitudinal,
    FrictionLateral,
}

/// One half of a constraint row: the linear and angular blocks applied to a
/// single body.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Jacobian {
    pub linear: Vector<Real>,
    pub angular: Vector<Real>,
}

/// Velocity-level state of one body participating in a solve.
#[derive(Clone, Debug)]
pub(crate) struct SolverBody {
    pub inv_mass: Real,
    pub inv_inertia: Matrix<Real>,
    pub linvel: Vector<Real>,
    pub angvel: Vector<Real>,
    /// External force already known before the solve (gravity, engine, ...).
    pub ext_force: Vector<Real>,
    pub ext_torque: Vector<Real>,
    /// Output: constraint force accumulated by the solve.
    pub force: Vector<Real>,
    pub torque: Vector<Real>,
}

impl SolverBody {
    /// `J · v` contribution of this body.
    pub fn velocity_along(&self, j: &Jacobian) -> Real {
        j.linear.gdot(self.linvel) + j.angular.gdot(self.angvel)
    }
}

/// A single scalar constraint row.
#[derive(Clone, Debug)]
pub(crate) struct SolverRow {
    pub jac0: Jacobian,
    pub jac1: Jacobian,
    pub body0: usize,
    pub body1: usize,
    /// Desired relative acceleration along the row.
    pub rhs: Real,
    pub low: Real,
    pub high: Real,
    /// Extra relative regularization on top of [`DIAG_DAMP`].
    pub regularizer: Real,
    /// Absolute compliance added to the row diagonal, in acceleration per
    /// unit force. Non-zero for soft rows such as the suspension spring.
    pub cfm: Real,
    pub force: Real,
    pub kind: RowKind,
    /// Stage index of the owning tire, [`NO_TIRE`] if none.
    pub tire: u32,
}

#[derive(Clone, Copy)]
struct RowScratch {
    jinv0: Jacobian,
    jinv1: Jacobian,
    diag: Real,
    reg: Real,
    rhs_net: Real,
}

/// The fixed-capacity workspace of one vehicle solve.
pub(crate) struct ForceMiniSolver {
    pub bodies: ArrayVec<SolverBody, MAX_BODIES>,
    pub rows: ArrayVec<SolverRow, MAX_DOF>,
}

impl ForceMiniSolver {
    pub fn new() -> Self {
        Self {
            bodies: ArrayVec::new(),
            rows: ArrayVec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.bodies.clear();
        self.rows.clear();
    }

    /// Registers a body; `None` once the per-solve body budget is exhausted.
    pub fn push_body(&mut self, body: SolverBody) -> Option<usize> {
        let id = self.bodies.len();
        self.bodies.try_push(body).ok().map(|_| id)
    }

    /// Registers a row; `false` once the row budget is exhausted.
    pub fn push_row(&mut self, row: SolverRow) -> bool {
        self.rows.try_push(row).is_ok()
    }

    /// Runs the projected conjugate-residual iteration and scatters the
    /// solved forces into the per-body accumulators.
    pub fn solve(&mut self) {
        let n = self.rows.len();
        if n == 0 {
            return;
        }

        // System assembly: M⁻¹-scaled Jacobians, preconditioner diagonal, and
        // the right-hand side minus each body's known external acceleration.
        let mut scratch: ArrayVec<RowScratch, MAX_DOF> = ArrayVec::new();
        for row in &self.rows {
            let b0 = &self.bodies[row.body0];
            let b1 = &self.bodies[row.body1];
            let jinv0 = Jacobian {
                linear: row.jac0.linear * b0.inv_mass,
                angular: b0.inv_inertia * row.jac0.angular,
            };
            let jinv1 = Jacobian {
                linear: row.jac1.linear * b1.inv_mass,
                angular: b1.inv_inertia * row.jac1.angular,
            };

            let diag_raw = row.jac0.linear.dot(&jinv0.linear)
                + row.jac0.angular.dot(&jinv0.angular)
                + row.jac1.linear.dot(&jinv1.linear)
                + row.jac1.angular.dot(&jinv1.angular);
            let reg = diag_raw * (DIAG_DAMP + row.regularizer) + row.cfm;
            let diag = diag_raw + reg;

            let ext_accel = jinv0.linear.dot(&b0.ext_force)
                + jinv0.angular.dot(&b0.ext_torque)
                + jinv1.linear.dot(&b1.ext_force)
                + jinv1.angular.dot(&b1.ext_torque);

            scratch.push(RowScratch {
                jinv0,
                jinv1,
                diag,
                reg,
                rhs_net: row.rhs - ext_accel,
            });
        }

        let mut force = [0.0 as Real; MAX_DOF];
        let mut active = [false; MAX_DOF];
        let mut active_count = 0;
        for (i, _row) in self.rows.iter().enumerate() {
            if scratch[i].diag > 1.0e-12 {
                active[i] = true;
                active_count += 1;
            }
        }

        if active_count > 0 {
            self.iterate(&scratch, &mut force, &mut active, active_count);
        }

        // Force distribution: each row's final scalar force scatters back
        // through its Jacobian into the per-body accumulators.
        for (i, row) in self.rows.iter_mut().enumerate() {
            row.force = force[i];
            let f = force[i];
            if f != 0.0 {
                let b0 = &mut self.bodies[row.body0];
                b0.force += row.jac0.linear * f;
                b0.torque += row.jac0.angular * f;
                let b1 = &mut self.bodies[row.body1];
                b1.force += row.jac1.linear * f;
                b1.torque += row.jac1.angular * f;
            }
        }
    }

    /// The projected conjugate-residual loop with active-set clipping.
    fn iterate(
        &self,
        scratch: &ArrayVec<RowScratch, MAX_DOF>,
        force: &mut [Real; MAX_DOF],
        active: &mut [bool; MAX_DOF],
        mut active_count: usize,
    ) {
        let n = self.rows.len();

        let mut r = [0.0 as Real; MAX_DOF];
        let mut r_old = [0.0 as Real; MAX_DOF];
        let mut z = [0.0 as Real; MAX_DOF];
        let mut d = [0.0 as Real; MAX_DOF];
        let mut q = [0.0 as Real; MAX_DOF];

        // Forces start from zero, so the initial residual is the net rhs.
        for i in 0..n {
            r[i] = if active[i] { scratch[i].rhs_net } else { 0.0 };
        }

        let max_passes = 6 + (active_count as Real).sqrt() as usize;
        let mut restart = true;
        let mut rz = 0.0;

        for _pass in 0..max_passes {
            let r_inf = (0..n)
                .filter(|&i| active[i])
                .fold(0.0 as Real, |m, i| m.max(r[i].abs()));
            if r_inf < FREEZE_MAG {
                break;
            }

            if restart {
                // Steepest-descent restart from the preconditioned residual.
                rz = 0.0;
                for i in 0..n {
                    if active[i] {
                        z[i] = r[i] / scratch[i].diag;
                        d[i] = z[i];
                        rz += r[i] * z[i];
                    } else {
                        z[i] = 0.0;
                        d[i] = 0.0;
                    }
                }
                restart = false;
            }

            self.apply(scratch, &d, &mut q);
            let mut dq = 0.0;
            for i in 0..n {
                if active[i] {
                    dq += d[i] * q[i];
                }
            }
            if dq <= 1.0e-12 {
                log::debug!("vehicle solver: conjugate direction collapsed");
                break;
            }
            let alpha = rz / dq;

            // Clip the step at the first violated box bound.
            let mut step = alpha;
            let mut clipped = None;
            for i in 0..n {
                if !active[i] || d[i] == 0.0 {
                    continue;
                }
                let row = &self.rows[i];
                let target = force[i] + step * d[i];
                if d[i] > 0.0 && target > row.high {
                    step = (row.high - force[i]) / d[i];
                    clipped = Some(i);
                } else if d[i] < 0.0 && target < row.low {
                    step = (row.low - force[i]) / d[i];
                    clipped = Some(i);
                }
            }
            let step = step.max(0.0);

            for i in 0..n {
                if active[i] {
                    force[i] += step * d[i];
                }
            }

            if let Some(k) = clipped {
                // Freeze the clipped row exactly at its bound, drop it from
                // the working set, and restart from the updated residual.
                let row = &self.rows[k];
                force[k] = if d[k] > 0.0 { row.high } else { row.low };
                active[k] = false;
                active_count -= 1;
                if active_count == 0 {
                    break;
                }

                self.apply(scratch, force, &mut q);
                for i in 0..n {
                    r[i] = if active[i] { scratch[i].rhs_net - q[i] } else { 0.0 };
                }
                restart = true;
            } else {
                r_old = r;
                for i in 0..n {
                    if active[i] {
                        r[i] -= alpha * q[i];
                    }
                }

                // Polak–Ribière conjugate direction update.
                let mut rz_new = 0.0;
                let mut beta_num = 0.0;
                for i in 0..n {
                    if active[i] {
                        z[i] = r[i] / scratch[i].diag;
                        rz_new += r[i] * z[i];
                        beta_num += z[i] * (r[i] - r_old[i]);
                    }
                }
                let beta = (beta_num / rz).max(0.0);
                for i in 0..n {
                    if active[i] {
                        d[i] = z[i] + beta * d[i];
                    }
                }
                rz = rz_new;
            }
        }
    }

    /// Matrix-free `(J·M⁻¹·Jᵗ + reg)·x`: scatters `x` into per-body
    /// delta-velocity accumulators, then gathers back through each row's
    /// Jacobian, without ever materializing the dense matrix.
    fn apply(
        &self,
        scratch: &ArrayVec<RowScratch, MAX_DOF>,
        x: &[Real; MAX_DOF],
        out: &mut [Real; MAX_DOF],
    ) {
        let mut dv: ArrayVec<(Vector<Real>, Vector<Real>), MAX_BODIES> = self
            .bodies
            .iter()
            .map(|_| (Vector::zeros(), Vector::zeros()))
            .collect();

        for (i, row) in self.rows.iter().enumerate() {
            let xi = x[i];
            if xi != 0.0 {
                let s = &scratch[i];
                dv[row.body0].0 += s.jinv0.linear * xi;
                dv[row.body0].1 += s.jinv0.angular * xi;
                dv[row.body1].0 += s.jinv1.linear * xi;
                dv[row.body1].1 += s.jinv1.angular * xi;
            }
        }

        for (i, row) in self.rows.iter().enumerate() {
            let (lin0, ang0) = &dv[row.body0];
            let (lin1, ang1) = &dv[row.body1];
            out[i] = row.jac0.linear.dot(lin0)
                + row.jac0.angular.dot(ang0)
                + row.jac1.linear.dot(lin1)
                + row.jac1.angular.dot(ang1)
                + scratch[i].reg * x[i];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_body() -> SolverBody {
        SolverBody {
            inv_mass: 1.0,
            inv_inertia: Matrix::identity(),
            linvel: Vector::zeros(),
            angvel: Vector::zeros(),
            ext_force: Vector::zeros(),
            ext_torque: Vector::zeros(),
            force: Vector::zeros(),
            torque: Vector::zeros(),
        }
    }

    fn static_body() -> SolverBody {
        SolverBody {
            inv_mass: 0.0,
            inv_inertia: Matrix::zeros(),
            ..unit_body()
        }
    }

    fn row(
        body0: usize,
        body1: usize,
        dir: Vector<Real>,
        rhs: Real,
        low: Real,
        high: Real,
    ) -> SolverRow {
        SolverRow {
            jac0: Jacobian {
                linear: dir,
                angular: Vector::zeros(),
            },
            jac1: Jacobian {
                linear: -dir,
                angular: Vector::zeros(),
            },
            body0,
            body1,
            rhs,
            low,
            high,
            regularizer: 0.0,
            cfm: 0.0,
            force: 0.0,
            kind: RowKind::LinearTie,
            tire: NO_TIRE,
        }
    }

    #[test]
    fn single_bilateral_row_reaches_target() {
        let mut solver = ForceMiniSolver::new();
        let b0 = solver.push_body(unit_body()).unwrap();
        let b1 = solver.push_body(static_body()).unwrap();
        solver.push_row(row(b0, b1, Vector::y(), 10.0, -MAX_BOUND, MAX_BOUND));
        solver.solve();

        // Unit mass: the force equals the requested acceleration.
        assert_relative_eq!(solver.rows[0].force, 10.0, epsilon = 1.0e-2);
        assert_relative_eq!(solver.bodies[b0].force.y, 10.0, epsilon = 1.0e-2);
        assert_relative_eq!(solver.bodies[b1].force.y, -10.0, epsilon = 1.0e-2);
    }

    #[test]
    fn bound_clipping_is_exact() {
        let mut solver = ForceMiniSolver::new();
        let b0 = solver.push_body(unit_body()).unwrap();
        let b1 = solver.push_body(static_body()).unwrap();
        solver.push_row(row(b0, b1, Vector::y(), 10.0, -2.0, 2.0));
        solver.solve();

        assert_eq!(solver.rows[0].force, 2.0);
    }

    #[test]
    fn external_acceleration_is_subtracted() {
        // Gravity on the free body must be cancelled by a unilateral row.
        let mut solver = ForceMiniSolver::new();
        let mut falling = unit_body();
        falling.ext_force = Vector::new(0.0, -9.8, 0.0);
        let b0 = solver.push_body(falling).unwrap();
        let b1 = solver.push_body(static_body()).unwrap();
        solver.push_row(row(b0, b1, Vector::y(), 0.0, 0.0, MAX_BOUND));
        solver.solve();

        assert_relative_eq!(solver.rows[0].force, 9.8, epsilon = 1.0e-2);
        let total = solver.bodies[b0].force.y + solver.bodies[b0].ext_force.y;
        assert!(total.abs() < 1.0e-2);
    }

    #[test]
    fn compliant_row_settles_at_the_spring_force() {
        // A soft row with compliance γ and rhs γ·f* must solve to exactly f*
        // when nothing else constrains the body pair.
        let mut solver = ForceMiniSolver::new();
        let b0 = solver.push_body(static_body()).unwrap();
        let b1 = solver.push_body(static_body()).unwrap();
        let mut soft = row(b0, b1, Vector::y(), 0.0, -MAX_BOUND, MAX_BOUND);
        soft.cfm = 0.5;
        soft.rhs = 0.5 * 42.0;
        solver.push_row(soft);
        solver.solve();

        assert_relative_eq!(solver.rows[0].force, 42.0, epsilon = 1.0e-3);
    }

    #[test]
    fn coupled_rows_converge() {
        // Two orthogonal constraints on the same body are solved together.
        let mut solver = ForceMiniSolver::new();
        let mut body = unit_body();
        body.ext_force = Vector::new(3.0, -7.0, 0.0);
        let b0 = solver.push_body(body).unwrap();
        let b1 = solver.push_body(static_body()).unwrap();
        solver.push_row(row(b0, b1, Vector::x(), 0.0, -MAX_BOUND, MAX_BOUND));
        solver.push_row(row(b0, b1, Vector::y(), 0.0, -MAX_BOUND, MAX_BOUND));
        solver.solve();

        let net = solver.bodies[b0].force + solver.bodies[b0].ext_force;
        assert!(net.norm() < 1.0e-2);
    }
}
