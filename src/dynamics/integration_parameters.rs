//! Parameters for a time-step of the solver.

use crate::math::Real;

/// Parameters controlling one simulation step.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct IntegrationParameters {
    /// The timestep length (default: `1.0 / 60.0`).
    pub dt: Real,
    /// The fraction of the current penetration fed back as a corrective
    /// contact velocity each step (default: `0.3`).
    ///
    /// Larger values remove penetration faster at the cost of potential
    /// jitter from overshooting.
    pub erp: Real,
    /// Amount of penetration the solver won't attempt to correct
    /// (default: `0.001`).
    pub allowed_linear_error: Real,
    /// Maximum penetration-correction velocity the solver will inject in one
    /// timestep (default: `10.0`).
    pub max_corrective_velocity: Real,
}

impl IntegrationParameters {
    /// The inverse of the time-stepping length, i.e. the steps per second (Hz).
    ///
    /// This is zero if `self.dt` is zero.
    #[inline(always)]
    pub fn inv_dt(&self) -> Real {
        if self.dt == 0.0 {
            0.0
        } else {
            1.0 / self.dt
        }
    }
}

impl Default for IntegrationParameters {
    fn default() -> Self {
        Self {
            dt: 1.0 / 60.0,
            erp: 0.3,
            allowed_linear_error: 1.0e-3,
            max_corrective_velocity: 10.0,
        }
    }
}
