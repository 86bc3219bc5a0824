use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::{ControlError, Result};
use crate::params::VehicleParams;

/// Smallest accepted ratio between the smallest and largest singular value
/// of the allocation matrix.
const MIN_CONDITION_RATIO: f64 = 1e-9;

/// Linear map between the vehicle wrench `[thrust, Mx, My, Mz]` and the
/// individual rotor forces.
///
/// All rotor thrust vectors are assumed parallel to body z. Row layout of
/// the forward map:
///
/// ```text
/// thrust: [ 1            ...  1            ]
/// Mx:     [ (r_i × ẑ)_x  ...               ]
/// My:     [ (r_i × ẑ)_y  ...               ]
/// Mz:     [ k_m/k_eta · dir_i ...          ]
/// ```
#[derive(Debug, Clone)]
pub struct ControlAllocator {
    forces_to_wrench: DMatrix<f64>,
    wrench_to_forces: DMatrix<f64>,
    k_eta: f64,
}

impl ControlAllocator {
    /// Builds and inverts the allocation matrix for `params`.
    ///
    /// Four rotors use the exact inverse, more use the Moore-Penrose
    /// pseudo-inverse. A rank-deficient layout is rejected.
    pub fn new(params: &VehicleParams) -> Result<Self> {
        let n = params.num_rotors();
        if n < 4 || params.rotor_directions.len() != n {
            return Err(ControlError::Configuration(format!(
                "allocation needs at least 4 rotors with one spin direction each, got {} and {}",
                n,
                params.rotor_directions.len()
            )));
        }
        if !(params.k_eta > 0.0) {
            return Err(ControlError::Configuration(format!(
                "thrust coefficient must be positive, got {}",
                params.k_eta
            )));
        }

        let torque_ratio = params.k_m / params.k_eta;
        let mut forces_to_wrench = DMatrix::zeros(4, n);
        for (i, (position, direction)) in params
            .rotor_positions
            .iter()
            .zip(params.rotor_directions.iter())
            .enumerate()
        {
            let arm = position.cross(&Vector3::z());
            forces_to_wrench[(0, i)] = 1.0;
            forces_to_wrench[(1, i)] = arm.x;
            forces_to_wrench[(2, i)] = arm.y;
            forces_to_wrench[(3, i)] = torque_ratio * direction;
        }

        let singular_values = forces_to_wrench.singular_values();
        let largest = singular_values.max();
        let smallest = singular_values.min();
        let ratio = if largest > 0.0 { smallest / largest } else { 0.0 };
        if !(ratio > MIN_CONDITION_RATIO) {
            return Err(ControlError::SingularAllocation { ratio });
        }

        let wrench_to_forces = if n == 4 {
            forces_to_wrench
                .clone()
                .try_inverse()
                .ok_or(ControlError::SingularAllocation { ratio })?
        } else {
            forces_to_wrench
                .clone()
                .pseudo_inverse(MIN_CONDITION_RATIO * largest)
                .map_err(|e| ControlError::Configuration(e.to_string()))?
        };

        log::info!(
            "built allocation for {} rotors (condition ratio {:.3e})",
            n,
            ratio
        );

        Ok(Self {
            forces_to_wrench,
            wrench_to_forces,
            k_eta: params.k_eta,
        })
    }

    pub fn num_rotors(&self) -> usize {
        self.forces_to_wrench.ncols()
    }

    /// The 4×N forward matrix.
    pub fn forward(&self) -> &DMatrix<f64> {
        &self.forces_to_wrench
    }

    /// The N×4 inverse matrix.
    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.wrench_to_forces
    }

    /// Rotor forces realizing `thrust` and `moment`. No bounds are applied.
    pub fn forces_from_wrench(&self, thrust: f64, moment: &Vector3<f64>) -> DVector<f64> {
        let wrench = DVector::from_column_slice(&[thrust, moment.x, moment.y, moment.z]);
        &self.wrench_to_forces * wrench
    }

    /// Thrust and moment produced by `rotor_forces`.
    pub fn wrench_from_forces(&self, rotor_forces: &DVector<f64>) -> Result<(f64, Vector3<f64>)> {
        if rotor_forces.len() != self.num_rotors() {
            return Err(ControlError::Configuration(format!(
                "expected {} rotor forces, got {}",
                self.num_rotors(),
                rotor_forces.len()
            )));
        }
        let wrench = &self.forces_to_wrench * rotor_forces;
        Ok((wrench[0], Vector3::new(wrench[1], wrench[2], wrench[3])))
    }

    /// Rotor speeds for `rotor_forces`, `sign(f)·sqrt(|f|/k_eta)`.
    ///
    /// A negative force maps to a negative speed rather than NaN so the
    /// infeasible rotor stays visible to whoever clamps the command.
    pub fn speeds_from_forces(&self, rotor_forces: &DVector<f64>) -> DVector<f64> {
        rotor_forces.map(|f| f.signum() * (f.abs() / self.k_eta).sqrt())
    }
}
