use nalgebra::{DVector, Matrix3, Rotation3, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::geometry::is_rotation;

/// Measured vehicle state for one control step.
///
/// Position and velocity are in the world frame (ENU, z up); the attitude
/// maps body to world and the angular velocity is expressed in the body
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
        }
    }
}

impl VehicleState {
    /// Vehicle at rest at `position` with level attitude.
    pub fn at_rest(position: Vector3<f64>) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Builds a state from a rotation matrix, checking that it is a proper
    /// rotation (orthonormal, determinant +1).
    pub fn from_rotation_matrix(
        position: Vector3<f64>,
        velocity: Vector3<f64>,
        rotation: &Matrix3<f64>,
        angular_velocity: Vector3<f64>,
    ) -> Result<Self> {
        if !is_rotation(rotation, 1e-6) {
            return Err(ControlError::InvalidState(
                "attitude matrix is not a proper rotation".to_string(),
            ));
        }
        let attitude =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
        Ok(Self {
            position,
            velocity,
            attitude,
            angular_velocity,
        })
    }

    /// Body-to-world rotation matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.attitude.to_rotation_matrix().matrix()
    }

    /// Rejects non-finite components and quaternions that drifted off the
    /// unit sphere.
    pub fn validate(&self) -> Result<()> {
        let finite = self.position.iter().all(|x| x.is_finite())
            && self.velocity.iter().all(|x| x.is_finite())
            && self.angular_velocity.iter().all(|x| x.is_finite())
            && self.attitude.coords.iter().all(|x| x.is_finite());
        if !finite {
            return Err(ControlError::InvalidState(
                "state contains non-finite values".to_string(),
            ));
        }

        let norm = self.attitude.coords.norm();
        if (norm - 1.0).abs() > 1e-6 {
            return Err(ControlError::InvalidState(format!(
                "attitude quaternion has norm {}",
                norm
            )));
        }
        Ok(())
    }
}

/// Desired flat outputs for one control step.
///
/// `yaw_ddot` is needed for exact angular-acceleration feed-forward. When
/// it is `None` the controller substitutes zero and marks the resulting
/// command as degraded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FlatReference {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub jerk: Vector3<f64>,
    pub snap: Vector3<f64>,
    pub yaw: f64,
    pub yaw_dot: f64,
    pub yaw_ddot: Option<f64>,
}

impl FlatReference {
    /// Hold `position` with heading `yaw`.
    pub fn hover(position: Vector3<f64>, yaw: f64) -> Self {
        Self {
            position,
            yaw,
            yaw_ddot: Some(0.0),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let vectors = [
            self.position,
            self.velocity,
            self.acceleration,
            self.jerk,
            self.snap,
        ];
        let finite = vectors.iter().all(|v| v.iter().all(|x| x.is_finite()))
            && self.yaw.is_finite()
            && self.yaw_dot.is_finite()
            && self.yaw_ddot.map_or(true, f64::is_finite);
        if !finite {
            return Err(ControlError::InvalidState(
                "reference contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

/// Position, velocity, attitude and body-rate tracking errors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingErrors {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub attitude: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

/// Output of one control step. Every field is derived from the same
/// thrust/moment pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    /// Collective thrust [N]
    pub thrust: f64,
    /// Body moment [N·m]
    pub moment: Vector3<f64>,
    /// Per-rotor force [N]; negative entries are infeasible
    pub rotor_forces: DVector<f64>,
    /// Per-rotor speed [rad/s]; carries the sign of the rotor force
    pub rotor_speeds: DVector<f64>,
    /// Commanded attitude, if the controller produces one
    pub attitude: Option<UnitQuaternion<f64>>,
    /// Commanded body rate [rad/s], if the controller produces one
    pub body_rate: Option<Vector3<f64>>,
    /// Desired world-frame velocity [m/s]
    pub velocity: Vector3<f64>,
    /// Matched uncertainty estimate `[thrust, Mx, My, Mz]`, when adaptive
    pub matched_uncertainty: Option<Vector4<f64>>,
    /// Tracking errors that produced this command, when available
    pub errors: Option<TrackingErrors>,
    /// Set when the reference omitted yaw acceleration
    pub yaw_feedforward_degraded: bool,
}

impl ControlCommand {
    /// Indices of rotors asked for a negative force.
    pub fn infeasible_rotors(&self) -> Vec<usize> {
        self.rotor_speeds
            .iter()
            .enumerate()
            .filter(|(_, speed)| **speed < 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_feasible(&self) -> bool {
        self.rotor_speeds.iter().all(|speed| *speed >= 0.0)
    }
}
