//! Vehicle, gain and adaptive-layer parameters.
//!
//! All three types are plain serde-friendly data, validated once when a
//! controller is built and immutable afterwards.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::GRAVITY;

fn default_gravity() -> f64 {
    GRAVITY
}

/// Physical description of a multirotor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleParams {
    /// Mass [kg]
    pub mass: f64,
    /// Inertia tensor about the body axes [kg·m²]
    pub inertia: Matrix3<f64>,
    /// Rotor hub positions in the body frame [m]
    pub rotor_positions: Vec<Vector3<f64>>,
    /// Spin direction of each rotor, +1 or -1
    pub rotor_directions: Vec<f64>,
    /// Thrust coefficient [N/(rad/s)²]
    pub k_eta: f64,
    /// Yaw moment coefficient [N·m/(rad/s)²]
    pub k_m: f64,
    /// Minimum rotor speed [rad/s]
    pub rotor_speed_min: f64,
    /// Maximum rotor speed [rad/s]
    pub rotor_speed_max: f64,
    /// Gravity magnitude [m/s²], world z-up
    #[serde(default = "default_gravity")]
    pub gravity: f64,
}

impl VehicleParams {
    /// Four rotors on the diagonals of an X frame with arm length `arm`,
    /// spinning +, -, +, - starting from the front-left rotor.
    pub fn x_frame(
        mass: f64,
        inertia_diag: Vector3<f64>,
        arm: f64,
        k_eta: f64,
        k_m: f64,
        rotor_speed_max: f64,
    ) -> Self {
        let d = arm * std::f64::consts::FRAC_1_SQRT_2;
        Self {
            mass,
            inertia: Matrix3::from_diagonal(&inertia_diag),
            rotor_positions: vec![
                Vector3::new(d, d, 0.0),
                Vector3::new(d, -d, 0.0),
                Vector3::new(-d, -d, 0.0),
                Vector3::new(-d, d, 0.0),
            ],
            rotor_directions: vec![1.0, -1.0, 1.0, -1.0],
            k_eta,
            k_m,
            rotor_speed_min: 0.0,
            rotor_speed_max,
            gravity: GRAVITY,
        }
    }

    /// Crazyflie 2.x class nano quadrotor.
    pub fn crazyflie() -> Self {
        Self::x_frame(
            0.03,
            Vector3::new(1.43e-5, 1.43e-5, 2.89e-5),
            0.043,
            2.3e-8,
            7.8e-10,
            2500.0,
        )
    }

    /// AscTec Hummingbird class quadrotor.
    pub fn hummingbird() -> Self {
        Self::x_frame(
            0.5,
            Vector3::new(3.65e-3, 3.68e-3, 7.03e-3),
            0.17,
            5.57e-6,
            1.36e-7,
            1500.0,
        )
    }

    pub fn num_rotors(&self) -> usize {
        self.rotor_positions.len()
    }

    /// Thrust that balances gravity [N].
    pub fn hover_thrust(&self) -> f64 {
        self.mass * self.gravity
    }

    /// Rejects parameters no physical vehicle could have.
    pub fn validate(&self) -> Result<()> {
        if !(self.mass > 0.0 && self.mass.is_finite()) {
            return Err(ControlError::Configuration(format!(
                "mass must be positive, got {}",
                self.mass
            )));
        }
        if !(self.gravity > 0.0 && self.gravity.is_finite()) {
            return Err(ControlError::Configuration(format!(
                "gravity must be positive, got {}",
                self.gravity
            )));
        }

        let asymmetry = (self.inertia - self.inertia.transpose()).abs().max();
        if asymmetry > 1e-12 * self.inertia.abs().max().max(1.0) {
            return Err(ControlError::Configuration(
                "inertia tensor is not symmetric".to_string(),
            ));
        }
        if self.inertia.cholesky().is_none() {
            return Err(ControlError::Configuration(
                "inertia tensor is not positive definite".to_string(),
            ));
        }

        if self.num_rotors() < 4 {
            return Err(ControlError::Configuration(format!(
                "at least 4 rotors are needed to span thrust and moment, got {}",
                self.num_rotors()
            )));
        }
        if self.rotor_directions.len() != self.num_rotors() {
            return Err(ControlError::Configuration(format!(
                "{} rotor positions but {} spin directions",
                self.num_rotors(),
                self.rotor_directions.len()
            )));
        }
        if let Some(dir) = self.rotor_directions.iter().find(|d| d.abs() != 1.0) {
            return Err(ControlError::Configuration(format!(
                "spin direction must be +1 or -1, got {}",
                dir
            )));
        }

        if !(self.k_eta > 0.0) || !(self.k_m >= 0.0) {
            return Err(ControlError::Configuration(format!(
                "rotor coefficients out of range: k_eta={}, k_m={}",
                self.k_eta, self.k_m
            )));
        }
        if !(self.rotor_speed_min >= 0.0 && self.rotor_speed_max > self.rotor_speed_min) {
            return Err(ControlError::Configuration(format!(
                "rotor speed bounds [{}, {}] are empty",
                self.rotor_speed_min, self.rotor_speed_max
            )));
        }

        Ok(())
    }
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self::hummingbird()
    }
}

/// Tracking gains of the geometric controller.
///
/// `kx` and `kv` act on force (they are not scaled by mass); `kr` and `kw`
/// act on moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainSet {
    /// Position gain
    pub kx: Vector3<f64>,
    /// Velocity gain
    pub kv: Vector3<f64>,
    /// Attitude gain
    pub kr: Vector3<f64>,
    /// Body-rate gain
    pub kw: Vector3<f64>,
}

impl GainSet {
    /// Gains tuned for [`VehicleParams::hummingbird`].
    pub fn hummingbird() -> Self {
        Self {
            kx: Vector3::new(4.0, 4.0, 9.0),
            kv: Vector3::new(2.0, 2.0, 4.0),
            kr: Vector3::repeat(0.3),
            kw: Vector3::repeat(0.03),
        }
    }

    /// Gains tuned for [`VehicleParams::crazyflie`].
    pub fn crazyflie() -> Self {
        Self {
            kx: Vector3::new(0.24, 0.24, 0.54),
            kv: Vector3::new(0.12, 0.12, 0.24),
            kr: Vector3::repeat(1.2e-3),
            kw: Vector3::repeat(1.2e-4),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.kx, self.kv, self.kr, self.kw];
        if all.iter().any(|k| k.iter().any(|g| !(*g > 0.0 && g.is_finite()))) {
            return Err(ControlError::Configuration(
                "all tracking gains must be positive and finite".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GainSet {
    fn default() -> Self {
        Self::hummingbird()
    }
}

/// Design parameters of the L1 adaptive layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L1Params {
    /// Predictor pole on the translational channel (negative)
    pub as_v: f64,
    /// Predictor pole on the rotational channel (negative)
    pub as_omega: f64,
    /// Fixed sample time of the adaptive layer [s]
    pub dt: f64,
    /// Cutoff of the first low-pass stage on the thrust channel [rad/s]
    pub cutoff_thrust: f64,
    /// Cutoff of the first low-pass stage on the moment channels [rad/s]
    pub cutoff_moment: f64,
    /// Cutoff of the second low-pass stage on the moment channels [rad/s]
    pub cutoff_moment_second: f64,
    /// Allowed deviation of the elapsed time from `dt`, as a fraction of `dt`
    pub dt_tolerance: f64,
    /// Emit the baseline yaw moment with inverted sign.
    ///
    /// The allocator assumes a rotor adds `+(k_m / k_eta) s f` of yaw
    /// torque for spin direction `s`. The inversion suits vehicles whose
    /// yaw torque has the opposite sign. Turn it off when the vehicle
    /// shares the allocator's convention, as [`ReferencePlant`] does; with
    /// the inversion left on, such a vehicle runs away from its yaw
    /// setpoint.
    ///
    /// [`ReferencePlant`]: crate::dynamics::ReferencePlant
    pub invert_yaw_moment: bool,
}

impl L1Params {
    pub fn validate(&self) -> Result<()> {
        if !(self.as_v < 0.0 && self.as_omega < 0.0) {
            return Err(ControlError::Configuration(format!(
                "predictor poles must be negative, got as_v={}, as_omega={}",
                self.as_v, self.as_omega
            )));
        }
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(ControlError::Configuration(format!(
                "L1 sample time must be positive, got {}",
                self.dt
            )));
        }
        let cutoffs = [self.cutoff_thrust, self.cutoff_moment, self.cutoff_moment_second];
        if cutoffs.iter().any(|c| !(*c > 0.0 && c.is_finite())) {
            return Err(ControlError::Configuration(
                "low-pass cutoff frequencies must be positive".to_string(),
            ));
        }
        if !(self.dt_tolerance > 0.0 && self.dt_tolerance < 1.0) {
            return Err(ControlError::Configuration(format!(
                "dt tolerance must lie in (0, 1), got {}",
                self.dt_tolerance
            )));
        }
        Ok(())
    }
}

impl Default for L1Params {
    fn default() -> Self {
        Self {
            as_v: -1.0,
            as_omega: -1.0,
            dt: 0.01,
            cutoff_thrust: 50.0,
            cutoff_moment: 50.0,
            cutoff_moment_second: 50.0,
            dt_tolerance: 0.01,
            invert_yaw_moment: true,
        }
    }
}
