use nalgebra::{DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use thiserror::Error;

use crate::allocation::ControlAllocator;
use crate::error::ControlError;
use crate::params::VehicleParams;
use crate::types::VehicleState;

/// Number of entries in the packed plant state `[x, v, q(w,i,j,k), W]`.
pub const STATE_SIZE: usize = 13;

/// Failures of the reference plant.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulationError {
    #[error("invalid vehicle model: {0}")]
    Model(#[from] ControlError),
    #[error("integration from t={start} to t={end} did not reach the final time")]
    IntegrationFailed { start: f64, end: f64 },
    #[error("state became non-finite at t={0}")]
    NonFinite(f64),
    #[error("expected {expected} rotor speeds, got {got}")]
    RotorCount { expected: usize, got: usize },
}

/// Packs a state into the integrator layout.
pub fn to_array(state: &VehicleState) -> [f64; STATE_SIZE] {
    let q = state.attitude.quaternion();
    [
        state.position.x,
        state.position.y,
        state.position.z,
        state.velocity.x,
        state.velocity.y,
        state.velocity.z,
        q.w,
        q.i,
        q.j,
        q.k,
        state.angular_velocity.x,
        state.angular_velocity.y,
        state.angular_velocity.z,
    ]
}

/// Unpacks an integrator state, renormalizing the quaternion.
pub fn from_array(arr: &[f64; STATE_SIZE]) -> VehicleState {
    VehicleState {
        position: Vector3::new(arr[0], arr[1], arr[2]),
        velocity: Vector3::new(arr[3], arr[4], arr[5]),
        attitude: UnitQuaternion::from_quaternion(Quaternion::new(arr[6], arr[7], arr[8], arr[9])),
        angular_velocity: Vector3::new(arr[10], arr[11], arr[12]),
    }
}

/// Rigid-body equations of motion on SE(3) with a body-z thrust, a body
/// moment and external disturbances.
///
/// ```text
/// ẋ = v
/// v̇ = -g ẑ + (f / m) R ẑ + d / m
/// q̇ = ½ q ⊗ (0, W)
/// J Ẇ = M + τ_d - W × J W
/// ```
///
/// The disturbance force `d` is expressed in the world frame, the
/// disturbance torque `τ_d` in the body frame.
pub struct RigidBodyOde {
    pub mass: f64,
    pub inertia: Matrix3<f64>,
    pub inertia_inv: Matrix3<f64>,
    pub gravity: f64,
    pub thrust: f64,
    pub moment: Vector3<f64>,
    pub force_disturbance: Vector3<f64>,
    pub torque_disturbance: Vector3<f64>,
}

impl fast_ode::DifferentialEquation<STATE_SIZE> for RigidBodyOde {
    fn ode_dot_y(
        &self,
        _t: f64,
        y: &fast_ode::Coord<STATE_SIZE>,
    ) -> (fast_ode::Coord<STATE_SIZE>, bool) {
        let s = y.0;
        let velocity = Vector3::new(s[3], s[4], s[5]);
        let q = Quaternion::new(s[6], s[7], s[8], s[9]);
        let w = Vector3::new(s[10], s[11], s[12]);

        // The integrator may drift off the unit sphere within a step.
        let rotation = UnitQuaternion::from_quaternion(q).to_rotation_matrix();

        let v_dot = -Vector3::z() * self.gravity
            + rotation * Vector3::z() * (self.thrust / self.mass)
            + self.force_disturbance / self.mass;
        let q_dot = q * Quaternion::from_imag(w) * 0.5;
        let w_dot = self.inertia_inv
            * (self.moment + self.torque_disturbance - w.cross(&(self.inertia * w)));

        #[rustfmt::skip]
        let dot_y = [
            velocity.x, velocity.y, velocity.z,
            v_dot.x, v_dot.y, v_dot.z,
            q_dot.w, q_dot.i, q_dot.j, q_dot.k,
            w_dot.x, w_dot.y, w_dot.z,
        ];
        let finite = dot_y.iter().all(|x| x.is_finite());
        (fast_ode::Coord(dot_y), finite)
    }
}

/// Simulated multirotor used to close the loop around a controller.
///
/// Each call to [`ReferencePlant::step`] holds the command constant over
/// the interval and integrates with an adaptive solver.
pub struct ReferencePlant {
    params: VehicleParams,
    inertia_inv: Matrix3<f64>,
    allocator: ControlAllocator,
    state: VehicleState,
    time: f64,
    force_disturbance: Vector3<f64>,
    torque_disturbance: Vector3<f64>,
    tolerance: f64,
}

impl ReferencePlant {
    pub fn new(params: VehicleParams, initial: VehicleState) -> Result<Self, SimulationError> {
        params.validate()?;
        let allocator = ControlAllocator::new(&params)?;
        let inertia_inv = params.inertia.try_inverse().ok_or_else(|| {
            ControlError::Configuration("inertia tensor is not invertible".to_string())
        })?;
        Ok(Self {
            params,
            inertia_inv,
            allocator,
            state: initial,
            time: 0.0,
            force_disturbance: Vector3::zeros(),
            torque_disturbance: Vector3::zeros(),
            tolerance: 1e-8,
        })
    }

    /// Constant external force (world frame) and torque (body frame).
    pub fn with_disturbance(mut self, force: Vector3<f64>, torque: Vector3<f64>) -> Self {
        self.set_disturbance(force, torque);
        self
    }

    pub fn set_disturbance(&mut self, force: Vector3<f64>, torque: Vector3<f64>) {
        self.force_disturbance = force;
        self.torque_disturbance = torque;
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Advances the plant by `dt` under a constant thrust and moment.
    ///
    /// # Arguments
    ///
    /// * `thrust` - collective thrust along body z (N)
    /// * `moment` - body moment (N⋅m)
    /// * `dt` - interval length (seconds)
    pub fn step(
        &mut self,
        thrust: f64,
        moment: &Vector3<f64>,
        dt: f64,
    ) -> Result<&VehicleState, SimulationError> {
        let ode = RigidBodyOde {
            mass: self.params.mass,
            inertia: self.params.inertia,
            inertia_inv: self.inertia_inv,
            gravity: self.params.gravity,
            thrust,
            moment: *moment,
            force_disturbance: self.force_disturbance,
            torque_disturbance: self.torque_disturbance,
        };

        let time_span = (self.time, self.time + dt);
        let result = fast_ode::solve_ivp(
            &ode,
            time_span,
            fast_ode::Coord(to_array(&self.state)),
            |_, _| true,
            self.tolerance,
            self.tolerance * 10.0,
        );

        let final_coord = match result {
            fast_ode::IvpResult::FinalTimeReached(final_coord) => final_coord,
            _ => {
                return Err(SimulationError::IntegrationFailed {
                    start: time_span.0,
                    end: time_span.1,
                })
            }
        };
        if final_coord.0.iter().any(|x| !x.is_finite()) {
            return Err(SimulationError::NonFinite(time_span.1));
        }

        self.state = from_array(&final_coord.0);
        self.time = time_span.1;
        Ok(&self.state)
    }

    /// Advances the plant by `dt` driven by rotor speeds.
    ///
    /// Speeds are clamped to the rotor limits before conversion to thrust,
    /// so negative (infeasible) commands produce the minimum thrust.
    pub fn step_rotor_speeds(
        &mut self,
        rotor_speeds: &DVector<f64>,
        dt: f64,
    ) -> Result<&VehicleState, SimulationError> {
        let forces = self.rotor_forces(rotor_speeds)?;
        let (thrust, moment) = self.allocator.wrench_from_forces(&forces)?;
        self.step(thrust, &moment, dt)
    }

    /// Per-rotor thrust `k_eta ω²` after clamping to the speed limits.
    pub fn rotor_forces(
        &self,
        rotor_speeds: &DVector<f64>,
    ) -> Result<DVector<f64>, SimulationError> {
        let expected = self.allocator.num_rotors();
        if rotor_speeds.len() != expected {
            return Err(SimulationError::RotorCount {
                expected,
                got: rotor_speeds.len(),
            });
        }
        let (lo, hi) = (self.params.rotor_speed_min, self.params.rotor_speed_max);
        Ok(rotor_speeds.map(|w| {
            let w = w.clamp(lo, hi);
            self.params.k_eta * w * w
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plant(initial: VehicleState) -> ReferencePlant {
        ReferencePlant::new(VehicleParams::hummingbird(), initial).unwrap()
    }

    /// When thrust equals weight and no torques are applied the vehicle
    /// stays where it is.
    #[test]
    fn test_hover_simulation() {
        let mut plant = plant(VehicleState::at_rest(Vector3::new(0.0, 0.0, 1.0)));
        let mg = VehicleParams::hummingbird().hover_thrust();

        for _ in 0..100 {
            plant.step(mg, &Vector3::zeros(), 0.01).unwrap();
        }

        let state = plant.state();
        assert_relative_eq!(plant.time(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(state.position, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-6);
        assert_relative_eq!(state.velocity, Vector3::zeros(), epsilon = 1e-6);
    }

    /// Compares against z = z0 - g t² / 2.
    #[test]
    fn test_free_fall() {
        let mut plant = plant(VehicleState::at_rest(Vector3::new(0.0, 0.0, 10.0)));
        let t = 1.0;
        plant.step(0.0, &Vector3::zeros(), t).unwrap();

        let g = VehicleParams::hummingbird().gravity;
        assert_relative_eq!(plant.state().position.z, 10.0 - 0.5 * g * t * t, epsilon = 1e-5);
        assert_relative_eq!(plant.state().velocity.z, -g * t, epsilon = 1e-5);
    }

    #[test]
    fn test_yaw_torque_spins_up() {
        let params = VehicleParams::hummingbird();
        let izz = params.inertia[(2, 2)];
        let mut plant = plant(VehicleState::at_rest(Vector3::zeros()));
        let torque = 1e-3;

        plant
            .step(params.hover_thrust(), &Vector3::new(0.0, 0.0, torque), 0.5)
            .unwrap();

        let state = plant.state();
        let rate = torque / izz * 0.5;
        assert_relative_eq!(state.angular_velocity.z, rate, epsilon = 1e-6);
        // Heading follows θ = ½ (τ/J) t²
        let (_, _, yaw) = state.attitude.euler_angles();
        assert_relative_eq!(yaw, 0.5 * torque / izz * 0.25, epsilon = 1e-5);
        assert_relative_eq!(state.attitude.coords.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_disturbance_force() {
        let params = VehicleParams::hummingbird();
        let mut plant = plant(VehicleState::at_rest(Vector3::zeros()))
            .with_disturbance(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros());

        plant.step(params.hover_thrust(), &Vector3::zeros(), 1.0).unwrap();
        assert_relative_eq!(plant.state().velocity.x, 1.0 / params.mass, epsilon = 1e-6);
        assert_relative_eq!(plant.state().velocity.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rotor_speeds_are_clamped() {
        let params = VehicleParams::hummingbird();
        let plant = plant(VehicleState::default());

        let speeds = DVector::from_vec(vec![-100.0, 400.0, 1e5, 0.0]);
        let forces = plant.rotor_forces(&speeds).unwrap();
        assert_eq!(forces[0], 0.0);
        assert_relative_eq!(forces[1], params.k_eta * 400.0 * 400.0);
        assert_relative_eq!(
            forces[2],
            params.k_eta * params.rotor_speed_max * params.rotor_speed_max
        );

        let err = plant.rotor_forces(&DVector::zeros(3)).unwrap_err();
        assert_eq!(err, SimulationError::RotorCount { expected: 4, got: 3 });
    }

    #[test]
    fn test_state_array_round_trip() {
        let state = VehicleState {
            position: Vector3::new(1.0, 2.0, 3.0),
            velocity: Vector3::new(-0.1, 0.2, 0.0),
            attitude: UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            angular_velocity: Vector3::new(0.5, -0.5, 0.1),
        };
        let back = from_array(&to_array(&state));
        assert_relative_eq!(back.position, state.position);
        assert_relative_eq!(back.attitude, state.attitude, epsilon = 1e-12);
        assert_relative_eq!(back.angular_velocity, state.angular_velocity);
    }
}
