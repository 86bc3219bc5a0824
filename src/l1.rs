//! L1 adaptive augmentation of a baseline thrust/moment command.
//!
//! A state predictor runs alongside the vehicle with the last applied
//! command plus the current uncertainty estimate. Its velocity and body
//! rate errors are converted into a piecewise-constant estimate of the
//! matched (thrust, moment) and unmatched (body x/y force) uncertainty,
//! and the low-pass filtered matched estimate is subtracted from the
//! baseline command.
//!
//! The layer runs at a fixed sample time. Every step is a pure function
//! of the previous [`L1State`]; the caller decides when to commit the
//! returned state.

use nalgebra::{Matrix3, Vector2, Vector3, Vector4};

use crate::error::{ControlError, Result};
use crate::params::{L1Params, VehicleParams};
use crate::types::VehicleState;

/// Everything the adaptive layer remembers between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct L1State {
    /// Predicted velocity (world frame)
    pub v_hat: Vector3<f64>,
    /// Predicted body rate
    pub omega_hat: Vector3<f64>,
    pub rotation_prev: Matrix3<f64>,
    pub v_prev: Vector3<f64>,
    pub omega_prev: Vector3<f64>,
    /// Baseline command of the previous step, yaw not inverted
    pub u_baseline_prev: Vector4<f64>,
    /// Adaptive correction applied in the previous step
    pub u_ad_prev: Vector4<f64>,
    /// Matched uncertainty `[thrust, Mx, My, Mz]`
    pub sigma_matched: Vector4<f64>,
    /// Unmatched uncertainty along body x and y
    pub sigma_unmatched: Vector2<f64>,
    pub lpf1: Vector4<f64>,
    pub lpf2: Vector3<f64>,
    /// Time of the previous step, `None` before the first one
    pub last_time: Option<f64>,
}

impl Default for L1State {
    fn default() -> Self {
        Self {
            v_hat: Vector3::zeros(),
            omega_hat: Vector3::zeros(),
            rotation_prev: Matrix3::identity(),
            v_prev: Vector3::zeros(),
            omega_prev: Vector3::zeros(),
            u_baseline_prev: Vector4::zeros(),
            u_ad_prev: Vector4::zeros(),
            sigma_matched: Vector4::zeros(),
            sigma_unmatched: Vector2::zeros(),
            lpf1: Vector4::zeros(),
            lpf2: Vector3::zeros(),
            last_time: None,
        }
    }
}

impl L1State {
    pub fn is_initialized(&self) -> bool {
        self.last_time.is_some()
    }
}

/// Augmented command and the uncertainty estimates behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L1Output {
    pub thrust: f64,
    pub moment: Vector3<f64>,
    pub matched: Vector4<f64>,
    pub unmatched: Vector2<f64>,
}

/// Result of one adaptive step: the command to apply and the state to
/// carry into the next step.
#[derive(Debug, Clone, PartialEq)]
pub struct L1Step {
    pub output: L1Output,
    pub next: L1State,
}

#[derive(Debug, Clone)]
pub struct L1Augmentor {
    params: L1Params,
    mass: f64,
    inertia: Matrix3<f64>,
    inertia_inv: Matrix3<f64>,
    gravity: f64,
    /// `As e^{As dt} / (e^{As dt} - 1)` for the velocity channel
    gain_v: f64,
    /// Same for the body-rate channel
    gain_omega: f64,
    alpha_thrust: f64,
    alpha_moment: f64,
    alpha_moment_second: f64,
}

fn adaptation_gain(a_s: f64, dt: f64) -> f64 {
    let e = (a_s * dt).exp();
    a_s * e / (e - 1.0)
}

impl L1Augmentor {
    pub fn new(params: L1Params, vehicle: &VehicleParams) -> Result<Self> {
        params.validate()?;
        let inertia_inv = vehicle.inertia.try_inverse().ok_or_else(|| {
            ControlError::Configuration("inertia tensor is not invertible".to_string())
        })?;

        let dt = params.dt;
        Ok(Self {
            gain_v: adaptation_gain(params.as_v, dt),
            gain_omega: adaptation_gain(params.as_omega, dt),
            alpha_thrust: (-params.cutoff_thrust * dt).exp(),
            alpha_moment: (-params.cutoff_moment * dt).exp(),
            alpha_moment_second: (-params.cutoff_moment_second * dt).exp(),
            params,
            mass: vehicle.mass,
            inertia: vehicle.inertia,
            inertia_inv,
            gravity: vehicle.gravity,
        })
    }

    pub fn params(&self) -> &L1Params {
        &self.params
    }

    /// Runs one adaptive step at time `t` for the baseline `thrust` and
    /// `moment`.
    ///
    /// # Arguments
    ///
    /// * `prev` - state returned by the previous step, or the default
    /// * `t` - time of this sample [s]; must follow the previous one by `dt`
    /// * `state` - measured vehicle state
    /// * `thrust`, `moment` - baseline command
    ///
    /// The first step after construction or a reset only seeds the
    /// predictor with the measured velocity and body rate. No correction is
    /// applied on that step and the baseline passes through unchanged, apart
    /// from the optional yaw inversion.
    ///
    /// # Returns
    ///
    /// The augmented command and the next state. Fails with `InvalidState`
    /// for a non-finite `t` and with `StateDesync` when the sample time does
    /// not match the configured rate.
    pub fn step(
        &self,
        prev: &L1State,
        t: f64,
        state: &VehicleState,
        thrust: f64,
        moment: &Vector3<f64>,
    ) -> Result<L1Step> {
        let r = state.rotation_matrix();
        let v = state.velocity;
        let omega = state.angular_velocity;
        let u_baseline = Vector4::new(thrust, moment.x, moment.y, moment.z);

        if !t.is_finite() {
            return Err(ControlError::InvalidState(format!(
                "L1 sample time must be finite, got {}",
                t
            )));
        }

        let last_time = match prev.last_time {
            Some(last_time) => last_time,
            None => return Ok(self.seed(t, r, v, omega, u_baseline)),
        };

        let dt = self.params.dt;
        let elapsed = t - last_time;
        if (elapsed - dt).abs() > self.params.dt_tolerance * dt {
            log::warn!(
                "L1 sample at t={} is {} s after the previous one, expected {}",
                t,
                elapsed,
                dt
            );
            return Err(ControlError::StateDesync {
                expected: dt,
                elapsed,
            });
        }

        let (v_hat, omega_hat) = self.predict(prev);

        let v_tilde = v_hat - v;
        let omega_tilde = omega_hat - omega;
        let (sigma_matched, sigma_unmatched) = self.adapt(&r, &v_tilde, &omega_tilde);

        let (lpf1, lpf2) = self.filter(&prev.lpf1, &prev.lpf2, &sigma_matched);
        let u_ad = -Vector4::new(lpf1[0], lpf2.x, lpf2.y, lpf2.z);

        let output = self.augment(&u_baseline, &u_ad, sigma_matched, sigma_unmatched);

        log::debug!(
            "L1 t={:.3} sigma_m={:?} sigma_um={:?}",
            t,
            sigma_matched.as_slice(),
            sigma_unmatched.as_slice()
        );

        Ok(L1Step {
            output,
            next: L1State {
                v_hat,
                omega_hat,
                rotation_prev: r,
                v_prev: v,
                omega_prev: omega,
                u_baseline_prev: u_baseline,
                u_ad_prev: u_ad,
                sigma_matched,
                sigma_unmatched,
                lpf1,
                lpf2,
                last_time: Some(t),
            },
        })
    }

    /// First sample: the predictor starts on the measurement and the
    /// baseline passes through.
    fn seed(
        &self,
        t: f64,
        r: Matrix3<f64>,
        v: Vector3<f64>,
        omega: Vector3<f64>,
        u_baseline: Vector4<f64>,
    ) -> L1Step {
        let output = self.augment(
            &u_baseline,
            &Vector4::zeros(),
            Vector4::zeros(),
            Vector2::zeros(),
        );
        L1Step {
            output,
            next: L1State {
                v_hat: v,
                omega_hat: omega,
                rotation_prev: r,
                v_prev: v,
                omega_prev: omega,
                u_baseline_prev: u_baseline,
                last_time: Some(t),
                ..L1State::default()
            },
        }
    }

    /// Euler step of the state predictor over one sample.
    fn predict(&self, prev: &L1State) -> (Vector3<f64>, Vector3<f64>) {
        let dt = self.params.dt;
        let m = self.mass;
        let j = &self.inertia;
        let r = &prev.rotation_prev;
        let u = prev.u_baseline_prev + prev.u_ad_prev + prev.sigma_matched;

        let v_err = prev.v_hat - prev.v_prev;
        let v_dot = -Vector3::z() * self.gravity
            + r.column(2) * (u[0] / m)
            + r.column(0) * (prev.sigma_unmatched[0] / m)
            + r.column(1) * (prev.sigma_unmatched[1] / m)
            + v_err * self.params.as_v;

        let w = &prev.omega_prev;
        let omega_err = prev.omega_hat - prev.omega_prev;
        let torque = Vector3::new(u[1], u[2], u[3]);
        let omega_dot = self.inertia_inv * (torque - w.cross(&(j * w)))
            + omega_err * self.params.as_omega;

        (prev.v_hat + v_dot * dt, prev.omega_hat + omega_dot * dt)
    }

    /// Piecewise-constant adaptation law.
    fn adapt(
        &self,
        r: &Matrix3<f64>,
        v_tilde: &Vector3<f64>,
        omega_tilde: &Vector3<f64>,
    ) -> (Vector4<f64>, Vector2<f64>) {
        let m = self.mass;
        let mu_v = v_tilde * self.gain_v;
        let mu_omega = omega_tilde * self.gain_omega;

        let torque = -(self.inertia * mu_omega);
        let matched = Vector4::new(-m * r.column(2).dot(&mu_v), torque.x, torque.y, torque.z);
        let unmatched = Vector2::new(-m * r.column(0).dot(&mu_v), -m * r.column(1).dot(&mu_v));
        (matched, unmatched)
    }

    /// First-order low-pass on all four channels followed by a second
    /// stage on the moment channels.
    fn filter(
        &self,
        lpf1_prev: &Vector4<f64>,
        lpf2_prev: &Vector3<f64>,
        sigma: &Vector4<f64>,
    ) -> (Vector4<f64>, Vector3<f64>) {
        let stage = |prev: f64, input: f64, alpha: f64| alpha * prev + (1.0 - alpha) * input;

        let lpf1 = Vector4::new(
            stage(lpf1_prev[0], sigma[0], self.alpha_thrust),
            stage(lpf1_prev[1], sigma[1], self.alpha_moment),
            stage(lpf1_prev[2], sigma[2], self.alpha_moment),
            stage(lpf1_prev[3], sigma[3], self.alpha_moment),
        );
        let lpf2 = Vector3::from_fn(|i, _| {
            stage(lpf2_prev[i], lpf1[i + 1], self.alpha_moment_second)
        });
        (lpf1, lpf2)
    }

    fn augment(
        &self,
        u_baseline: &Vector4<f64>,
        u_ad: &Vector4<f64>,
        matched: Vector4<f64>,
        unmatched: Vector2<f64>,
    ) -> L1Output {
        let yaw = if self.params.invert_yaw_moment {
            -u_baseline[3]
        } else {
            u_baseline[3]
        };
        L1Output {
            thrust: u_baseline[0] + u_ad[0],
            moment: Vector3::new(
                u_baseline[1] + u_ad[1],
                u_baseline[2] + u_ad[2],
                yaw + u_ad[3],
            ),
            matched,
            unmatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn augmentor(invert_yaw_moment: bool) -> (L1Augmentor, VehicleParams) {
        let vehicle = VehicleParams::hummingbird();
        let params = L1Params {
            invert_yaw_moment,
            ..L1Params::default()
        };
        (L1Augmentor::new(params, &vehicle).unwrap(), vehicle)
    }

    /// Euler step of the same model the predictor uses, plus an external
    /// force `d` along body z and a body torque `tau`.
    fn propagate(
        vehicle: &VehicleParams,
        state: &VehicleState,
        thrust: f64,
        moment: &Vector3<f64>,
        d: f64,
        tau: &Vector3<f64>,
        dt: f64,
    ) -> VehicleState {
        let r = state.rotation_matrix();
        let j = vehicle.inertia;
        let w = state.angular_velocity;
        let v_dot = -Vector3::z() * vehicle.gravity + r.column(2) * ((thrust + d) / vehicle.mass);
        let w_dot = j.try_inverse().unwrap() * (moment + tau - w.cross(&(j * w)));
        VehicleState {
            position: state.position + state.velocity * dt,
            velocity: state.velocity + v_dot * dt,
            attitude: state.attitude * UnitQuaternion::from_scaled_axis(w * dt),
            angular_velocity: w + w_dot * dt,
        }
    }

    #[test]
    fn test_first_step_seeds_and_passes_through() {
        let (l1, _) = augmentor(false);
        let state = VehicleState {
            velocity: Vector3::new(0.1, 0.2, 0.3),
            angular_velocity: Vector3::new(0.01, 0.0, -0.02),
            ..VehicleState::default()
        };
        let moment = Vector3::new(0.01, -0.02, 0.003);

        let step = l1.step(&L1State::default(), 0.0, &state, 5.0, &moment).unwrap();

        assert_eq!(step.output.thrust, 5.0);
        assert_eq!(step.output.moment, moment);
        assert_eq!(step.output.matched, Vector4::zeros());
        assert_eq!(step.next.v_hat, state.velocity);
        assert_eq!(step.next.omega_hat, state.angular_velocity);
        assert_eq!(step.next.last_time, Some(0.0));
    }

    #[test]
    fn test_yaw_moment_inversion() {
        let moment = Vector3::new(0.01, -0.02, 0.003);
        let state = VehicleState::default();

        let (l1, _) = augmentor(true);
        let step = l1.step(&L1State::default(), 0.0, &state, 5.0, &moment).unwrap();
        assert_eq!(step.output.moment, Vector3::new(0.01, -0.02, -0.003));
        // The stored baseline is not inverted.
        assert_eq!(step.next.u_baseline_prev[3], 0.003);

        let (l1, _) = augmentor(false);
        let step = l1.step(&L1State::default(), 0.0, &state, 5.0, &moment).unwrap();
        assert_eq!(step.output.moment.z, 0.003);
    }

    #[test]
    fn test_rejects_desynchronized_sample() {
        let (l1, _) = augmentor(true);
        let state = VehicleState::default();
        let first = l1.step(&L1State::default(), 0.0, &state, 4.9, &Vector3::zeros()).unwrap();

        let err = l1
            .step(&first.next, 0.02, &state, 4.9, &Vector3::zeros())
            .unwrap_err();
        match err {
            ControlError::StateDesync { expected, elapsed } => {
                assert_eq!(expected, 0.01);
                assert_relative_eq!(elapsed, 0.02);
            }
            other => panic!("unexpected error {:?}", other),
        }

        // A sample inside the tolerance band is accepted.
        assert!(l1
            .step(&first.next, 0.01 + 5e-5, &state, 4.9, &Vector3::zeros())
            .is_ok());
    }

    #[test]
    fn test_rejects_non_finite_time() {
        let (l1, _) = augmentor(true);
        let state = VehicleState::default();

        let err = l1
            .step(&L1State::default(), f64::NAN, &state, 4.9, &Vector3::zeros())
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidState(_)));

        let first = l1.step(&L1State::default(), 0.0, &state, 4.9, &Vector3::zeros()).unwrap();
        for t in [f64::NAN, f64::INFINITY] {
            let err = l1
                .step(&first.next, t, &state, 4.9, &Vector3::zeros())
                .unwrap_err();
            assert!(matches!(err, ControlError::InvalidState(_)));
        }
    }

    #[test]
    fn test_zero_uncertainty_is_a_fixed_point() {
        let (l1, vehicle) = augmentor(false);
        let dt = l1.params().dt;
        let thrust = 5.2;
        let moment = Vector3::new(1e-3, -2e-3, 5e-4);

        let mut state = VehicleState::at_rest(Vector3::new(0.0, 0.0, 1.0));
        let mut l1_state = L1State::default();
        for k in 0..200 {
            let step = l1
                .step(&l1_state, k as f64 * dt, &state, thrust, &moment)
                .unwrap();
            assert_relative_eq!(step.output.matched, Vector4::zeros(), epsilon = 1e-9);
            assert_relative_eq!(step.output.thrust, thrust, epsilon = 1e-9);
            assert_relative_eq!(step.output.moment, moment, epsilon = 1e-9);

            state = propagate(
                &vehicle,
                &state,
                step.output.thrust,
                &step.output.moment,
                0.0,
                &Vector3::zeros(),
                dt,
            );
            l1_state = step.next;
        }
    }

    #[test]
    fn test_estimates_and_cancels_matched_disturbance() {
        let (l1, vehicle) = augmentor(false);
        let dt = l1.params().dt;
        let thrust = vehicle.hover_thrust();
        let d = -1.5;
        let tau = Vector3::new(2e-3, -1e-3, 0.0);

        let mut state = VehicleState::at_rest(Vector3::new(0.0, 0.0, 1.0));
        let mut l1_state = L1State::default();
        let mut last = None;
        for k in 0..100 {
            let step = l1
                .step(&l1_state, k as f64 * dt, &state, thrust, &Vector3::zeros())
                .unwrap();
            state = propagate(
                &vehicle,
                &state,
                step.output.thrust,
                &step.output.moment,
                d,
                &tau,
                dt,
            );
            l1_state = step.next;
            last = Some(step.output);
        }

        let out = last.unwrap();
        assert_relative_eq!(out.matched[0], d, max_relative = 0.02);
        assert_relative_eq!(out.matched[1], tau.x, max_relative = 0.02);
        assert_relative_eq!(out.matched[2], tau.y, max_relative = 0.02);
        // The correction opposes the disturbance.
        assert_relative_eq!(out.thrust, thrust - d, max_relative = 0.01);
        assert!(out.moment.x < 0.0 && out.moment.y > 0.0);
        assert_relative_eq!(out.unmatched, Vector2::zeros(), epsilon = 1e-3);
    }

    #[test]
    fn test_filter_settles_monotonically() {
        let (l1, _) = augmentor(true);
        let input = Vector4::<f64>::new(1.0, -0.5, 0.2, 0.1);

        let mut lpf1 = Vector4::zeros();
        let mut lpf2 = Vector3::zeros();
        let mut prev_distance = Vector4::from_fn(|i, _| input[i].abs());
        for _ in 0..100 {
            let (next1, next2) = l1.filter(&lpf1, &lpf2, &input);
            let outputs = Vector4::new(next1[0], next2.x, next2.y, next2.z);
            let distance = (input - outputs).abs();
            for i in 0..4 {
                assert!(distance[i] <= prev_distance[i]);
                // No overshoot past the input.
                assert!(outputs[i] * input[i] >= 0.0);
                assert!(outputs[i].abs() <= input[i].abs() + 1e-15);
            }
            prev_distance = distance;
            lpf1 = next1;
            lpf2 = next2;
        }
        assert_relative_eq!(lpf1, input, epsilon = 1e-12);
        assert_relative_eq!(lpf2, Vector3::new(-0.5, 0.2, 0.1), epsilon = 1e-12);
    }

    #[test]
    fn test_adaptation_gain() {
        // As = -1, dt = 0.01
        assert_relative_eq!(adaptation_gain(-1.0, 0.01), 99.5, epsilon = 1e-2);
    }
}
