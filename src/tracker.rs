//! Geometric tracking control on SE(3).
//!
//! The position loop produces a commanded force `A` whose direction fixes
//! the desired body z-axis. `A` is differentiated twice in closed form so
//! that the desired rotation, body rate and body angular acceleration are
//! exact, and the attitude loop is a PD law on SO(3) errors with full
//! gyroscopic feed-forward:
//!
//! ```text
//! A  = -kx ex - kv ev + m g e3 + m ẍd
//! f  = A · R e3
//! eR = ½ (Rcᵀ R - Rᵀ Rc)∨
//! eW = W - Rᵀ Rc Wc
//! M  = -kR eR - kW eW + W × J W - J (Ŵ Rᵀ Rc Wc - Rᵀ Rc Ẇc)
//! ```
//!
//! World frame is ENU with z up; body z is the thrust axis.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::error::Result;
use crate::geometry::{derivative_of_unit_vector, heading_axis, normalize, skew, unskew};
use crate::params::{GainSet, VehicleParams};
use crate::types::{FlatReference, TrackingErrors, VehicleState};

/// Output of one evaluation of the tracking law.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerOutput {
    /// Collective thrust [N]
    pub thrust: f64,
    /// Body moment [N·m]
    pub moment: Vector3<f64>,
    /// Desired rotation `Rc`
    pub attitude_des: Matrix3<f64>,
    /// Desired body rate `Wc` [rad/s]
    pub angular_velocity_des: Vector3<f64>,
    /// Desired body angular acceleration `Ẇc` [rad/s²]
    pub angular_acceleration_des: Vector3<f64>,
    pub errors: TrackingErrors,
}

impl TrackerOutput {
    pub fn attitude_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(self.attitude_des))
    }
}

/// Desired rotation and its first two time derivatives, with the force
/// terms the attitude loop does not need but telemetry does.
struct PositionLoop {
    thrust: f64,
    rc: Matrix3<f64>,
    wc: Vector3<f64>,
    wc_dot: Vector3<f64>,
    ex: Vector3<f64>,
    ev: Vector3<f64>,
}

/// Open-loop command obtained from differential flatness alone, assuming
/// the vehicle is exactly on the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedforwardCommand {
    pub thrust: f64,
    pub moment: Vector3<f64>,
    pub attitude: Matrix3<f64>,
    pub body_rate: Vector3<f64>,
    pub body_acceleration: Vector3<f64>,
}

/// Baseline nonlinear tracker. Holds only constants, so every call is a
/// pure function of the state and reference.
#[derive(Debug, Clone)]
pub struct GeometricTracker {
    mass: f64,
    inertia: Matrix3<f64>,
    gravity: f64,
    gains: GainSet,
}

impl GeometricTracker {
    pub fn new(params: &VehicleParams, gains: GainSet) -> Self {
        Self {
            mass: params.mass,
            inertia: params.inertia,
            gravity: params.gravity,
            gains,
        }
    }

    pub fn gains(&self) -> &GainSet {
        &self.gains
    }

    /// Evaluates the full tracking law.
    ///
    /// Fails with `DegenerateVector` when the commanded force vanishes or
    /// the desired heading is parallel to it; no NaN is ever returned.
    pub fn compute(
        &self,
        state: &VehicleState,
        reference: &FlatReference,
    ) -> Result<TrackerOutput> {
        let r = state.rotation_matrix();
        let w = state.angular_velocity;

        let position = self.position_control(state, &r, reference)?;
        let (moment, e_r, e_w) =
            self.attitude_control(&r, &w, &position.rc, &position.wc, &position.wc_dot);

        Ok(TrackerOutput {
            thrust: position.thrust,
            moment,
            attitude_des: position.rc,
            angular_velocity_des: position.wc,
            angular_acceleration_des: position.wc_dot,
            errors: TrackingErrors {
                position: position.ex,
                velocity: position.ev,
                attitude: e_r,
                angular_velocity: e_w,
            },
        })
    }

    fn position_control(
        &self,
        state: &VehicleState,
        r: &Matrix3<f64>,
        reference: &FlatReference,
    ) -> Result<PositionLoop> {
        let m = self.mass;
        let g = self.gravity;
        let e3 = Vector3::<f64>::z();
        let kx = &self.gains.kx;
        let kv = &self.gains.kv;

        let ex = state.position - reference.position;
        let ev = state.velocity - reference.velocity;

        // Commanded force and collective thrust along the current body axis
        let a = -kx.component_mul(&ex) - kv.component_mul(&ev)
            + e3 * (m * g)
            + reference.acceleration * m;
        let b3 = r * e3;
        let f = a.dot(&b3);

        // First derivative, using the body axis kinematics ḃ3 = R Ŵ e3
        let ev_dot = -e3 * g + b3 * (f / m) - reference.acceleration;
        let a_dot = -kx.component_mul(&ev) - kv.component_mul(&ev_dot) + reference.jerk * m;
        let b3_dot = r * skew(&state.angular_velocity) * e3;
        let f_dot = a_dot.dot(&b3) + a.dot(&b3_dot);

        // Second derivative
        let ev_ddot = b3 * (f_dot / m) + b3_dot * (f / m) - reference.jerk;
        let a_ddot = -kx.component_mul(&ev_dot) - kv.component_mul(&ev_ddot) + reference.snap * m;

        let b3c = derivative_of_unit_vector(&a, &a_dot, &a_ddot, "commanded force")?;

        let b1d = heading_axis(
            reference.yaw,
            reference.yaw_dot,
            reference.yaw_ddot.unwrap_or(0.0),
        );
        let (s1, s1_dot, s1_ddot) = (skew(&b1d.u), skew(&b1d.u_dot), skew(&b1d.u_ddot));

        let a2 = -s1 * b3c.u;
        let a2_dot = -s1_dot * b3c.u - s1 * b3c.u_dot;
        let a2_ddot = -s1_ddot * b3c.u - s1_dot * b3c.u_dot * 2.0 - s1 * b3c.u_ddot;
        let b2c = derivative_of_unit_vector(&a2, &a2_dot, &a2_ddot, "heading cross thrust axis")?;

        let b1c = skew(&b2c.u) * b3c.u;
        let b1c_dot = skew(&b2c.u_dot) * b3c.u + skew(&b2c.u) * b3c.u_dot;
        let b1c_ddot = skew(&b2c.u_ddot) * b3c.u
            + skew(&b2c.u_dot) * b3c.u_dot * 2.0
            + skew(&b2c.u) * b3c.u_ddot;

        let rc = Matrix3::from_columns(&[b1c, b2c.u, b3c.u]);
        let rc_dot = Matrix3::from_columns(&[b1c_dot, b2c.u_dot, b3c.u_dot]);
        let rc_ddot = Matrix3::from_columns(&[b1c_ddot, b2c.u_ddot, b3c.u_ddot]);

        let wc = unskew(&(rc.transpose() * rc_dot));
        let wc_hat = skew(&wc);
        let wc_dot = unskew(&(rc.transpose() * rc_ddot - wc_hat * wc_hat));

        Ok(PositionLoop {
            thrust: f,
            rc,
            wc,
            wc_dot,
            ex,
            ev,
        })
    }

    /// Returns `(M, eR, eW)`.
    fn attitude_control(
        &self,
        r: &Matrix3<f64>,
        w: &Vector3<f64>,
        rc: &Matrix3<f64>,
        wc: &Vector3<f64>,
        wc_dot: &Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let j = &self.inertia;
        let rt_rc = r.transpose() * rc;

        let e_r = unskew(&(rc.transpose() * r - r.transpose() * rc)) * 0.5;
        let e_w = w - rt_rc * wc;

        let moment = -self.gains.kr.component_mul(&e_r) - self.gains.kw.component_mul(&e_w)
            + w.cross(&(j * w))
            - j * (skew(w) * rt_rc * wc - rt_rc * wc_dot);

        (moment, e_r, e_w)
    }

    /// Differential-flatness feed-forward for `reference`, with no
    /// feedback on the measured state.
    ///
    /// Body rates follow from projecting the jerk onto the plane normal to
    /// the thrust axis, body accelerations from the snap; the yaw channel
    /// uses `ψ̇ ẑ·b3` and `ψ̈ ẑ·b3`.
    pub fn feedforward(&self, reference: &FlatReference) -> Result<FeedforwardCommand> {
        let m = self.mass;
        let e3 = Vector3::<f64>::z();

        let t = reference.acceleration + e3 * self.gravity;
        let b3 = normalize(&t, "feed-forward thrust")?;
        let u1 = m * t.norm();

        let c1 = Vector3::new(reference.yaw.cos(), reference.yaw.sin(), 0.0);
        let b2 = normalize(&b3.cross(&c1), "feed-forward heading")?;
        let b1 = b2.cross(&b3);
        let attitude = Matrix3::from_columns(&[b1, b2, b3]);

        let u1_dot = m * b3.dot(&reference.jerk);
        let hw = (reference.jerk * m - b3 * u1_dot) / u1;
        let body_rate = Vector3::new(
            -hw.dot(&b2),
            hw.dot(&b1),
            reference.yaw_dot * e3.dot(&b3),
        );

        let omega = attitude * body_rate;
        let thrust_vec = b3 * u1;
        let whirl = omega.cross(&omega.cross(&thrust_vec));
        let u1_ddot = b3.dot(&(reference.snap * m)) - b3.dot(&whirl);
        let ha = (reference.snap * m
            - b3 * u1_ddot
            - omega.cross(&(b3 * u1_dot)) * 2.0
            - whirl)
            / u1;
        let body_acceleration = Vector3::new(
            -ha.dot(&b2),
            ha.dot(&b1),
            reference.yaw_ddot.unwrap_or(0.0) * e3.dot(&b3),
        );

        let j = &self.inertia;
        let moment = j * body_acceleration + body_rate.cross(&(j * body_rate));

        Ok(FeedforwardCommand {
            thrust: u1,
            moment,
            attitude,
            body_rate,
            body_acceleration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use crate::geometry::is_rotation;
    use approx::assert_relative_eq;

    fn tracker() -> (GeometricTracker, VehicleParams) {
        let params = VehicleParams::hummingbird();
        (GeometricTracker::new(&params, GainSet::hummingbird()), params)
    }

    fn moving_reference() -> FlatReference {
        FlatReference {
            position: Vector3::new(1.0, -0.5, 2.0),
            velocity: Vector3::new(0.5, 0.2, -0.1),
            acceleration: Vector3::new(1.0, -0.4, 0.3),
            jerk: Vector3::new(0.2, 0.5, -0.1),
            snap: Vector3::new(-0.3, 0.1, 0.2),
            yaw: 0.3,
            yaw_dot: 0.2,
            yaw_ddot: Some(-0.1),
        }
    }

    #[test]
    fn test_hover_equilibrium() {
        let (tracker, params) = tracker();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let state = VehicleState::at_rest(target);
        let reference = FlatReference::hover(target, 0.0);

        let out = tracker.compute(&state, &reference).unwrap();

        assert_relative_eq!(out.thrust, params.mass * params.gravity, epsilon = 1e-12);
        assert_relative_eq!(out.moment, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(out.attitude_des, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(out.angular_velocity_des, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_climb_command_increases_thrust() {
        let (tracker, params) = tracker();
        let state = VehicleState::at_rest(Vector3::zeros());
        let reference = FlatReference::hover(Vector3::new(0.0, 0.0, 1.0), 0.0);

        let out = tracker.compute(&state, &reference).unwrap();
        assert!(out.thrust > params.hover_thrust());
        assert_relative_eq!(out.errors.position, Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_thrust_projects_on_current_body_axis() {
        let (tracker, params) = tracker();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let tilt = 0.2_f64;
        let state = VehicleState {
            attitude: UnitQuaternion::from_axis_angle(&Vector3::x_axis(), tilt),
            ..VehicleState::at_rest(target)
        };
        let reference = FlatReference::hover(target, 0.0);

        let out = tracker.compute(&state, &reference).unwrap();

        // Commanded force is still m g e3, so thrust is its projection on the tilted axis.
        assert_relative_eq!(out.thrust, params.hover_thrust() * tilt.cos(), epsilon = 1e-12);
        assert_relative_eq!(out.attitude_des, Matrix3::identity(), epsilon = 1e-12);
        // Roll error must drive a negative roll moment.
        assert!(out.errors.attitude.x > 0.0);
        assert!(out.moment.x < 0.0);
    }

    #[test]
    fn test_yaw_error_produces_yaw_moment() {
        let (tracker, _) = tracker();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let state = VehicleState::at_rest(target);
        let reference = FlatReference::hover(target, 0.5);

        let out = tracker.compute(&state, &reference).unwrap();
        assert!(out.moment.z > 0.0);
        assert_relative_eq!(out.moment.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(out.moment.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_desired_rotation_is_proper() {
        let (tracker, _) = tracker();
        let state = VehicleState {
            position: Vector3::new(0.8, -0.2, 1.7),
            velocity: Vector3::new(0.1, 0.4, 0.0),
            attitude: UnitQuaternion::from_euler_angles(0.05, -0.1, 0.4),
            angular_velocity: Vector3::new(0.2, -0.1, 0.05),
        };

        let out = tracker.compute(&state, &moving_reference()).unwrap();
        assert!(is_rotation(&out.attitude_des, 1e-9));
        assert!(out.thrust.is_finite());
        assert!(out.moment.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn test_free_fall_command_is_degenerate() {
        let (tracker, params) = tracker();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let state = VehicleState::at_rest(target);
        let reference = FlatReference {
            acceleration: Vector3::new(0.0, 0.0, -params.gravity),
            ..FlatReference::hover(target, 0.0)
        };

        let err = tracker.compute(&state, &reference).unwrap_err();
        assert!(matches!(
            err,
            ControlError::DegenerateVector { what: "commanded force", .. }
        ));
    }

    #[test]
    fn test_heading_along_thrust_is_degenerate() {
        let (tracker, params) = tracker();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let state = VehicleState::at_rest(target);
        // Horizontal acceleration of exactly g along +x with gravity cancelled
        // turns the thrust axis onto the heading direction.
        let reference = FlatReference {
            acceleration: Vector3::new(params.gravity, 0.0, -params.gravity),
            ..FlatReference::hover(target, 0.0)
        };

        let err = tracker.compute(&state, &reference).unwrap_err();
        assert!(matches!(
            err,
            ControlError::DegenerateVector { what: "heading cross thrust axis", .. }
        ));
    }

    #[test]
    fn test_desired_rate_matches_flatness_on_reference() {
        let (tracker, _) = tracker();
        let reference = FlatReference {
            yaw: 0.0,
            yaw_dot: 0.0,
            yaw_ddot: Some(0.0),
            ..moving_reference()
        };
        let ff = tracker.feedforward(&reference).unwrap();

        // Put the vehicle exactly on the reference with the flat attitude and rate.
        let state = VehicleState::from_rotation_matrix(
            reference.position,
            reference.velocity,
            &ff.attitude,
            ff.body_rate,
        )
        .unwrap();
        let out = tracker.compute(&state, &reference).unwrap();

        assert_relative_eq!(out.thrust, ff.thrust, epsilon = 1e-9);
        assert_relative_eq!(out.attitude_des, ff.attitude, epsilon = 1e-9);
        assert_relative_eq!(out.angular_velocity_des.x, ff.body_rate.x, epsilon = 1e-9);
        assert_relative_eq!(out.angular_velocity_des.y, ff.body_rate.y, epsilon = 1e-9);
    }

    #[test]
    fn test_desired_rate_matches_rotation_finite_difference() {
        // Along a reference that is exactly tracked, Wc must agree with a
        // finite difference of Rc over time.
        let (tracker, _) = tracker();
        let reference_at = |t: f64| FlatReference {
            position: Vector3::new(t.sin(), 0.5 * t * t, 1.0),
            velocity: Vector3::new(t.cos(), t, 0.0),
            acceleration: Vector3::new(-t.sin(), 1.0, 0.0),
            jerk: Vector3::new(-t.cos(), 0.0, 0.0),
            snap: Vector3::new(t.sin(), 0.0, 0.0),
            yaw: 0.2 * t,
            yaw_dot: 0.2,
            yaw_ddot: Some(0.0),
        };
        let rc_at = |t: f64| {
            let reference = reference_at(t);
            let ff = tracker.feedforward(&reference).unwrap();
            let state = VehicleState::from_rotation_matrix(
                reference.position,
                reference.velocity,
                &ff.attitude,
                ff.body_rate,
            )
            .unwrap();
            tracker.compute(&state, &reference).unwrap()
        };

        let t = 0.6;
        let h = 1e-5;
        let out = rc_at(t);
        let rc_dot = (rc_at(t + h).attitude_des - rc_at(t - h).attitude_des) / (2.0 * h);
        let wc_fd = unskew(&(out.attitude_des.transpose() * rc_dot));

        assert_relative_eq!(out.angular_velocity_des, wc_fd, epsilon = 1e-5);
    }

    #[test]
    fn test_feedforward_hover() {
        let (tracker, params) = tracker();
        let ff = tracker
            .feedforward(&FlatReference::hover(Vector3::new(0.0, 0.0, 2.0), 0.0))
            .unwrap();

        assert_relative_eq!(ff.thrust, params.hover_thrust(), epsilon = 1e-12);
        assert_relative_eq!(ff.moment, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(ff.attitude, Matrix3::identity(), epsilon = 1e-12);
    }
}
