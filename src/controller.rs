use crate::allocation::ControlAllocator;
use crate::error::{ControlError, Result};
use crate::l1::{L1Augmentor, L1State};
use crate::params::{GainSet, L1Params, VehicleParams};
use crate::tracker::GeometricTracker;
use crate::types::{ControlCommand, FlatReference, VehicleState};

/// A multirotor controller driven one sample at a time.
///
/// Implementations keep whatever state they need between calls; `step`
/// takes `&mut self`, so a controller instance serves one vehicle.
pub trait Controller {
    /// Computes the command for time `t`.
    ///
    /// A failed step leaves the controller exactly as it was before the
    /// call.
    fn step(
        &mut self,
        t: f64,
        state: &VehicleState,
        reference: &FlatReference,
    ) -> Result<ControlCommand>;

    /// Forgets all internal state, as if freshly constructed.
    fn reset(&mut self);
}

/// Geometric tracker with an optional L1 adaptive layer on top, followed
/// by control allocation.
///
/// # Pipeline
///
/// state, reference → tracker (f, M) → L1 (f + u_ad, M + u_ad) → allocator
/// → rotor forces → rotor speeds
#[derive(Debug, Clone)]
pub struct GeometricL1Controller {
    vehicle: VehicleParams,
    tracker: GeometricTracker,
    augmentor: Option<L1Augmentor>,
    allocator: ControlAllocator,
    l1_state: L1State,
}

impl GeometricL1Controller {
    /// Builds the controller, validating every parameter set and the
    /// allocation matrix up front.
    pub fn new(vehicle: VehicleParams, gains: GainSet, l1: L1Params) -> Result<Self> {
        Self::build(vehicle, gains, Some(l1))
    }

    /// Same pipeline without the adaptive layer.
    pub fn baseline_only(vehicle: VehicleParams, gains: GainSet) -> Result<Self> {
        Self::build(vehicle, gains, None)
    }

    fn build(vehicle: VehicleParams, gains: GainSet, l1: Option<L1Params>) -> Result<Self> {
        vehicle.validate()?;
        gains.validate()?;
        let allocator = ControlAllocator::new(&vehicle)?;
        let augmentor = l1.map(|p| L1Augmentor::new(p, &vehicle)).transpose()?;
        let tracker = GeometricTracker::new(&vehicle, gains);

        log::info!(
            "geometric controller ready: mass {} kg, {} rotors, L1 {}",
            vehicle.mass,
            vehicle.num_rotors(),
            if augmentor.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            vehicle,
            tracker,
            augmentor,
            allocator,
            l1_state: L1State::default(),
        })
    }

    pub fn vehicle(&self) -> &VehicleParams {
        &self.vehicle
    }

    pub fn tracker(&self) -> &GeometricTracker {
        &self.tracker
    }

    pub fn allocator(&self) -> &ControlAllocator {
        &self.allocator
    }

    pub fn is_adaptive(&self) -> bool {
        self.augmentor.is_some()
    }

    /// Adaptive state committed by the last successful step.
    pub fn l1_state(&self) -> &L1State {
        &self.l1_state
    }
}

impl Controller for GeometricL1Controller {
    fn step(
        &mut self,
        t: f64,
        state: &VehicleState,
        reference: &FlatReference,
    ) -> Result<ControlCommand> {
        if !t.is_finite() {
            return Err(ControlError::InvalidState(format!(
                "time must be finite, got {}",
                t
            )));
        }
        state.validate()?;
        reference.validate()?;

        let baseline = self.tracker.compute(state, reference)?;

        let (thrust, moment, matched, next_l1) = match &self.augmentor {
            Some(augmentor) => {
                let step =
                    augmentor.step(&self.l1_state, t, state, baseline.thrust, &baseline.moment)?;
                (
                    step.output.thrust,
                    step.output.moment,
                    Some(step.output.matched),
                    Some(step.next),
                )
            }
            None => (baseline.thrust, baseline.moment, None, None),
        };

        let rotor_forces = self.allocator.forces_from_wrench(thrust, &moment);
        let rotor_speeds = self.allocator.speeds_from_forces(&rotor_forces);

        let yaw_feedforward_degraded = reference.yaw_ddot.is_none();
        if yaw_feedforward_degraded {
            log::warn!("t={:.3}: reference has no yaw acceleration, using zero", t);
        }

        let command = ControlCommand {
            thrust,
            moment,
            rotor_forces,
            rotor_speeds,
            attitude: Some(baseline.attitude_quaternion()),
            body_rate: Some(baseline.angular_velocity_des),
            velocity: reference.velocity,
            matched_uncertainty: matched,
            errors: Some(baseline.errors),
            yaw_feedforward_degraded,
        };

        let infeasible = command.infeasible_rotors();
        if !infeasible.is_empty() {
            log::warn!(
                "t={:.3}: rotors {:?} commanded negative thrust",
                t,
                infeasible
            );
        }
        log::debug!(
            "t={:.3} f={:.4} M={:?} ex={:?}",
            t,
            thrust,
            moment.as_slice(),
            baseline.errors.position.as_slice()
        );

        if let Some(next) = next_l1 {
            self.l1_state = next;
        }
        Ok(command)
    }

    fn reset(&mut self) {
        self.l1_state = L1State::default();
    }
}
