//! Receding-horizon controller around an external trajectory optimizer.
//!
//! The optimizer itself (model, cost, solver) lives behind
//! [`TrajectoryOptimizer`]. This module only decides when to re-solve and
//! turns the returned rotor forces into a [`ControlCommand`].

use nalgebra::DVector;

use crate::allocation::ControlAllocator;
use crate::controller::Controller;
use crate::error::{ControlError, Result};
use crate::params::VehicleParams;
use crate::types::{ControlCommand, FlatReference, VehicleState};

/// A finite-horizon optimizer that returns rotor forces for the first node
/// of its horizon.
pub trait TrajectoryOptimizer {
    /// Shifts the tracked reference window to start at `node`.
    fn set_reference(&mut self, node: usize);

    /// Solves from `state` and returns one force per rotor [N].
    fn solve(&mut self, state: &VehicleState) -> Result<DVector<f64>>;
}

/// Runs the optimizer once per horizon node and holds its rotor forces in
/// between.
#[derive(Debug)]
pub struct ModelPredictiveController<O> {
    optimizer: O,
    allocator: ControlAllocator,
    node_dt: f64,
    next_node: usize,
    rotor_forces: DVector<f64>,
}

impl<O: TrajectoryOptimizer> ModelPredictiveController<O> {
    /// # Arguments
    ///
    /// * `optimizer` - the wrapped solver
    /// * `vehicle` - used for the allocation and speed maps
    /// * `horizon` - length of the optimization horizon [s]
    /// * `n_nodes` - number of nodes the horizon is split into
    pub fn new(
        optimizer: O,
        vehicle: &VehicleParams,
        horizon: f64,
        n_nodes: usize,
    ) -> Result<Self> {
        vehicle.validate()?;
        if !(horizon > 0.0 && horizon.is_finite()) || n_nodes == 0 {
            return Err(ControlError::Configuration(format!(
                "horizon must be positive with at least one node, got {} s over {} nodes",
                horizon, n_nodes
            )));
        }
        let allocator = ControlAllocator::new(vehicle)?;
        let node_dt = horizon / n_nodes as f64;
        log::info!("MPC node period {:.4} s", node_dt);

        Ok(Self {
            rotor_forces: DVector::zeros(allocator.num_rotors()),
            optimizer,
            allocator,
            node_dt,
            next_node: 0,
        })
    }

    pub fn node_dt(&self) -> f64 {
        self.node_dt
    }

    /// Index of the node that will trigger the next solve.
    pub fn next_node(&self) -> usize {
        self.next_node
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}

impl<O: TrajectoryOptimizer> Controller for ModelPredictiveController<O> {
    /// The reference is owned by the optimizer; only the state and time
    /// are used here.
    fn step(
        &mut self,
        t: f64,
        state: &VehicleState,
        _reference: &FlatReference,
    ) -> Result<ControlCommand> {
        state.validate()?;
        if !(t >= 0.0) {
            return Err(ControlError::InvalidState(format!(
                "time must be non-negative, got {}",
                t
            )));
        }

        let node = (t / self.node_dt).floor() as usize;
        if node >= self.next_node {
            self.optimizer.set_reference(node);
            let forces = self.optimizer.solve(state)?;
            if forces.len() != self.allocator.num_rotors() {
                return Err(ControlError::Optimizer(format!(
                    "optimizer returned {} rotor forces for {} rotors",
                    forces.len(),
                    self.allocator.num_rotors()
                )));
            }
            log::debug!("MPC solved node {} at t={:.3}", node, t);
            self.rotor_forces = forces;
            self.next_node = node + 1;
        }

        let (thrust, moment) = self.allocator.wrench_from_forces(&self.rotor_forces)?;
        let rotor_speeds = self.allocator.speeds_from_forces(&self.rotor_forces);

        Ok(ControlCommand {
            thrust,
            moment,
            rotor_forces: self.rotor_forces.clone(),
            rotor_speeds,
            attitude: None,
            body_rate: None,
            velocity: state.velocity,
            matched_uncertainty: None,
            errors: None,
            yaw_feedforward_degraded: false,
        })
    }

    fn reset(&mut self) {
        self.next_node = 0;
        self.rotor_forces = DVector::zeros(self.allocator.num_rotors());
    }
}
