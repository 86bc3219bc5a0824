//! Geometric tracking control on SE(3) for multirotors, with an L1
//! adaptive layer and control allocation.
//!
//! Per control step the measured [`VehicleState`] and the desired
//! [`FlatReference`] go through
//!
//! 1. [`tracker::GeometricTracker`] for a baseline thrust and body moment,
//! 2. [`l1::L1Augmentor`] which estimates and cancels matched
//!    uncertainty,
//! 3. [`allocation::ControlAllocator`] for rotor forces and speeds,
//!
//! wrapped together by [`controller::GeometricL1Controller`]. A
//! receding-horizon alternative lives in [`mpc`], and [`dynamics`] holds a
//! rigid-body plant for closing the loop in simulation.
//!
//! The world frame is ENU (z up) and the body frame is FLU (z along the
//! thrust axis).

pub mod allocation;
pub mod controller;
pub mod dynamics;
pub mod error;
pub mod geometry;
pub mod l1;
pub mod mpc;
pub mod params;
pub mod tracker;
pub mod types;

pub use controller::{Controller, GeometricL1Controller};
pub use error::{ControlError, Result};
pub use params::{GainSet, L1Params, VehicleParams};
pub use types::{ControlCommand, FlatReference, TrackingErrors, VehicleState};

/// Standard gravity [m/s²].
pub const GRAVITY: f64 = 9.81;
