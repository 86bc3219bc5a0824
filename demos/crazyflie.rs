use nalgebra::Vector3;
use uav_l1::dynamics::ReferencePlant;
use uav_l1::{
    Controller, FlatReference, GainSet, GeometricL1Controller, L1Params, VehicleParams,
    VehicleState,
};

/// Horizontal circle of radius `r` at 1 m altitude, angular rate `w`.
fn circle(t: f64, r: f64, w: f64) -> FlatReference {
    let (s, c) = (w * t).sin_cos();
    FlatReference {
        position: Vector3::new(r * c, r * s, 1.0),
        velocity: Vector3::new(-r * w * s, r * w * c, 0.0),
        acceleration: Vector3::new(-r * w * w * c, -r * w * w * s, 0.0),
        jerk: Vector3::new(r * w.powi(3) * s, -r * w.powi(3) * c, 0.0),
        snap: Vector3::new(r * w.powi(4) * c, r * w.powi(4) * s, 0.0),
        yaw: 0.0,
        yaw_dot: 0.0,
        yaw_ddot: Some(0.0),
    }
}

// Example usage
fn main() {
    env_logger::init();

    let params = VehicleParams::crazyflie();
    let simulation_span = 20.0;
    let dt = 1. / 100.;

    // The plant's yaw torque follows the allocator's sign convention.
    let l1 = L1Params {
        invert_yaw_moment: false,
        ..L1Params::default()
    };
    let mut controller = GeometricL1Controller::new(params.clone(), GainSet::crazyflie(), l1)
        .expect("valid crazyflie parameters");

    let start = circle(0.0, 0.5, 1.0);
    let mut plant = ReferencePlant::new(
        params,
        VehicleState {
            velocity: start.velocity,
            ..VehicleState::at_rest(start.position)
        },
    )
    .expect("valid plant")
    // Unmodelled payload: 5 g hanging below the vehicle.
    .with_disturbance(Vector3::new(0.0, 0.0, -0.005 * 9.81), Vector3::zeros());

    let steps = (simulation_span / dt) as usize;
    for k in 0..steps {
        let t = k as f64 * dt;
        let reference = circle(t, 0.5, 1.0);

        let command = match controller.step(t, plant.state(), &reference) {
            Ok(command) => command,
            Err(e) => {
                println!("Controller failed: {}", e);
                return;
            }
        };

        match plant.step_rotor_speeds(&command.rotor_speeds, dt) {
            Ok(new_state) => {
                let p = new_state.position;
                println!("{} {} {}", p.x, p.y, p.z);
            }
            Err(e) => println!("Simulation failed: {}", e),
        }
    }
}
