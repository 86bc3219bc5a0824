use nalgebra::Vector3;
use uav_l1::dynamics::ReferencePlant;
use uav_l1::{
    Controller, FlatReference, GainSet, GeometricL1Controller, L1Params, VehicleParams,
    VehicleState,
};

// Hold 1 m altitude against a constant downward push, with and without the
// adaptive layer, and print the altitude of both vehicles.
fn main() {
    env_logger::init();

    let params = VehicleParams::hummingbird();
    let target = Vector3::new(0.0, 0.0, 1.0);
    let reference = FlatReference::hover(target, 0.0);
    let disturbance = Vector3::new(0.0, 0.0, -2.0);
    let dt = 0.01;

    // The plant's yaw torque follows the allocator's sign convention.
    let l1 = L1Params {
        invert_yaw_moment: false,
        ..L1Params::default()
    };
    let mut adaptive = GeometricL1Controller::new(params.clone(), GainSet::hummingbird(), l1)
        .expect("valid hummingbird parameters");
    let mut baseline = GeometricL1Controller::baseline_only(params.clone(), GainSet::hummingbird())
        .expect("valid hummingbird parameters");

    let plant = |p: &VehicleParams| {
        ReferencePlant::new(p.clone(), VehicleState::at_rest(target))
            .expect("valid plant")
            .with_disturbance(disturbance, Vector3::zeros())
    };
    let mut plant_l1 = plant(&params);
    let mut plant_baseline = plant(&params);

    println!("t z_l1 z_baseline sigma_thrust");
    for k in 0..600 {
        let t = k as f64 * dt;

        let command = match adaptive.step(t, plant_l1.state(), &reference) {
            Ok(command) => command,
            Err(e) => {
                println!("L1 controller failed: {}", e);
                return;
            }
        };
        let sigma = command.matched_uncertainty.map_or(0.0, |s| s[0]);
        if let Err(e) = plant_l1.step_rotor_speeds(&command.rotor_speeds, dt) {
            println!("Simulation failed: {}", e);
            return;
        }

        let command = match baseline.step(t, plant_baseline.state(), &reference) {
            Ok(command) => command,
            Err(e) => {
                println!("baseline controller failed: {}", e);
                return;
            }
        };
        if let Err(e) = plant_baseline.step_rotor_speeds(&command.rotor_speeds, dt) {
            println!("Simulation failed: {}", e);
            return;
        }

        if k % 10 == 0 {
            println!(
                "{:.2} {:.4} {:.4} {:.4}",
                t,
                plant_l1.state().position.z,
                plant_baseline.state().position.z,
                sigma
            );
        }
    }
}
