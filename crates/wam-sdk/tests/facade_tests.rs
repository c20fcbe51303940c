//! 门面层测试：通过 prelude 搭一个完整的控制回路

use std::thread;
use std::time::Duration;
use wam_bus::mock::SimulatedBus;
use wam_sdk::prelude::*;
use wam_sdk::protocol::PACKED_TORQUE_MAX;

fn config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.enumeration.reply_timeout_ms = 2;
    config.execution.rt_priority = None;
    config
}

#[test]
fn test_track_constant_reference() {
    let sim = SimulatedBus::wam(4);
    let mut pm = wam_sdk::connect_with(sim.adapter(), config()).unwrap();
    sim.set_safety_mode(2);

    let wam = pm.get_wam4(false).unwrap();
    let em = pm.get_execution_manager();
    assert!(em.is_running());

    let reference = Constant::new(JointVector::<4>::new(0.1, 0.0, 0.0, 0.0));
    let reference_out = reference.output();
    em.add_system(reference);
    wam.track_reference(&reference_out).unwrap();

    // 第一关节误差 0.1 rad，Kp = 900 Nm/rad：饱和
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.property(1, Property::T), Some(PACKED_TORQUE_MAX));
    assert_eq!(sim.property(2, Property::T), Some(0));

    wam.idle().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sim.property(1, Property::T), Some(0));
}

#[test]
fn test_user_graph_runs_alongside_wam() {
    let sim = SimulatedBus::wam(4);
    let mut pm = wam_sdk::connect_with(sim.adapter(), config()).unwrap();
    let wam = pm.get_wam4(false).unwrap();
    let em = pm.get_execution_manager();

    let gain = Gain::<JointVector<4>>::new(2.0);
    let (gain_in, gain_out) = (gain.input(), gain.output());
    let probe = Probe::<JointVector<4>>::new("doubled");
    let (probe_in, probe_out) = (probe.input(), probe.output());
    em.add_system(gain);
    let probe_id = em.add_system(probe);
    em.set_periodic(probe_id, true).unwrap();

    em.connect(&wam.joint_position_output(), &gain_in).unwrap();
    em.connect(&gain_out, &probe_in).unwrap();

    sim.set_property(3, Property::P, 2048);
    thread::sleep(Duration::from_millis(50));
    let doubled = probe_out.value().unwrap();
    assert!((doubled[2] - 2.0 * std::f64::consts::PI).abs() < 1e-9);
}
