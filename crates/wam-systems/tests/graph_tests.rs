//! 信号流图集成测试
//!
//! 只使用公开 API：内置系统、连接管理、协作式 tick 和实时线程。

use std::thread;
use std::time::Duration;
use wam_systems::{
    Constant, ExecutionConfig, ExecutionManager, ExposedOutput, Gain, GraphError, Probe, Summer,
};

fn manager() -> ExecutionManager {
    ExecutionManager::new(ExecutionConfig {
        rt_priority: None,
        ..ExecutionConfig::with_period(Duration::from_millis(1))
    })
}

#[test]
fn test_error_amplifier_chain() {
    let em = manager();

    let reference = Constant::new(1.0_f64);
    let measurement = ExposedOutput::<f64>::new("measurement");
    let error = Summer::<f64>::difference();
    let gain = Gain::<f64>::new(0.5);
    let probe = Probe::<f64>::new("command");

    let (r_out, m_out, m_handle) = (reference.output(), measurement.output(), measurement.output());
    let (e_plus, e_minus, e_out) = (
        error.input(0).unwrap(),
        error.input(1).unwrap(),
        error.output(),
    );
    let (g_in, g_out) = (gain.input(), gain.output());
    let (p_in, command) = (probe.input(), probe.output());

    em.add_system(reference);
    let measurement_id = em.add_system(measurement);
    em.add_system(error);
    em.add_system(gain);
    em.add_periodic_system(probe);

    em.connect(&r_out, &e_plus).unwrap();
    em.connect(&m_out, &e_minus).unwrap();
    em.connect(&e_out, &g_in).unwrap();
    em.connect(&g_out, &p_in).unwrap();

    // 测量值未定义：整条链未定义
    em.tick().unwrap();
    assert_eq!(command.value(), None);

    m_handle.set(0.2);
    em.tick().unwrap();
    assert_eq!(command.value(), Some(0.4));

    // 移除测量系统后输入解绑，输出回到未定义
    em.remove_system(measurement_id).unwrap();
    assert!(!em.is_connected(&e_minus));
    em.tick().unwrap();
    assert_eq!(command.value(), None);
}

#[test]
fn test_fan_out_and_cycle_rejection() {
    let em = manager();

    let source = Constant::new(3.0_f64);
    let a = Gain::<f64>::new(2.0);
    let b = Gain::<f64>::new(-1.0);
    let probe_a = Probe::<f64>::new("a");
    let probe_b = Probe::<f64>::new("b");

    let src = source.output();
    let (a_in, a_out) = (a.input(), a.output());
    let (b_in, b_out) = (b.input(), b.output());
    let (pa_in, pa_out) = (probe_a.input(), probe_a.output());
    let (pb_in, pb_out) = (probe_b.input(), probe_b.output());

    em.add_system(source);
    em.add_system(a);
    em.add_system(b);
    em.add_periodic_system(probe_a);
    em.add_periodic_system(probe_b);

    em.connect(&src, &a_in).unwrap();
    em.connect(&a_out, &b_in).unwrap();
    em.connect(&a_out, &pa_in).unwrap();
    em.connect(&b_out, &pb_in).unwrap();

    // b -> a 会形成环
    assert!(matches!(
        em.reconnect(&b_out, &a_in),
        Err(GraphError::Cycle { .. })
    ));
    // 失败的重连不改变原有连接
    em.tick().unwrap();
    assert_eq!(pa_out.value(), Some(6.0));
    assert_eq!(pb_out.value(), Some(-6.0));
}

#[test]
fn test_realtime_thread_lifecycle() {
    let em = manager();
    let source = Constant::new(7_i32);
    let probe = Probe::<i32>::new("p");
    let (src, p_in, p_out) = (source.output(), probe.input(), probe.output());
    em.add_system(source);
    em.add_periodic_system(probe);
    em.connect(&src, &p_in).unwrap();

    em.start().unwrap();
    assert!(em.is_running());
    assert!(em.tick().is_err());
    thread::sleep(Duration::from_millis(30));
    em.stop();

    assert!(!em.is_running());
    assert!(em.stats().ticks > 0);
    assert_eq!(p_out.value(), Some(7));

    // 停止后可以协作式 tick
    em.tick().unwrap();
}
