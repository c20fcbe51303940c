//! 执行管理器
//!
//! 持有信号流图，并以固定周期在专用线程中求值。拓扑修改（注册、移除、
//! 连接、断开）与求值共用同一把图锁：修改要么发生在一次 tick 之前，
//! 要么发生在之后，系统在执行中不会被移除。

use crate::graph::Graph;
use crate::port::{AnyInput, AnyOutput, Input, Output};
use crate::{ExecutionError, GraphError, System, SystemId, TickInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// 默认控制周期（500 Hz）
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(2);

/// 执行管理器配置
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// 名义 tick 周期
    pub period: Duration,
    /// 实时线程优先级（0-99，仅 `realtime` feature 生效；`None` 使用最高优先级）
    pub rt_priority: Option<u8>,
    /// 线程名
    pub thread_name: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            rt_priority: Some(50),
            thread_name: "wam-exec".to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }
}

/// 执行统计（原子计数，线程安全）
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub ticks: AtomicU64,
    /// tick 未能在下一个锚点前完成的次数
    pub overruns: AtomicU64,
    pub max_overrun_ns: AtomicU64,
    pub last_tick_ns: AtomicU64,
    pub max_tick_ns: AtomicU64,
    /// 返回错误的 tick 数
    pub system_errors: AtomicU64,
}

impl ExecutionStats {
    fn record_tick(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ns.store(ns, Ordering::Relaxed);
        self.max_tick_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn record_overrun(&self, late: Duration) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.max_overrun_ns.fetch_max(late.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionStatsSnapshot {
        ExecutionStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            max_overrun_ns: self.max_overrun_ns.load(Ordering::Relaxed),
            last_tick_ns: self.last_tick_ns.load(Ordering::Relaxed),
            max_tick_ns: self.max_tick_ns.load(Ordering::Relaxed),
            system_errors: self.system_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.max_overrun_ns.store(0, Ordering::Relaxed);
        self.last_tick_ns.store(0, Ordering::Relaxed);
        self.max_tick_ns.store(0, Ordering::Relaxed);
        self.system_errors.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStatsSnapshot {
    pub ticks: u64,
    pub overruns: u64,
    pub max_overrun_ns: u64,
    pub last_tick_ns: u64,
    pub max_tick_ns: u64,
    pub system_errors: u64,
}

impl ExecutionStatsSnapshot {
    pub fn max_tick(&self) -> Duration {
        Duration::from_nanos(self.max_tick_ns)
    }
}

#[derive(Default)]
struct Clock {
    tick: u64,
    last: Option<Instant>,
}

struct Core {
    graph: Graph,
    clock: Clock,
}

struct Shared {
    core: Mutex<Core>,
    running: AtomicBool,
    shut_down: AtomicBool,
    config: ExecutionConfig,
    stats: ExecutionStats,
}

impl Shared {
    fn run_once(&self, now: Instant) -> Result<(), ExecutionError> {
        let mut core = self.core.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExecutionError::ShutDown);
        }
        let dt = match core.clock.last {
            Some(last) => now.saturating_duration_since(last),
            None => self.config.period,
        };
        let info = TickInfo {
            tick: core.clock.tick,
            dt,
            now,
        };
        core.clock.tick += 1;
        core.clock.last = Some(now);
        core.graph.tick(&info)
    }
}

/// 执行管理器
pub struct ExecutionManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("period", &self.shared.config.period)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for ExecutionManager {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl ExecutionManager {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    graph: Graph::default(),
                    clock: Clock::default(),
                }),
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                config,
                stats: ExecutionStats::default(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.shared.config.period
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.shared.config
    }

    // ==================== 拓扑 ====================

    /// 注册系统（默认非周期）
    pub fn add_system<S: System + 'static>(&self, system: S) -> SystemId {
        self.shared.core.lock().graph.insert(Box::new(system))
    }

    /// 注册系统并标记为周期
    pub fn add_periodic_system<S: System + 'static>(&self, system: S) -> SystemId {
        let mut core = self.shared.core.lock();
        let id = core.graph.insert(Box::new(system));
        // 刚插入的句柄一定有效
        let _ = core.graph.set_periodic(id, true);
        id
    }

    /// 移除系统，断开其所有连接
    ///
    /// 若实时线程正在 tick，会等待本次 tick 结束。
    pub fn remove_system(&self, id: SystemId) -> Result<Box<dyn System>, GraphError> {
        self.shared.core.lock().graph.remove(id)
    }

    pub fn contains(&self, id: SystemId) -> bool {
        self.shared.core.lock().graph.contains(id)
    }

    pub fn set_periodic(&self, id: SystemId, periodic: bool) -> Result<(), GraphError> {
        self.shared.core.lock().graph.set_periodic(id, periodic)
    }

    pub fn is_periodic(&self, id: SystemId) -> bool {
        self.shared.core.lock().graph.is_periodic(id)
    }

    pub fn system_count(&self) -> usize {
        self.shared.core.lock().graph.system_count()
    }

    pub fn edge_count(&self) -> usize {
        self.shared.core.lock().graph.edge_count()
    }

    /// 连接输出到输入；输入已连接时原子地改接
    pub fn connect<T: Clone + Send + 'static>(
        &self,
        output: &Output<T>,
        input: &Input<T>,
    ) -> Result<(), GraphError> {
        self.connect_ports(output, input)
    }

    /// 类型擦除版本，值类型在运行时检查
    pub fn connect_ports(
        &self,
        output: &dyn AnyOutput,
        input: &dyn AnyInput,
    ) -> Result<(), GraphError> {
        self.shared.core.lock().graph.connect(output, input)
    }

    /// `connect` 的别名：先断开旧连接再接到新输出，中间不出现未连接状态
    pub fn reconnect<T: Clone + Send + 'static>(
        &self,
        output: &Output<T>,
        input: &Input<T>,
    ) -> Result<(), GraphError> {
        self.connect(output, input)
    }

    pub fn disconnect<T: Clone + Send + 'static>(&self, input: &Input<T>) -> Result<(), GraphError> {
        self.disconnect_port(input)
    }

    pub fn disconnect_port(&self, input: &dyn AnyInput) -> Result<(), GraphError> {
        self.shared.core.lock().graph.disconnect(input.key())
    }

    pub fn is_connected(&self, input: &dyn AnyInput) -> bool {
        self.shared.core.lock().graph.is_connected(input.key())
    }

    // ==================== 求值 ====================

    /// 手动执行一次 tick（实时线程运行时不可用）
    pub fn tick(&self) -> Result<(), ExecutionError> {
        if self.is_shut_down() {
            return Err(ExecutionError::ShutDown);
        }
        if self.is_running() {
            return Err(ExecutionError::AlreadyRunning);
        }
        let start = Instant::now();
        let result = self.shared.run_once(start);
        self.shared.stats.record_tick(start.elapsed());
        if result.is_err() {
            self.shared.stats.system_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// 启动实时线程
    pub fn start(&self) -> Result<(), ExecutionError> {
        let mut thread = self.thread.lock();
        if self.is_shut_down() {
            return Err(ExecutionError::ShutDown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(ExecutionError::AlreadyRunning);
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || rt_loop(shared));

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                info!(
                    "Execution manager started (period {:?})",
                    self.shared.config.period
                );
                Ok(())
            },
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(ExecutionError::Spawn(e))
            },
        }
    }

    /// 停止实时线程并等待其退出
    ///
    /// 可以从系统内部（即实时线程上）调用：此时只发出停止请求，不等待。
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };

        if handle.thread().id() == std::thread::current().id() {
            debug!("Execution manager stop requested from its own thread");
            return;
        }

        if handle.join().is_err() {
            error!("Execution thread panicked");
        } else {
            info!("Execution manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 永久关闭：停止实时线程，之后 `tick` / `start` 都返回 [`ExecutionError::ShutDown`]
    ///
    /// 返回时没有正在进行的 tick，图也不会再被求值。会等待图锁，
    /// 不能在系统的 `operate` 内部调用。
    pub fn shut_down(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        // 等待可能正在进行的手动 tick 结束
        drop(self.shared.core.lock());
        info!("Execution manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ExecutionStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }
}

impl Drop for ExecutionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_realtime_priority(_priority: Option<u8>) {
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;
        use tracing::warn;

        let priority = match _priority.map(ThreadPriorityValue::try_from) {
            Some(Ok(value)) => ThreadPriority::Crossplatform(value),
            Some(Err(e)) => {
                warn!("Invalid execution thread priority: {}, using MAX", e);
                ThreadPriority::Max
            },
            None => ThreadPriority::Max,
        };

        match set_current_thread_priority(priority) {
            Ok(_) => {
                info!("Execution thread priority set to {:?} (realtime)", priority);
            },
            Err(e) => {
                warn!(
                    "Failed to set execution thread priority: {:?}. \
                    On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                    e
                );
            },
        }
    }
}

fn rt_loop(shared: Arc<Shared>) {
    set_realtime_priority(shared.config.rt_priority);

    let period = shared.config.period;
    let mut next_tick = Instant::now();
    let mut failing = false;

    while shared.running.load(Ordering::Acquire) {
        let start = Instant::now();
        let result = shared.run_once(start);
        shared.stats.record_tick(start.elapsed());

        match result {
            Ok(()) => {
                if failing {
                    info!("Execution graph recovered");
                }
                failing = false;
            },
            Err(e) => {
                shared.stats.system_errors.fetch_add(1, Ordering::Relaxed);
                // 连续错误只记录第一次
                if !failing {
                    error!("Execution tick failed: {}", e);
                }
                failing = true;
            },
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            spin_sleep::sleep(next_tick - now);
        } else {
            // 不追赶：从当前时刻重新对齐锚点
            shared.stats.record_overrun(now - next_tick);
            next_tick = now;
        }
    }

    debug!("Execution thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::{Callback, Constant, Probe};
    use crate::SystemError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_chain_evaluates_in_one_tick() {
        let em = ExecutionManager::default();
        let source = Constant::new(2.0_f64);
        let double = Callback::new("double", |x: &f64| x * 2.0);
        let sink = Probe::<f64>::new("sink");

        let (src_out, dbl_in, dbl_out, sink_in, sink_out) = (
            source.output(),
            double.input(),
            double.output(),
            sink.input(),
            sink.output(),
        );

        // 注册顺序与数据流方向相反
        let sink_id = em.add_system(sink);
        em.add_system(double);
        em.add_system(source);
        em.set_periodic(sink_id, true).unwrap();

        em.connect(&src_out, &dbl_in).unwrap();
        em.connect(&dbl_out, &sink_in).unwrap();

        em.tick().unwrap();
        assert_eq!(sink_out.value(), Some(4.0));
    }

    #[test]
    fn test_reconnect_leaves_single_edge() {
        let em = ExecutionManager::default();
        let a = Constant::new(1_i32);
        let b = Constant::new(2_i32);
        let sink = Probe::<i32>::new("sink");
        let (a_out, b_out, sink_in, sink_out) = (a.output(), b.output(), sink.input(), sink.output());
        em.add_system(a);
        em.add_system(b);
        let sink_id = em.add_periodic_system(sink);

        em.connect(&a_out, &sink_in).unwrap();
        em.reconnect(&b_out, &sink_in).unwrap();
        assert_eq!(em.edge_count(), 1);
        em.tick().unwrap();
        assert_eq!(sink_out.value(), Some(2));

        em.disconnect(&sink_in).unwrap();
        assert_eq!(em.edge_count(), 0);
        assert_eq!(em.disconnect(&sink_in), Err(GraphError::NotConnected));

        // 未连接时 Probe 的输出变为未定义
        em.tick().unwrap();
        assert_eq!(sink_out.value(), None);
        assert!(em.is_periodic(sink_id));
    }

    #[test]
    fn test_connect_ports_checks_type() {
        let em = ExecutionManager::default();
        let a = Constant::new(1_i32);
        let sink = Probe::<f64>::new("sink");
        let (a_out, sink_in) = (a.output(), sink.input());
        em.add_system(a);
        em.add_system(sink);

        let err = em.connect_ports(&a_out, &sink_in).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert!(!em.is_connected(&sink_in));
    }

    #[test]
    fn test_unregistered_systems_do_not_run() {
        struct Counter(Arc<AtomicUsize>);
        impl System for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let em = ExecutionManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = em.add_system(Counter(count.clone()));

        em.tick().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        em.set_periodic(id, true).unwrap();
        em.tick().unwrap();
        em.tick().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        em.remove_system(id).unwrap();
        em.tick().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(em.system_count(), 0);
    }

    #[test]
    fn test_failing_system_does_not_stop_others() {
        struct Fails;
        impl System for Fails {
            fn name(&self) -> &str {
                "fails"
            }
            fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
                Err(SystemError::MissingInput("x"))
            }
        }

        let em = ExecutionManager::default();
        let sink = Probe::<i32>::new("sink");
        let c = Constant::new(7_i32);
        let (c_out, sink_in, sink_out) = (c.output(), sink.input(), sink.output());
        em.add_periodic_system(Fails);
        em.add_system(c);
        em.add_periodic_system(sink);
        em.connect(&c_out, &sink_in).unwrap();

        let err = em.tick().unwrap_err();
        assert!(matches!(err, ExecutionError::System { ref name, .. } if name == "fails"));
        assert_eq!(sink_out.value(), Some(7));
        assert_eq!(em.stats().system_errors, 1);
    }

    #[test]
    fn test_dt_is_measured_between_ticks() {
        struct Recorder(Arc<Mutex<Vec<TickInfo>>>);
        impl System for Recorder {
            fn name(&self) -> &str {
                "recorder"
            }
            fn operate(&mut self, tick: &TickInfo) -> Result<(), SystemError> {
                self.0.lock().push(*tick);
                Ok(())
            }
        }

        let em = ExecutionManager::new(ExecutionConfig::with_period(Duration::from_millis(5)));
        let log = Arc::new(Mutex::new(Vec::new()));
        em.add_periodic_system(Recorder(log.clone()));

        em.tick().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        em.tick().unwrap();

        let log = log.lock();
        assert_eq!(log[0].tick, 0);
        assert_eq!(log[0].dt, Duration::from_millis(5));
        assert_eq!(log[1].tick, 1);
        assert!(log[1].dt >= Duration::from_millis(20));
    }

    #[test]
    fn test_start_stop() {
        let em = ExecutionManager::new(ExecutionConfig::with_period(Duration::from_millis(1)));
        let c = Constant::new(1_i32);
        em.add_periodic_system(c);

        em.start().unwrap();
        assert!(em.is_running());
        assert!(matches!(em.start(), Err(ExecutionError::AlreadyRunning)));
        assert!(matches!(em.tick(), Err(ExecutionError::AlreadyRunning)));

        std::thread::sleep(Duration::from_millis(50));
        em.stop();
        assert!(!em.is_running());

        let ticks = em.stats().ticks;
        assert!(ticks > 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(em.stats().ticks, ticks);

        // 停止后可以手动 tick，也可以再次启动
        em.tick().unwrap();
        em.start().unwrap();
        em.stop();
    }

    #[test]
    fn test_shut_down_is_permanent() {
        let em = ExecutionManager::new(ExecutionConfig {
            rt_priority: None,
            ..ExecutionConfig::with_period(Duration::from_millis(1))
        });
        let source = Constant::new(1_i32);
        let probe = Probe::<i32>::new("p");
        let (src, p_in, p_out) = (source.output(), probe.input(), probe.output());
        em.add_system(source);
        em.add_periodic_system(probe);
        em.connect(&src, &p_in).unwrap();

        em.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        em.shut_down();
        assert!(!em.is_running());
        assert!(em.is_shut_down());

        let ticks = em.stats().ticks;
        assert!(ticks > 0);
        assert!(matches!(em.tick(), Err(ExecutionError::ShutDown)));
        assert!(matches!(em.start(), Err(ExecutionError::ShutDown)));
        assert_eq!(em.stats().ticks, ticks);
        assert_eq!(p_out.value(), Some(1));

        // 重复关闭无副作用
        em.shut_down();
    }

    #[test]
    fn test_slow_system_counts_overruns() {
        struct Slow;
        impl System for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
                std::thread::sleep(Duration::from_millis(3));
                Ok(())
            }
        }

        let em = ExecutionManager::new(ExecutionConfig::with_period(Duration::from_millis(1)));
        em.add_periodic_system(Slow);
        em.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        em.stop();

        let stats = em.stats();
        assert!(stats.overruns > 0);
        assert!(stats.max_overrun_ns > 0);
        assert!(stats.max_tick() >= Duration::from_millis(3));
    }

    #[test]
    fn test_remove_while_running() {
        let em = ExecutionManager::new(ExecutionConfig::with_period(Duration::from_millis(1)));
        let c = Constant::new(3_i32);
        let sink = Probe::<i32>::new("sink");
        let (c_out, sink_in) = (c.output(), sink.input());
        em.add_system(c);
        let sink_id = em.add_periodic_system(sink);
        em.connect(&c_out, &sink_in).unwrap();

        em.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        em.remove_system(sink_id).unwrap();
        assert_eq!(em.edge_count(), 0);
        std::thread::sleep(Duration::from_millis(10));
        em.stop();
        assert_eq!(em.stats().system_errors, 0);
    }
}
