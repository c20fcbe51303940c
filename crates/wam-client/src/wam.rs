//! WAM 控制对象
//!
//! `Wam<DOF>` 在执行管理器中注册三个系统：
//!
//! ```text
//!                        ┌──────────────────┐
//!  JointPositionSource ──┤ feedback         │
//!  (组读取 P，非阻塞)     │ JointPositionHold├── torque ──┐
//!  hold setpoint ────────┤ reference        │            │
//!                        └──────────────────┘            ▼
//!                                              JointTorqueSink（打包写 T）
//! ```
//!
//! 力矩输入平时未连接（零力矩）。`hold_position` / `track_reference` /
//! `set_joint_torques` 改接力矩输入；`idle` 断开。
//!
//! 关节量与电机量按单位传动换算：`rad = counts / CTS * 2π`，
//! `counts = Nm * IPNM`。

use crate::generation::{EstopLatch, GenerationToken};
use crate::safety::{SafetyMode, SafetyModule};
use crate::{ClientError, ManagerConfig, Result};
use nalgebra::SVector;
use parking_lot::Mutex;
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use wam_bus::Wait;
use wam_driver::{
    CombinedPosition, DriverError, GroupReplies, Puck, PuckGroup, ReplyRoute, ReplyWatchdog,
};
use wam_protocol::{CombinedPositionParser, PACKED_TORQUES_PER_FRAME, Property, groups};
use wam_systems::{
    ExecutionManager, ExposedOutput, GraphError, Input, Output, PortList, System, SystemError,
    SystemId, TickInfo,
};

/// 关节向量
pub type JointVector<const DOF: usize> = SVector<f64, DOF>;

/// 反馈链路故障锁存
#[derive(Debug, Default)]
pub struct FaultLatch {
    reason: Mutex<Option<String>>,
}

impl FaultLatch {
    /// 锁存故障；只保留第一次的原因
    pub fn latch(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            let reason = reason.into();
            error!("WAM faulted: {}", reason);
            *slot = Some(reason);
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn is_faulted(&self) -> bool {
        self.reason.lock().is_some()
    }
}

// ==================== 系统 ====================

/// 关节位置反馈
///
/// 每个 tick 先非阻塞地收集上一 tick 请求的应答，再发出新的请求。
/// 缺失成员沿用上次的值；连续缺失由看门狗升级为故障。
pub struct JointPositionSource<const DOF: usize> {
    group: PuckGroup,
    p_id: u8,
    counts_per_rad: [f64; DOF],
    replies: GroupReplies<CombinedPosition>,
    last: JointVector<DOF>,
    pending: bool,
    watchdog: Arc<ReplyWatchdog>,
    fault: Arc<FaultLatch>,
    output: Output<JointVector<DOF>>,
}

impl<const DOF: usize> JointPositionSource<DOF> {
    fn new(
        group: PuckGroup,
        p_id: u8,
        counts_per_rad: [f64; DOF],
        initial: JointVector<DOF>,
        watchdog: Arc<ReplyWatchdog>,
        fault: Arc<FaultLatch>,
    ) -> Self {
        Self {
            replies: GroupReplies::from_elem(None, group.len()),
            group,
            p_id,
            counts_per_rad,
            last: initial,
            pending: false,
            watchdog,
            fault,
            output: Output::with_initial(initial),
        }
    }

    pub fn output(&self) -> Output<JointVector<DOF>> {
        self.output.clone()
    }

    fn collect(&mut self) -> std::result::Result<(), DriverError> {
        let received = self.group.receive_replies_into(
            &CombinedPositionParser,
            ReplyRoute::PositionGroup,
            Wait::NonBlocking,
            &mut self.replies,
        )?;
        for (i, reply) in self.replies.iter().enumerate() {
            if let Some((primary, _)) = reply {
                self.last[i] = *primary as f64 / self.counts_per_rad[i];
            }
        }
        if received > 0 {
            self.output.set(self.last);
        }
        self.watchdog.record(received == DOF)
    }
}

impl<const DOF: usize> System for JointPositionSource<DOF> {
    fn name(&self) -> &str {
        "joint_position_source"
    }

    fn outputs(&self) -> PortList {
        PortList::from_elem(self.output.key(), 1)
    }

    fn operate(&mut self, _tick: &TickInfo) -> std::result::Result<(), SystemError> {
        let bus = self.group.bus().clone();
        let _guard = bus.lock();

        let collected = if self.pending {
            self.collect()
        } else {
            Ok(())
        };

        self.group
            .send_get_request(self.p_id)
            .map_err(SystemError::failed)?;
        self.pending = true;

        collected.map_err(|e| {
            if matches!(e, DriverError::ReplyLost { .. }) {
                self.fault.latch(e.to_string());
            }
            SystemError::failed(e)
        })
    }
}

/// 关节力矩输出
///
/// 输入未连接或未定义、已锁存急停、或所属代数已失效时写零力矩。
pub struct JointTorqueSink<const DOF: usize> {
    lower: PuckGroup,
    upper: Option<PuckGroup>,
    t_id: u8,
    counts_per_nm: [f64; DOF],
    estop: Arc<EstopLatch>,
    generation: GenerationToken,
    input: Input<JointVector<DOF>>,
}

impl<const DOF: usize> JointTorqueSink<DOF> {
    pub fn input(&self) -> Input<JointVector<DOF>> {
        self.input.clone()
    }

    fn to_counts(&self, torques: &JointVector<DOF>, out: &mut [i32; DOF]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (torques[i] * self.counts_per_nm[i]).round() as i32;
        }
    }
}

impl<const DOF: usize> System for JointTorqueSink<DOF> {
    fn name(&self) -> &str {
        "joint_torque_sink"
    }

    fn inputs(&self) -> PortList {
        PortList::from_elem(self.input.key(), 1)
    }

    fn operate(&mut self, _tick: &TickInfo) -> std::result::Result<(), SystemError> {
        let mut counts = [0i32; DOF];
        if !self.estop.is_set()
            && self.generation.is_current()
            && let Some(torques) = self.input.value()
        {
            self.to_counts(&torques, &mut counts);
        }

        let split = self.lower.len();
        self.lower
            .set_packed_torques(self.t_id, &counts[..split])
            .map_err(SystemError::failed)?;
        if let Some(upper) = &self.upper {
            upper
                .set_packed_torques(self.t_id, &counts[split..])
                .map_err(SystemError::failed)?;
        }
        Ok(())
    }
}

/// 关节位置保持（PD）
///
/// `τ = Kp ∘ e + Kd ∘ ė`，`e = reference - feedback`。
/// 任一输入未定义时输出未定义，微分项重新开始。
pub struct JointPositionHold<const DOF: usize> {
    kp: JointVector<DOF>,
    kd: JointVector<DOF>,
    last_error: Option<JointVector<DOF>>,
    feedback: Input<JointVector<DOF>>,
    reference: Input<JointVector<DOF>>,
    output: Output<JointVector<DOF>>,
}

impl<const DOF: usize> JointPositionHold<DOF> {
    pub fn new(kp: JointVector<DOF>, kd: JointVector<DOF>) -> Self {
        Self {
            kp,
            kd,
            last_error: None,
            feedback: Input::new(),
            reference: Input::new(),
            output: Output::new(),
        }
    }

    pub fn feedback(&self) -> Input<JointVector<DOF>> {
        self.feedback.clone()
    }

    pub fn reference(&self) -> Input<JointVector<DOF>> {
        self.reference.clone()
    }

    pub fn output(&self) -> Output<JointVector<DOF>> {
        self.output.clone()
    }
}

impl<const DOF: usize> System for JointPositionHold<DOF> {
    fn name(&self) -> &str {
        "joint_position_hold"
    }

    fn inputs(&self) -> PortList {
        PortList::from_slice(&[self.feedback.key(), self.reference.key()])
    }

    fn outputs(&self) -> PortList {
        PortList::from_elem(self.output.key(), 1)
    }

    fn operate(&mut self, tick: &TickInfo) -> std::result::Result<(), SystemError> {
        let (Some(feedback), Some(reference)) = (self.feedback.value(), self.reference.value())
        else {
            self.last_error = None;
            self.output.clear();
            return Ok(());
        };

        let error = reference - feedback;
        let dt = tick.dt_secs();
        let rate = match self.last_error {
            Some(last) if dt > 0.0 => (error - last) / dt,
            _ => JointVector::<DOF>::zeros(),
        };
        self.last_error = Some(error);

        self.output
            .set(self.kp.component_mul(&error) + self.kd.component_mul(&rate));
        Ok(())
    }
}

// ==================== Wam ====================

/// WAM 控制对象
pub struct Wam<const DOF: usize> {
    em: Arc<ExecutionManager>,
    safety: Option<Arc<SafetyModule>>,
    estop: Arc<EstopLatch>,
    generation: GenerationToken,
    fault: Arc<FaultLatch>,
    watchdog: Arc<ReplyWatchdog>,
    counts_per_rad: [f64; DOF],

    positions: Output<JointVector<DOF>>,
    torque_input: Input<JointVector<DOF>>,
    hold_reference: Input<JointVector<DOF>>,
    hold_output: Output<JointVector<DOF>>,
    hold_setpoint: Output<JointVector<DOF>>,
    torque_command: Output<JointVector<DOF>>,

    systems: Vec<SystemId>,
}

impl<const DOF: usize> std::fmt::Debug for Wam<DOF> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wam")
            .field("dof", &DOF)
            .field("generation", &self.generation.value())
            .field("fault", &self.fault.reason())
            .finish()
    }
}

impl<const DOF: usize> Wam<DOF> {
    /// 在 `pucks`（关节顺序，ID 1..=DOF，已唤醒）上构建 WAM 并注册系统
    pub(crate) fn new(
        em: Arc<ExecutionManager>,
        pucks: &[&Puck],
        safety: Option<Arc<SafetyModule>>,
        estop: Arc<EstopLatch>,
        generation: GenerationToken,
        config: &ManagerConfig,
    ) -> Result<Self> {
        if pucks.len() != DOF {
            return Err(DriverError::InvalidInput(format!(
                "WAM{} needs {} pucks, got {}",
                DOF,
                DOF,
                pucks.len()
            ))
            .into());
        }

        let mut counts_per_rad = [0.0; DOF];
        let mut counts_per_nm = [0.0; DOF];
        for (i, puck) in pucks.iter().enumerate() {
            let cts = puck.get_property(Property::Cts)?;
            if cts <= 0 {
                return Err(ClientError::Protocol(wam_protocol::ProtocolError::InvalidValue {
                    field: "CTS",
                    value: cts,
                }));
            }
            counts_per_rad[i] = cts as f64 / TAU;
            counts_per_nm[i] = puck.get_property(Property::Ipnm)? as f64;
        }

        let whole = PuckGroup::new(groups::WAM, pucks)?;
        let split = DOF.min(PACKED_TORQUES_PER_FRAME);
        let lower = PuckGroup::new(groups::LOWER_WAM, &pucks[..split])?;
        let upper = if DOF > split {
            Some(PuckGroup::new(groups::UPPER_WAM, &pucks[split..])?)
        } else {
            None
        };
        let p_id = whole.property_id(Property::P)?;
        let t_id = lower.property_id(Property::T)?;
        if let Some(upper) = &upper {
            upper.property_id(Property::T)?;
        }

        // 同步读取一次位置，作为反馈输出的初值
        let reply_timeout = pucks[0].reply_timeout();
        let mut replies: GroupReplies<CombinedPosition> = GroupReplies::from_elem(None, DOF);
        whole.get_positions_into(p_id, Wait::Timeout(reply_timeout), &mut replies)?;
        let mut initial = JointVector::<DOF>::zeros();
        for (i, reply) in replies.iter().copied().enumerate() {
            let (primary, _) = reply.ok_or(DriverError::Timeout {
                id: pucks[i].id(),
                timeout: reply_timeout,
            })?;
            initial[i] = primary as f64 / counts_per_rad[i];
        }

        let (kp, kd) = config.hold_gains(DOF)?;
        let kp = JointVector::<DOF>::from_column_slice(&kp);
        let kd = JointVector::<DOF>::from_column_slice(&kd);

        let watchdog = Arc::new(ReplyWatchdog::new(config.wam.max_consecutive_misses));
        let fault = Arc::new(FaultLatch::default());

        let source = JointPositionSource::new(
            whole,
            p_id,
            counts_per_rad,
            initial,
            watchdog.clone(),
            fault.clone(),
        );
        let sink = JointTorqueSink {
            lower,
            upper,
            t_id,
            counts_per_nm,
            estop: estop.clone(),
            generation: generation.clone(),
            input: Input::new(),
        };
        let hold = JointPositionHold::new(kp, kd);
        let setpoint = ExposedOutput::with_initial("hold_setpoint", initial);
        let command = ExposedOutput::new("torque_command");

        let positions = source.output();
        let torque_input = sink.input();
        let (hold_feedback, hold_reference, hold_output) =
            (hold.feedback(), hold.reference(), hold.output());
        let hold_setpoint = setpoint.output();
        let torque_command = command.output();

        let systems = vec![
            em.add_periodic_system(source),
            em.add_periodic_system(sink),
            em.add_system(hold),
            em.add_system(setpoint),
            em.add_system(command),
        ];

        let wam = Self {
            em,
            safety,
            estop,
            generation,
            fault,
            watchdog,
            counts_per_rad,
            positions,
            torque_input,
            hold_reference,
            hold_output,
            hold_setpoint,
            torque_command,
            systems,
        };
        wam.em.connect(&wam.positions, &hold_feedback)?;
        wam.em.connect(&wam.hold_setpoint, &wam.hold_reference)?;

        info!("WAM{} ready (generation {})", DOF, wam.generation.value());
        Ok(wam)
    }

    pub fn dof(&self) -> usize {
        DOF
    }

    pub fn generation(&self) -> u64 {
        self.generation.value()
    }

    pub fn execution_manager(&self) -> &Arc<ExecutionManager> {
        &self.em
    }

    pub fn counts_per_rad(&self) -> &[f64; DOF] {
        &self.counts_per_rad
    }

    /// 反馈链路故障原因（已锁存时）
    pub fn fault(&self) -> Option<String> {
        self.fault.reason()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_faulted()
    }

    pub fn reply_watchdog(&self) -> &ReplyWatchdog {
        &self.watchdog
    }

    /// 关节位置输出端口，用于连接用户系统
    pub fn joint_position_output(&self) -> Output<JointVector<DOF>> {
        self.positions.clone()
    }

    /// 最新的关节位置（rad）
    pub fn joint_positions(&self) -> Result<JointVector<DOF>> {
        self.generation.check()?;
        self.positions
            .value()
            .ok_or_else(|| ClientError::Faulted("no joint position feedback".into()))
    }

    /// 运动调用前的检查：代数、急停、故障锁存、安全模式
    fn check_motion(&self) -> Result<()> {
        self.generation.check()?;
        if self.estop.is_set() {
            return Err(ClientError::EmergencyStop);
        }
        if let Some(reason) = self.fault.reason() {
            return Err(ClientError::Faulted(reason));
        }
        if let Some(safety) = &self.safety {
            match safety.mode()? {
                SafetyMode::Active => {},
                SafetyMode::Estop => return Err(ClientError::EmergencyStop),
                mode => return Err(ClientError::MotionNotAllowed(mode)),
            }
        }
        Ok(())
    }

    fn drive_with(&self, output: &Output<JointVector<DOF>>) -> Result<()> {
        self.em.reconnect(output, &self.torque_input)?;
        Ok(())
    }

    /// 保持当前位置
    pub fn hold_position(&self) -> Result<()> {
        self.check_motion()?;
        let here = self.joint_positions()?;
        self.hold_setpoint.set(here);
        self.em.reconnect(&self.hold_setpoint, &self.hold_reference)?;
        self.drive_with(&self.hold_output)?;
        debug!("WAM{} holding position {:?}", DOF, here.as_slice());
        Ok(())
    }

    /// 跟踪用户系统给出的关节位置参考
    pub fn track_reference(&self, reference: &Output<JointVector<DOF>>) -> Result<()> {
        self.check_motion()?;
        self.em.reconnect(reference, &self.hold_reference)?;
        self.drive_with(&self.hold_output)?;
        Ok(())
    }

    /// 直接给定关节力矩（Nm）
    pub fn set_joint_torques(&self, torques: JointVector<DOF>) -> Result<()> {
        self.check_motion()?;
        if torques.iter().any(|t| !t.is_finite()) {
            return Err(DriverError::InvalidInput("non-finite joint torque".into()).into());
        }
        self.torque_command.set(torques);
        self.drive_with(&self.torque_command)
    }

    /// 断开力矩输入（零力矩）
    ///
    /// 不检查安全状态：急停后也可以调用。
    pub fn idle(&self) -> Result<()> {
        self.generation.check()?;
        match self.em.disconnect(&self.torque_input) {
            Ok(()) | Err(GraphError::NotConnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 力矩输入当前是否有上游
    pub fn is_driven(&self) -> bool {
        self.em.is_connected(&self.torque_input)
    }
}

impl<const DOF: usize> Drop for Wam<DOF> {
    fn drop(&mut self) {
        for id in self.systems.drain(..) {
            if let Err(e) = self.em.remove_system(id) {
                warn!("Failed to remove WAM system: {}", e);
            }
        }
    }
}
