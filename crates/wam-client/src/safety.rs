//! 安全模块
//!
//! 安全模块（ID 10）是独立于主机的硬件互锁。主机只能查询和请求模式切换；
//! 急停（ESTOP）由硬件触发，主机观测到后锁存，之后所有运动调用失败，
//! 直到产品管理器完成急停清理。

use crate::generation::EstopLatch;
use crate::{ClientError, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wam_bus::{CommunicationsBus, Wait};
use wam_driver::{DriverError, Puck, get_property_raw, set_property_acked, set_property_raw};
use wam_protocol::{Property, ProtocolError};

/// 限值在线上的缩放系数
const LIMIT_SCALE: f64 = 1000.0;

/// 安全模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SafetyMode {
    Estop = 0,
    Idle = 1,
    Active = 2,
    Activating = 3,
    Deactivating = 4,
}

impl SafetyMode {
    pub fn name(self) -> &'static str {
        match self {
            SafetyMode::Estop => "ESTOP",
            SafetyMode::Idle => "IDLE",
            SafetyMode::Active => "ACTIVE",
            SafetyMode::Activating => "ACTIVATING",
            SafetyMode::Deactivating => "DEACTIVATING",
        }
    }
}

impl std::fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct SafetyPropertyIds {
    mode: u8,
    zero: u8,
    vl2: u8,
    tl2: u8,
}

/// 安全模块
pub struct SafetyModule {
    bus: Arc<dyn CommunicationsBus>,
    id: u8,
    reply_timeout: Duration,
    ids: SafetyPropertyIds,
    estop: Arc<EstopLatch>,
}

impl std::fmt::Debug for SafetyModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyModule")
            .field("id", &self.id)
            .field("estop_observed", &self.estop.is_set())
            .finish()
    }
}

impl SafetyModule {
    /// # 错误
    /// - `Driver(Protocol(UnsupportedProperty))`: 节点不是处于 READY 状态的安全模块
    pub fn new(puck: &Puck, estop: Arc<EstopLatch>) -> Result<Self> {
        let ids = SafetyPropertyIds {
            mode: puck.require_property_id(Property::Mode)?,
            zero: puck.require_property_id(Property::Zero)?,
            vl2: puck.require_property_id(Property::Vl2)?,
            tl2: puck.require_property_id(Property::Tl2)?,
        };
        Ok(Self {
            bus: puck.bus().clone(),
            id: puck.id(),
            reply_timeout: puck.reply_timeout(),
            ids,
            estop,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn estop_latch(&self) -> &Arc<EstopLatch> {
        &self.estop
    }

    /// 是否已观测到急停（锁存值，不访问总线）
    pub fn estop_observed(&self) -> bool {
        self.estop.is_set()
    }

    fn get(&self, prop_id: u8) -> Result<i32> {
        Ok(get_property_raw(
            &*self.bus,
            self.id,
            prop_id,
            Wait::Timeout(self.reply_timeout),
        )?)
    }

    /// 查询当前模式；观测到 ESTOP 时锁存
    pub fn mode(&self) -> Result<SafetyMode> {
        let raw = self.get(self.ids.mode)?;
        let mode = SafetyMode::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
            field: "MODE",
            value: raw,
        })?;
        if mode == SafetyMode::Estop && !self.estop.set() {
            warn!("E-stop observed on safety module {}", self.id);
        }
        Ok(mode)
    }

    /// 请求模式切换
    pub fn set_mode(&self, mode: SafetyMode) -> Result<()> {
        info!("Requesting safety mode {}", mode);
        set_property_acked(
            &*self.bus,
            self.id,
            self.ids.mode,
            mode.into(),
            self.reply_timeout,
        )?;
        Ok(())
    }

    /// 轮询等待目标模式
    ///
    /// - `poll_realtime`: 为真时单次查询超时视为暂时现象继续轮询
    ///   （执行线程占用总线时可能出现）；为假时立即返回错误
    /// - `timeout`: `None` 表示一直等待
    ///
    /// 超时返回 `Ok(false)`。
    pub fn wait_for_mode(
        &self,
        target: SafetyMode,
        poll_realtime: bool,
        poll_period: Duration,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        debug!("Waiting for safety mode {}", target);

        loop {
            match self.mode() {
                Ok(mode) if mode == target => return Ok(true),
                Ok(_) => {},
                Err(ClientError::Driver(e)) if poll_realtime && e.is_timeout() => {
                    debug!("Safety module {} did not answer, retrying", self.id);
                },
                Err(e) => return Err(e),
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                thread::sleep(poll_period.min(deadline - now));
            } else {
                thread::sleep(poll_period);
            }
        }
    }

    /// WAM 是否已归零
    pub fn is_wam_zeroed(&self) -> Result<bool> {
        Ok(self.get(self.ids.zero)? != 0)
    }

    /// 速度故障阈值（m/s）
    pub fn velocity_limit(&self) -> Result<f64> {
        Ok(self.get(self.ids.vl2)? as f64 / LIMIT_SCALE)
    }

    pub fn set_velocity_limit(&self, limit: f64) -> Result<()> {
        self.set_limit(self.ids.vl2, "velocity", limit)
    }

    /// 力矩故障阈值
    pub fn torque_limit(&self) -> Result<f64> {
        Ok(self.get(self.ids.tl2)? as f64 / LIMIT_SCALE)
    }

    pub fn set_torque_limit(&self, limit: f64) -> Result<()> {
        self.set_limit(self.ids.tl2, "torque", limit)
    }

    fn set_limit(&self, prop_id: u8, what: &str, limit: f64) -> Result<()> {
        let scaled = limit * LIMIT_SCALE;
        if !scaled.is_finite() || scaled < 0.0 || scaled > i32::MAX as f64 {
            return Err(DriverError::InvalidInput(format!(
                "{} limit {} is out of range",
                what, limit
            ))
            .into());
        }
        debug!("Setting {} limit to {}", what, limit);
        set_property_raw(&*self.bus, self.id, prop_id, scaled.round() as i32)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wam_bus::BusManager;
    use wam_bus::mock::{SimPuck, SimulatedBus};

    fn setup() -> (SimulatedBus, SafetyModule) {
        let sim = SimulatedBus::new();
        sim.add_puck(SimPuck::safety(10));
        let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(sim.adapter()));
        let puck = Puck::new(bus, 10, Duration::from_millis(20)).unwrap();
        let sm = SafetyModule::new(&puck, Arc::new(EstopLatch::new())).unwrap();
        (sim, sm)
    }

    #[test]
    fn test_mode_and_estop_latch() {
        let (sim, sm) = setup();
        assert_eq!(sm.mode().unwrap(), SafetyMode::Idle);
        assert!(!sm.estop_observed());

        sim.set_safety_mode(0);
        assert_eq!(sm.mode().unwrap(), SafetyMode::Estop);
        assert!(sm.estop_observed());

        // 锁存：恢复后仍保持
        sim.set_safety_mode(1);
        assert_eq!(sm.mode().unwrap(), SafetyMode::Idle);
        assert!(sm.estop_observed());
    }

    #[test]
    fn test_unknown_mode_value() {
        let (sim, sm) = setup();
        sim.set_safety_mode(9);
        assert!(matches!(
            sm.mode(),
            Err(ClientError::Protocol(ProtocolError::InvalidValue { value: 9, .. }))
        ));
    }

    #[test]
    fn test_wait_for_mode_timeout_and_success() {
        let (sim, sm) = setup();
        let reached = sm
            .wait_for_mode(
                SafetyMode::Active,
                false,
                Duration::from_millis(5),
                Some(Duration::from_millis(30)),
            )
            .unwrap();
        assert!(!reached);

        let sim2 = sim.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sim2.set_safety_mode(2);
        });
        let reached = sm
            .wait_for_mode(
                SafetyMode::Active,
                true,
                Duration::from_millis(5),
                Some(Duration::from_secs(2)),
            )
            .unwrap();
        handle.join().unwrap();
        assert!(reached);
    }

    #[test]
    fn test_set_mode() {
        let (sim, sm) = setup();
        sm.set_mode(SafetyMode::Active).unwrap();
        assert_eq!(sim.property(10, Property::Mode), Some(2));
    }

    #[test]
    fn test_limits_are_scaled() {
        let (sim, sm) = setup();
        assert_eq!(sm.velocity_limit().unwrap(), 2.0);
        assert_eq!(sm.torque_limit().unwrap(), 4.0);

        sm.set_velocity_limit(1.25).unwrap();
        assert_eq!(sim.property(10, Property::Vl2), Some(1250));
        sm.set_torque_limit(3.5).unwrap();
        assert_eq!(sim.property(10, Property::Tl2), Some(3500));

        assert!(sm.set_velocity_limit(-1.0).is_err());
        assert!(sm.set_torque_limit(f64::NAN).is_err());
    }

    #[test]
    fn test_zeroed() {
        let (sim, sm) = setup();
        assert!(sm.is_wam_zeroed().unwrap());
        sim.set_property(10, Property::Zero, 0);
        assert!(!sm.is_wam_zeroed().unwrap());
    }

    #[test]
    fn test_non_safety_puck_rejected() {
        let sim = SimulatedBus::new();
        sim.add_puck(SimPuck::motor(1));
        let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(sim.adapter()));
        let puck = Puck::new(bus, 1, Duration::from_millis(20)).unwrap();
        assert!(SafetyModule::new(&puck, Arc::new(EstopLatch::new())).is_err());
    }
}
