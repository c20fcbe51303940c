//! Puck：单个总线节点
//!
//! 一个 `Puck` 对象代表一个物理控制器。它只保存节点身份（ID、固件版本、角色、
//! 状态）和共享总线句柄；属性值每次都从总线读取，不做缓存。
//!
//! 静态函数（`send_get_request` 等）不需要 `Puck` 对象，枚举探测和实时控制
//! 周期直接使用它们。

use crate::DriverError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use wam_bus::{BusError, CommunicationsBus, Wait};
use wam_protocol::{
    Property, ProtocolError, PuckOption, PuckStatus, PuckType, ReplyParser, RoleWord,
    StandardParser, get_request, node_id_to_bus_id, property_id, reply_bus_id,
    require_property_id, set_request,
};

/// 默认应答超时
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(20);

/// 唤醒后最多查询 STAT 的次数
const WAKE_POLL_ATTEMPTS: u32 = 20;
/// 唤醒轮询间隔
const WAKE_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn map_receive_error(id: u8, wait: Wait, e: BusError) -> DriverError {
    match (e, wait) {
        (BusError::WouldBlock, _) => DriverError::NotReady,
        (BusError::Timeout, Wait::Timeout(timeout)) => DriverError::Timeout { id, timeout },
        (BusError::Timeout, Wait::NonBlocking) => DriverError::NotReady,
        (e, _) => DriverError::Bus(e),
    }
}

/// 发送属性读取请求
pub fn send_get_request(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
) -> Result<(), DriverError> {
    let frame = get_request(node_id_to_bus_id(id), prop_id);
    bus.send(frame.id, frame.data_slice())?;
    Ok(())
}

/// 接收并解析属性应答
///
/// 应答从 `reply_id` 到达（点对点为 `reply_bus_id(id)`，组内位置读取为
/// `position_reply_bus_id(id)`）。回显其他属性的旧应答被丢弃，
/// 继续等待到原来的截止时间。
///
/// # 错误
/// - `NotReady`: 非阻塞模式下应答尚未到达
/// - `Timeout`: 阻塞模式下超时
/// - `Protocol`: 应答格式错误
pub fn receive_reply<P: ReplyParser>(
    bus: &dyn CommunicationsBus,
    id: u8,
    reply_id: u16,
    parser: &P,
    wait: Wait,
) -> Result<P::Output, DriverError> {
    let deadline = match wait {
        Wait::Timeout(timeout) => Some(Instant::now() + timeout),
        Wait::NonBlocking => None,
    };
    let mut next = wait;
    loop {
        let frame = bus
            .receive(reply_id, next)
            .map_err(|e| map_receive_error(id, wait, e))?;
        match parser.parse(&frame) {
            Err(ProtocolError::UnexpectedProperty { expected, actual }) => {
                trace!(
                    "Puck {}: discarding stale reply for property {} (waiting for {})",
                    id, actual, expected
                );
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(map_receive_error(id, wait, BusError::Timeout));
                    }
                    next = Wait::Timeout(remaining);
                }
            },
            result => return Ok(result?),
        }
    }
}

/// 接收标准属性应答
pub fn receive_get_reply(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
    wait: Wait,
) -> Result<i32, DriverError> {
    receive_reply(bus, id, reply_bus_id(id), &StandardParser::new(prop_id), wait)
}

/// 读取属性（请求 + 应答）
///
/// 非阻塞模式下发送请求后只检查一次应答；尚未到达时返回 `NotReady`，
/// 调用者可以稍后用 [`receive_get_reply`] 轮询。该路径不分配内存、不睡眠。
pub fn get_property_raw(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
    wait: Wait,
) -> Result<i32, DriverError> {
    let _guard = bus.lock();
    send_get_request(bus, id, prop_id)?;
    receive_get_reply(bus, id, prop_id, wait)
}

/// 探测属性：无应答返回 `Ok(None)`
pub fn try_get_property_raw(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
    timeout: Duration,
) -> Result<Option<i32>, DriverError> {
    match get_property_raw(bus, id, prop_id, Wait::Timeout(timeout)) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_timeout() => Ok(None),
        Err(e) => Err(e),
    }
}

/// 写属性（不确认）
pub fn set_property_raw(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
    value: i32,
) -> Result<(), DriverError> {
    let frame = set_request(node_id_to_bus_id(id), prop_id, value);
    bus.send(frame.id, frame.data_slice())?;
    Ok(())
}

/// 写属性并等待节点应答作为确认
///
/// 确认只表示节点收到了写入：读取同一属性，收到任意应答即成功。
pub fn set_property_acked(
    bus: &dyn CommunicationsBus,
    id: u8,
    prop_id: u8,
    value: i32,
    timeout: Duration,
) -> Result<(), DriverError> {
    let _guard = bus.lock();
    set_property_raw(bus, id, prop_id, value)?;
    get_property_raw(bus, id, prop_id, Wait::Timeout(timeout)).map(|_| ())
}

/// 单个总线节点
pub struct Puck {
    bus: Arc<dyn CommunicationsBus>,
    id: u8,
    vers: u16,
    role: RoleWord,
    status: PuckStatus,
    effective_type: PuckType,
    reply_timeout: Duration,
}

impl std::fmt::Debug for Puck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puck")
            .field("id", &self.id)
            .field("vers", &self.vers)
            .field("type", &self.puck_type())
            .field("effective_type", &self.effective_type)
            .field("status", &self.status)
            .finish()
    }
}

impl Puck {
    /// 查询节点的 VERS、ROLE、STAT 并创建 `Puck`
    ///
    /// # 错误
    /// - `Timeout`: 节点没有应答
    pub fn new(
        bus: Arc<dyn CommunicationsBus>,
        id: u8,
        reply_timeout: Duration,
    ) -> Result<Self, DriverError> {
        if !(wam_protocol::MIN_ID..=wam_protocol::MAX_ID).contains(&id) {
            return Err(DriverError::InvalidInput(format!("invalid puck id {}", id)));
        }

        let mut puck = Self {
            bus,
            id,
            vers: 0,
            role: RoleWord::from(0u16),
            status: PuckStatus::Reset,
            effective_type: PuckType::Monitor,
            reply_timeout,
        };
        puck.update_vers()?;
        puck.update_role()?;
        puck.update_status()?;

        debug!(
            "Puck {}: vers={}, type={:?}, effective={:?}",
            id,
            puck.vers,
            puck.puck_type(),
            puck.effective_type
        );
        Ok(puck)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn vers(&self) -> u16 {
        self.vers
    }

    pub fn role(&self) -> RoleWord {
        self.role
    }

    /// 声明类型（来自 ROLE）
    pub fn puck_type(&self) -> PuckType {
        self.role.puck_type()
    }

    /// 有效类型：非 READY 状态下为 `Monitor`
    pub fn effective_type(&self) -> PuckType {
        self.effective_type
    }

    pub fn status(&self) -> PuckStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == PuckStatus::Ready
    }

    pub fn has_option(&self, option: PuckOption) -> bool {
        self.role.has_option(option)
    }

    pub fn bus(&self) -> &Arc<dyn CommunicationsBus> {
        &self.bus
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    fn common_property_id(&self, prop: Property) -> Result<u8, DriverError> {
        Ok(require_property_id(prop, PuckType::Monitor, self.vers)?)
    }

    pub fn update_vers(&mut self) -> Result<(), DriverError> {
        let prop_id = self.common_property_id(Property::Vers)?;
        let vers = self.get_raw(prop_id)?;
        self.vers = u16::try_from(vers).map_err(|_| {
            DriverError::Protocol(wam_protocol::ProtocolError::InvalidValue {
                field: "VERS",
                value: vers,
            })
        })?;
        Ok(())
    }

    pub fn update_role(&mut self) -> Result<(), DriverError> {
        let prop_id = self.common_property_id(Property::Role)?;
        self.role = RoleWord::from(self.get_raw(prop_id)? as u16);
        self.refresh_effective_type();
        Ok(())
    }

    pub fn update_status(&mut self) -> Result<(), DriverError> {
        let prop_id = self.common_property_id(Property::Stat)?;
        let stat = self.get_raw(prop_id)?;
        self.status = PuckStatus::try_from(stat).unwrap_or_else(|_| {
            warn!("Puck {} reported unknown STAT {}, treating as RESET", self.id, stat);
            PuckStatus::Reset
        });
        self.refresh_effective_type();
        Ok(())
    }

    fn refresh_effective_type(&mut self) {
        self.effective_type = if self.is_ready() {
            self.puck_type()
        } else {
            PuckType::Monitor
        };
    }

    /// 唤醒节点（STAT → READY）并等待其就绪
    ///
    /// # 错误
    /// - `Timeout`: 多次轮询后节点仍未就绪
    pub fn wake(&mut self) -> Result<(), DriverError> {
        if self.is_ready() {
            return Ok(());
        }

        let stat = self.common_property_id(Property::Stat)?;
        debug!("Waking puck {}", self.id);
        set_property_raw(&*self.bus, self.id, stat, PuckStatus::Ready.into())?;

        for _ in 0..WAKE_POLL_ATTEMPTS {
            match self.update_status() {
                Ok(()) if self.is_ready() => {
                    // 固件版本可能因重启变化，重新读取
                    self.update_vers()?;
                    return Ok(());
                },
                Ok(()) => {},
                Err(e) if e.is_timeout() => trace!("Puck {} still booting", self.id),
                Err(e) => return Err(e),
            }
            thread::sleep(WAKE_POLL_INTERVAL);
        }

        Err(DriverError::Timeout {
            id: self.id,
            timeout: WAKE_POLL_INTERVAL * WAKE_POLL_ATTEMPTS,
        })
    }

    /// 探测属性 ID（按有效类型和固件版本）
    pub fn property_id(&self, prop: Property) -> Option<u8> {
        property_id(prop, self.effective_type, self.vers)
    }

    pub fn require_property_id(&self, prop: Property) -> Result<u8, DriverError> {
        Ok(require_property_id(prop, self.effective_type, self.vers)?)
    }

    fn get_raw(&self, prop_id: u8) -> Result<i32, DriverError> {
        get_property_raw(
            &*self.bus,
            self.id,
            prop_id,
            Wait::Timeout(self.reply_timeout),
        )
    }

    /// 读取属性（阻塞，使用默认超时）
    pub fn get_property(&self, prop: Property) -> Result<i32, DriverError> {
        let prop_id = self.require_property_id(prop)?;
        self.get_raw(prop_id)
    }

    /// 读取属性（自定义等待策略）
    pub fn get_property_with(&self, prop: Property, wait: Wait) -> Result<i32, DriverError> {
        let prop_id = self.require_property_id(prop)?;
        get_property_raw(&*self.bus, self.id, prop_id, wait)
    }

    /// 写属性
    ///
    /// [`Property::requires_ack`] 为真的属性会等待节点确认。
    pub fn set_property(&self, prop: Property, value: i32) -> Result<(), DriverError> {
        let prop_id = self.require_property_id(prop)?;
        if prop.requires_ack() {
            set_property_acked(&*self.bus, self.id, prop_id, value, self.reply_timeout)
        } else {
            set_property_raw(&*self.bus, self.id, prop_id, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wam_bus::BusManager;
    use wam_bus::mock::{SimPuck, SimulatedBus};

    fn shared(sim: &SimulatedBus) -> Arc<dyn CommunicationsBus> {
        Arc::new(BusManager::new(sim.adapter()))
    }

    #[test]
    fn test_new_reads_identity() {
        let sim = SimulatedBus::wam(4);
        let puck = Puck::new(shared(&sim), 3, DEFAULT_REPLY_TIMEOUT).unwrap();
        assert_eq!(puck.id(), 3);
        assert_eq!(puck.vers(), 200);
        assert_eq!(puck.puck_type(), PuckType::Motor);
        assert_eq!(puck.effective_type(), PuckType::Motor);
        assert_eq!(puck.get_property(Property::Cts).unwrap(), 4096);
    }

    #[test]
    fn test_stale_reply_for_other_property_is_discarded() {
        let sim = SimulatedBus::wam(4);
        let puck = Puck::new(shared(&sim), 3, DEFAULT_REPLY_TIMEOUT).unwrap();
        let stat = puck.require_property_id(Property::Stat).unwrap();

        // 上一次事务迟到的 STAT 应答排在 CTS 应答之前
        sim.inject_reply(wam_protocol::property_reply(reply_bus_id(3), stat, 2));
        assert_eq!(puck.get_property(Property::Cts).unwrap(), 4096);

        // 真正的应答不来时是超时，而不是协议错误
        sim.inject_reply(wam_protocol::property_reply(reply_bus_id(3), stat, 2));
        sim.set_silent(3, true);
        let err = puck.get_property(Property::Cts).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {}", err);
    }

    #[test]
    fn test_absent_puck_times_out() {
        let sim = SimulatedBus::wam(4);
        let err = Puck::new(shared(&sim), 9, Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_reset_puck_is_monitor_until_woken() {
        let sim = SimulatedBus::new();
        sim.add_puck(SimPuck::motor(7).with_status(PuckStatus::Reset));
        let mut puck = Puck::new(shared(&sim), 7, DEFAULT_REPLY_TIMEOUT).unwrap();

        assert_eq!(puck.effective_type(), PuckType::Monitor);
        assert!(puck.get_property(Property::Poles).unwrap_err().is_unsupported());

        puck.wake().unwrap();
        assert_eq!(puck.effective_type(), PuckType::Motor);
        assert_eq!(puck.get_property(Property::Poles).unwrap(), 12);
    }

    #[test]
    fn test_set_property_with_ack() {
        let sim = SimulatedBus::wam(2);
        let puck = Puck::new(shared(&sim), 1, DEFAULT_REPLY_TIMEOUT).unwrap();
        puck.set_property(Property::Mode, 2).unwrap();
        assert_eq!(sim.property(1, Property::Mode), Some(2));
    }

    #[test]
    fn test_nonblocking_get_then_poll() {
        let sim = SimulatedBus::wam(2);
        let bus = shared(&sim);
        let puck = Puck::new(bus.clone(), 2, DEFAULT_REPLY_TIMEOUT).unwrap();
        let p = puck.require_property_id(Property::P).unwrap();

        sim.set_silent(2, true);
        let err = get_property_raw(&*bus, 2, p, Wait::NonBlocking).unwrap_err();
        assert!(matches!(err, DriverError::NotReady));

        sim.set_silent(2, false);
        send_get_request(&*bus, 2, p).unwrap();
        assert_eq!(receive_get_reply(&*bus, 2, p, Wait::NonBlocking).unwrap(), 0);
    }

    #[test]
    fn test_try_get_property_raw_reports_absence() {
        let sim = SimulatedBus::wam(2);
        let bus = shared(&sim);
        let stat = property_id(Property::Stat, PuckType::Monitor, 0).unwrap();
        assert_eq!(
            try_get_property_raw(&*bus, 1, stat, DEFAULT_REPLY_TIMEOUT).unwrap(),
            Some(2)
        );
        assert_eq!(
            try_get_property_raw(&*bus, 5, stat, Duration::from_millis(5)).unwrap(),
            None
        );
    }

    #[test]
    fn test_legacy_firmware_resolves_legacy_ids() {
        let sim = SimulatedBus::new();
        sim.add_puck(SimPuck::motor(1).with_property(Property::P, 321).with_vers(20));
        let puck = Puck::new(shared(&sim), 1, DEFAULT_REPLY_TIMEOUT).unwrap();
        assert_eq!(puck.property_id(Property::P), Some(40));
        assert_eq!(puck.property_id(Property::Hold), None);
        assert_eq!(puck.get_property(Property::P).unwrap(), 321);
    }
}
