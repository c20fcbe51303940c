//! 模拟总线
//!
//! 在内存中模拟一组 Puck，用于没有硬件时的测试和离线开发。
//!
//! - 主机发出的帧在 `send` 内同步处理，应答通过 `crossbeam-channel` 排队
//! - 组投递按组成员关系分发；组内 P 读取以组合位置格式应答到主机位置应答组
//! - 8 字节组 set 帧按打包力矩解析，槽位为成员在组内按 ID 排序后的序号
//!
//! ```
//! use wam_bus::mock::{SimPuck, SimulatedBus};
//! use wam_bus::{BusManager, CommunicationsBus};
//!
//! let sim = SimulatedBus::new();
//! sim.add_puck(SimPuck::motor(1));
//! sim.add_puck(SimPuck::safety(10));
//! let bus = BusManager::new(sim.adapter());
//! ```

use crate::{BusError, BusFrame, CanAdapter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};
use wam_protocol::{
    CombinedPositionParser, HOST_ID, NODE_ID_MASK, Property, PuckStatus, PuckType, decode_bus_id,
    groups, is_group, position_reply_bus_id, property_id, property_reply, reply_bus_id,
    unpack_torques,
};

/// 默认固件版本（新属性布局）
pub const DEFAULT_VERS: u16 = 200;

/// 通用属性的最大线上 ID（Monitor 固件只响应这些）
const COMMON_PROPERTY_MAX: u8 = 8;

/// 模拟 Puck
#[derive(Debug, Clone)]
pub struct SimPuck {
    id: u8,
    role: u16,
    vers: u16,
    status: PuckStatus,
    silent: bool,
    ignored: Vec<u8>,
    groups: Vec<u8>,
    secondary_position: Option<i32>,
    props: HashMap<u8, i32>,
}

impl SimPuck {
    fn new(id: u8, role: u16, groups: Vec<u8>) -> Self {
        let mut puck = Self {
            id,
            role,
            vers: DEFAULT_VERS,
            status: PuckStatus::Ready,
            silent: false,
            ignored: Vec::new(),
            groups,
            secondary_position: None,
            props: HashMap::new(),
        };
        puck.put(Property::Vers, DEFAULT_VERS as i32);
        puck.put(Property::Role, role as i32);
        puck.put(Property::Sn, 1000 + id as i32);
        puck.put(Property::Id, id as i32);
        puck.put(Property::Stat, PuckStatus::Ready.into());
        puck.put(Property::Mode, 0);
        puck.put(Property::Error, 0);
        puck
    }

    /// 电机 Puck（WAM 关节）
    pub fn motor(id: u8) -> Self {
        let arm_group = if id <= 4 {
            groups::LOWER_WAM
        } else {
            groups::UPPER_WAM
        };
        let mut puck = Self::new(id, 0, vec![arm_group, groups::WAM]);
        puck.put(Property::Grpa, 0);
        puck.put(Property::Grpb, arm_group as i32);
        puck.put(Property::Grpc, groups::WAM as i32);
        puck.put(Property::Cts, 4096);
        puck.put(Property::P, 0);
        puck.put(Property::T, 0);
        puck.put(Property::Poles, 12);
        puck.put(Property::Ipnm, 2700);
        puck.put(Property::Temp, 30);
        puck
    }

    /// 手爪 Puck
    pub fn hand(id: u8) -> Self {
        let mut puck = Self::new(id, 0x0205, vec![groups::HAND]);
        puck.put(Property::Grpb, groups::HAND as i32);
        puck.put(Property::Cts, 4096);
        puck.put(Property::P, 0);
        puck.put(Property::T, 0);
        puck.put(Property::Mode, 0);
        puck
    }

    /// 安全模块（初始为 IDLE，已归零）
    pub fn safety(id: u8) -> Self {
        let mut puck = Self::new(id, 2, vec![]);
        puck.put(Property::Mode, 1);
        puck.put(Property::Zero, 1);
        puck.put(Property::Vl1, 1500);
        puck.put(Property::Vl2, 2000);
        puck.put(Property::Tl1, 3000);
        puck.put(Property::Tl2, 4000);
        puck
    }

    /// 力/力矩传感器
    pub fn force_torque(id: u8) -> Self {
        let mut puck = Self::new(id, 6, vec![]);
        puck.put(Property::Ft, 0);
        puck.put(Property::Temp, 30);
        puck
    }

    pub fn with_vers(mut self, vers: u16) -> Self {
        // 版本决定属性布局：按新版本重建属性表
        let values: Vec<(Property, i32)> = ALL_SIM_PROPERTIES
            .iter()
            .filter_map(|&p| self.get(p).map(|v| (p, v)))
            .collect();
        self.vers = vers;
        self.props.clear();
        for (p, v) in values {
            self.put(p, v);
        }
        self.put(Property::Vers, vers as i32);
        self
    }

    pub fn with_status(mut self, status: PuckStatus) -> Self {
        self.status = status;
        self.put(Property::Stat, status.into());
        self
    }

    pub fn with_property(mut self, property: Property, value: i32) -> Self {
        self.put(property, value);
        self
    }

    pub fn with_secondary_position(mut self, counts: i32) -> Self {
        self.secondary_position = Some(counts);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// 不应答对 `property` 的读取（其他属性照常应答）
    pub fn ignoring(mut self, property: Property) -> Self {
        if let Some(id) = self.wire_id(property) {
            self.ignored.push(id);
        }
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn declared_type(&self) -> PuckType {
        PuckType::from_role(self.role)
    }

    fn wire_id(&self, property: Property) -> Option<u8> {
        property_id(property, self.declared_type(), self.vers)
    }

    fn put(&mut self, property: Property, value: i32) {
        match self.wire_id(property) {
            Some(id) => {
                self.props.insert(id, value);
            },
            None => warn!(
                "Simulated puck {} does not support {:?}, ignoring",
                self.id, property
            ),
        }
    }

    fn get(&self, property: Property) -> Option<i32> {
        self.wire_id(property).and_then(|id| self.props.get(&id).copied())
    }

    fn in_group(&self, group: u8) -> bool {
        group == groups::BROADCAST || self.groups.contains(&group)
    }

    fn apply_set(&mut self, prop: u8, value: i32) {
        self.props.insert(prop, value);
        if Some(prop) == self.wire_id(Property::Stat) {
            match PuckStatus::try_from(value) {
                Ok(status) => self.status = status,
                Err(_) => warn!("Simulated puck {} ignoring STAT={}", self.id, value),
            }
        }
    }

    fn reply_to_get(&self, prop: u8, via_group: bool, out: &Sender<BusFrame>) {
        if self.silent || self.ignored.contains(&prop) {
            return;
        }
        if self.status != PuckStatus::Ready && prop > COMMON_PROPERTY_MAX {
            return;
        }
        let Some(&value) = self.props.get(&prop) else {
            return;
        };

        let frame = if via_group && Some(prop) == self.wire_id(Property::P) {
            CombinedPositionParser::encode(
                position_reply_bus_id(self.id),
                value,
                self.secondary_position,
            )
        } else {
            property_reply(reply_bus_id(self.id), prop, value)
        };
        // 接收端随适配器一起存在，发送不会失败
        let _ = out.send(frame);
    }
}

const ALL_SIM_PROPERTIES: &[Property] = &[
    Property::Vers,
    Property::Role,
    Property::Sn,
    Property::Id,
    Property::Error,
    Property::Stat,
    Property::Mode,
    Property::Temp,
    Property::Grpa,
    Property::Grpb,
    Property::Grpc,
    Property::T,
    Property::P,
    Property::Poles,
    Property::Cts,
    Property::Ipnm,
    Property::Zero,
    Property::Vl1,
    Property::Vl2,
    Property::Tl1,
    Property::Tl2,
    Property::Ft,
];

#[derive(Default)]
struct SimState {
    pucks: BTreeMap<u8, SimPuck>,
    sent: Vec<BusFrame>,
}

struct Shared {
    state: Mutex<SimState>,
    replies_tx: Sender<BusFrame>,
    replies_rx: Receiver<BusFrame>,
}

impl Shared {
    fn handle_host_frame(&self, frame: BusFrame) {
        let mut state = self.state.lock();
        state.sent.push(frame);

        let (from, to) = decode_bus_id(frame.id);
        if from != HOST_ID || frame.len == 0 {
            return;
        }

        let is_set = frame.data[0] & 0x80 != 0;
        let prop = frame.data[0] & 0x7F;

        if is_group(to) {
            let group = (to & NODE_ID_MASK) as u8;
            if is_set && frame.len == 8 {
                // 打包力矩
                let torques = unpack_torques(&frame.data);
                let members = state.pucks.values_mut().filter(|p| p.in_group(group));
                for (slot, puck) in members.enumerate().take(torques.len()) {
                    if Some(prop) == puck.wire_id(Property::T) {
                        puck.apply_set(prop, torques[slot]);
                    }
                }
                return;
            }

            for puck in state.pucks.values_mut().filter(|p| p.in_group(group)) {
                if is_set {
                    puck.apply_set(prop, set_value(&frame));
                } else {
                    puck.reply_to_get(prop, true, &self.replies_tx);
                }
            }
        } else {
            let target = (to & NODE_ID_MASK) as u8;
            let Some(puck) = state.pucks.get_mut(&target) else {
                trace!("No simulated puck at id {}", target);
                return;
            };
            if is_set {
                puck.apply_set(prop, set_value(&frame));
            } else {
                puck.reply_to_get(prop, false, &self.replies_tx);
            }
        }
    }
}

fn set_value(frame: &BusFrame) -> i32 {
    i32::from_le_bytes([frame.data[2], frame.data[3], frame.data[4], frame.data[5]])
}

/// 模拟总线句柄
///
/// 可克隆；所有克隆共享同一组模拟 Puck。
#[derive(Clone)]
pub struct SimulatedBus {
    shared: Arc<Shared>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        let (replies_tx, replies_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::default()),
                replies_tx,
                replies_rx,
            }),
        }
    }

    /// 一条完整 WAM：电机 1..=dof + 安全模块 10
    pub fn wam(dof: u8) -> Self {
        let sim = Self::new();
        for id in 1..=dof {
            sim.add_puck(SimPuck::motor(id));
        }
        sim.add_puck(SimPuck::safety(10));
        sim
    }

    /// 创建连接到本模拟总线的适配器
    pub fn adapter(&self) -> SimAdapter {
        SimAdapter {
            shared: self.shared.clone(),
        }
    }

    pub fn add_puck(&self, puck: SimPuck) {
        self.shared.state.lock().pucks.insert(puck.id, puck);
    }

    pub fn remove_puck(&self, id: u8) -> Option<SimPuck> {
        self.shared.state.lock().pucks.remove(&id)
    }

    pub fn set_silent(&self, id: u8, silent: bool) {
        if let Some(puck) = self.shared.state.lock().pucks.get_mut(&id) {
            puck.silent = silent;
        }
    }

    pub fn set_property(&self, id: u8, property: Property, value: i32) {
        if let Some(puck) = self.shared.state.lock().pucks.get_mut(&id) {
            puck.put(property, value);
        }
    }

    pub fn property(&self, id: u8, property: Property) -> Option<i32> {
        self.shared
            .state
            .lock()
            .pucks
            .get(&id)
            .and_then(|p| p.get(property))
    }

    pub fn status(&self, id: u8) -> Option<PuckStatus> {
        self.shared.state.lock().pucks.get(&id).map(|p| p.status)
    }

    /// 设置安全模块（所有 Safety 类型 Puck）的 MODE
    pub fn set_safety_mode(&self, mode: i32) {
        let mut state = self.shared.state.lock();
        for puck in state
            .pucks
            .values_mut()
            .filter(|p| p.declared_type() == PuckType::Safety)
        {
            puck.put(Property::Mode, mode);
        }
    }

    /// 把一帧放进应答队列，模拟总线上迟到或多余的应答
    pub fn inject_reply(&self, frame: BusFrame) {
        // 接收端随共享状态一起存在，发送不会失败
        let _ = self.shared.replies_tx.send(frame);
    }

    /// 主机发出的所有帧
    pub fn sent_frames(&self) -> Vec<BusFrame> {
        self.shared.state.lock().sent.clone()
    }

    pub fn clear_sent_frames(&self) {
        self.shared.state.lock().sent.clear();
    }
}

/// 模拟总线适配器
pub struct SimAdapter {
    shared: Arc<Shared>,
}

impl CanAdapter for SimAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), BusError> {
        self.shared.handle_host_frame(frame);
        Ok(())
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<BusFrame, BusError> {
        match self.shared.replies_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(BusError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed),
        }
    }

    fn try_receive(&mut self) -> Result<Option<BusFrame>, BusError> {
        match self.shared.replies_rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BusError::Closed),
        }
    }
}
