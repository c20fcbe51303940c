//! Puck 组：一帧请求，多个应答
//!
//! 组读取向组 ID 发送一个请求帧，然后按成员顺序收集各节点的应答。
//! 所有成员共用一个截止时间；没有应答的成员在结果中为 `None`，不会中断整个读取。

use crate::{DriverError, Puck};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;
use wam_bus::{CommunicationsBus, Wait};
use wam_protocol::{
    CombinedPositionParser, PACKED_TORQUES_PER_FRAME, Property, ProtocolError, PuckType,
    ReplyParser, StandardParser, get_request, group_bus_id, pack_torques, position_reply_bus_id,
    property_id, reply_bus_id, set_request,
};

/// 内联容量：整条 WAM 的 7 个关节放得下
pub const GROUP_INLINE: usize = 8;

/// 组读取结果（成员顺序）
pub type GroupReplies<T> = SmallVec<[Option<T>; GROUP_INLINE]>;

/// 组合位置应答：(主编码器, 副编码器)
pub type CombinedPosition = (i32, Option<i32>);

/// 应答路由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRoute {
    /// 点对点应答（`reply_bus_id`）
    Direct,
    /// 主机位置应答组（组合位置格式）
    PositionGroup,
}

impl ReplyRoute {
    fn bus_id(self, member: u8) -> u16 {
        match self {
            ReplyRoute::Direct => reply_bus_id(member),
            ReplyRoute::PositionGroup => position_reply_bus_id(member),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Member {
    id: u8,
    effective_type: PuckType,
    vers: u16,
}

/// Puck 组
pub struct PuckGroup {
    bus: Arc<dyn CommunicationsBus>,
    id: u8,
    members: SmallVec<[Member; GROUP_INLINE]>,
}

impl std::fmt::Debug for PuckGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuckGroup")
            .field("id", &self.id)
            .field("members", &self.member_ids().collect::<Vec<_>>())
            .finish()
    }
}

impl PuckGroup {
    /// 创建组
    ///
    /// `pucks` 的顺序即应答顺序。组成员关系（GRPA/GRPB/GRPC）由节点固件保存，
    /// 这里不修改。
    ///
    /// # 错误
    /// - `InvalidInput`: 成员为空或有重复 ID
    pub fn new(id: u8, pucks: &[&Puck]) -> Result<Self, DriverError> {
        let first = pucks
            .first()
            .ok_or_else(|| DriverError::InvalidInput(format!("group {} has no members", id)))?;

        let mut members: SmallVec<[Member; GROUP_INLINE]> = SmallVec::new();
        for puck in pucks {
            if members.iter().any(|m| m.id == puck.id()) {
                return Err(DriverError::InvalidInput(format!(
                    "puck {} listed twice in group {}",
                    puck.id(),
                    id
                )));
            }
            members.push(Member {
                id: puck.id(),
                effective_type: puck.effective_type(),
                vers: puck.vers(),
            });
        }

        Ok(Self {
            bus: first.bus().clone(),
            id,
            members,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.members.iter().map(|m| m.id)
    }

    pub fn bus(&self) -> &Arc<dyn CommunicationsBus> {
        &self.bus
    }

    /// 解析组内统一的属性 ID
    ///
    /// # 错误
    /// - `Protocol(UnsupportedProperty)`: 某个成员不支持该属性
    /// - `InvalidInput`: 成员之间属性 ID 不一致（固件版本混用）
    pub fn property_id(&self, prop: Property) -> Result<u8, DriverError> {
        let mut resolved: Option<u8> = None;
        for m in &self.members {
            let id = property_id(prop, m.effective_type, m.vers).ok_or(
                ProtocolError::UnsupportedProperty {
                    property: prop,
                    puck_type: m.effective_type,
                    vers: m.vers,
                },
            )?;
            match resolved {
                None => resolved = Some(id),
                Some(prev) if prev != id => {
                    return Err(DriverError::InvalidInput(format!(
                        "{:?} resolves to different ids within group {}",
                        prop, self.id
                    )));
                },
                Some(_) => {},
            }
        }
        resolved.ok_or_else(|| DriverError::InvalidInput(format!("group {} is empty", self.id)))
    }

    /// 向组发送读取请求
    pub fn send_get_request(&self, prop_id: u8) -> Result<(), DriverError> {
        let frame = get_request(group_bus_id(self.id), prop_id);
        self.bus.send(frame.id, frame.data_slice())?;
        Ok(())
    }

    /// 收集各成员应答，写入 `out`（成员顺序）
    ///
    /// 所有成员共用一个截止时间。截止时间过后仍会非阻塞地取一次已到达的应答。
    /// 没有应答或应答格式错误的成员写入 `None`。
    ///
    /// 返回收到应答的成员数。该函数不分配内存。
    ///
    /// # 错误
    /// - `InvalidInput`: `out` 长度与成员数不一致
    /// - `Bus`: 总线故障（超时不算错误）
    pub fn receive_replies_into<P: ReplyParser>(
        &self,
        parser: &P,
        route: ReplyRoute,
        wait: Wait,
        out: &mut [Option<P::Output>],
    ) -> Result<usize, DriverError> {
        if out.len() != self.members.len() {
            return Err(DriverError::InvalidInput(format!(
                "reply buffer has {} slots, group {} has {} members",
                out.len(),
                self.id,
                self.members.len()
            )));
        }

        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            Wait::NonBlocking => None,
        };

        let mut received = 0;
        for (slot, m) in out.iter_mut().zip(&self.members) {
            let member_wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        Wait::NonBlocking
                    } else {
                        Wait::Timeout(remaining)
                    }
                },
                None => Wait::NonBlocking,
            };

            *slot = match self.bus.receive(route.bus_id(m.id), member_wait) {
                Ok(frame) => match parser.parse(&frame) {
                    Ok(value) => {
                        received += 1;
                        Some(value)
                    },
                    Err(e) => {
                        trace!("Group {}: malformed reply from puck {}: {}", self.id, m.id, e);
                        None
                    },
                },
                Err(e) if e.is_timeout() => None,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(received)
    }

    /// 组读取（请求 + 应答），写入 `out`
    pub fn get_property_into(
        &self,
        prop_id: u8,
        wait: Wait,
        out: &mut [Option<i32>],
    ) -> Result<usize, DriverError> {
        let _guard = self.bus.lock();
        self.send_get_request(prop_id)?;
        self.receive_replies_into(&StandardParser::new(prop_id), ReplyRoute::Direct, wait, out)
    }

    /// 组读取属性
    pub fn get_property(&self, prop: Property, timeout: Duration) -> Result<GroupReplies<i32>, DriverError> {
        let prop_id = self.property_id(prop)?;
        let mut out: GroupReplies<i32> = SmallVec::from_elem(None, self.members.len());
        self.get_property_into(prop_id, Wait::Timeout(timeout), &mut out)?;
        Ok(out)
    }

    /// 组位置读取（组合位置格式），写入 `out`
    pub fn get_positions_into(
        &self,
        p_id: u8,
        wait: Wait,
        out: &mut [Option<CombinedPosition>],
    ) -> Result<usize, DriverError> {
        let _guard = self.bus.lock();
        self.send_get_request(p_id)?;
        self.receive_replies_into(&CombinedPositionParser, ReplyRoute::PositionGroup, wait, out)
    }

    /// 向所有成员写同一个值（一帧）
    pub fn set_property(&self, prop: Property, value: i32) -> Result<(), DriverError> {
        let prop_id = self.property_id(prop)?;
        self.set_property_raw(prop_id, value)
    }

    pub fn set_property_raw(&self, prop_id: u8, value: i32) -> Result<(), DriverError> {
        let frame = set_request(group_bus_id(self.id), prop_id, value);
        self.bus.send(frame.id, frame.data_slice())?;
        Ok(())
    }

    /// 一帧写入每个成员各自的力矩
    ///
    /// 节点按组内 ID 升序取自己的槽位，因此 `torques` 按成员顺序排列，
    /// 成员必须按 ID 升序创建。
    ///
    /// # 错误
    /// - `InvalidInput`: 成员多于 4 个、未按 ID 升序，或 `torques` 长度不符
    pub fn set_packed_torques(&self, prop_id: u8, torques: &[i32]) -> Result<(), DriverError> {
        if self.members.len() > PACKED_TORQUES_PER_FRAME {
            return Err(DriverError::InvalidInput(format!(
                "group {} has {} members, packed torques carry at most {}",
                self.id,
                self.members.len(),
                PACKED_TORQUES_PER_FRAME
            )));
        }
        if !self.members.windows(2).all(|w| w[0].id < w[1].id) {
            return Err(DriverError::InvalidInput(format!(
                "group {} members must be in ascending id order for packed torques",
                self.id
            )));
        }
        if torques.len() != self.members.len() {
            return Err(DriverError::InvalidInput(format!(
                "{} torques for {} members",
                torques.len(),
                self.members.len()
            )));
        }

        let frame = pack_torques(group_bus_id(self.id), prop_id, torques)?;
        self.bus.send(frame.id, frame.data_slice())?;
        Ok(())
    }
}
