//! 总线 ID 编码/解码
//!
//! 11 位复合 ID 布局：
//!
//! ```text
//!  bit 10     bits 9..5        bits 4..0
//! [group] [ from node id ] [ to node id / group id ]
//! ```
//!
//! 所有转换都只用掩码和移位实现，不含分支：实时控制周期中的每一次总线事务都会调用它们。

/// 节点 ID 位宽
pub const NODE_ID_WIDTH: u16 = 5;
/// 节点 ID 掩码
pub const NODE_ID_MASK: u16 = 0x1F;
/// 组投递标志位
pub const GROUP_MASK: u16 = 0x400;
/// 源节点字段掩码
pub const FROM_MASK: u16 = 0x3E0;
/// 目标字段掩码（包含组标志位）
pub const TO_MASK: u16 = 0x41F;
/// 11 位总线 ID 掩码
pub const BUS_ID_MASK: u16 = 0x7FF;

/// 主控 PC 的节点 ID
pub const HOST_ID: u8 = 0;
/// 现场节点最小 ID
pub const MIN_ID: u8 = 1;
/// 现场节点最大 ID
pub const MAX_ID: u8 = 31;

/// 广播组 ID
///
/// 组成员关系由 Puck 的 GRPA/GRPB/GRPC 属性决定，以下是出厂约定。
pub mod groups {
    /// 所有 Puck
    pub const BROADCAST: u8 = 0;
    /// WAM 下臂（ID 1-4）
    pub const LOWER_WAM: u8 = 1;
    /// WAM 上臂（ID 5-7）
    pub const UPPER_WAM: u8 = 2;
    /// 主机位置应答组：电机 Puck 把位置应答发往该组
    pub const POSITION_REPLY: u8 = 3;
    /// 整条 WAM（ID 1-7）
    pub const WAM: u8 = 4;
    /// BarrettHand 风格末端执行器（ID 11-14）
    pub const HAND: u8 = 5;
}

/// 主机 → 节点 的点对点总线 ID
#[inline]
pub const fn node_id_to_bus_id(id: u8) -> u16 {
    (id as u16 & TO_MASK) | ((HOST_ID as u16) << NODE_ID_WIDTH)
}

/// 从总线 ID 提取源节点 ID
#[inline]
pub const fn bus_id_to_node_id(bus_id: u16) -> u8 {
    ((bus_id & FROM_MASK) >> NODE_ID_WIDTH) as u8
}

/// 编码 (from, to) → 总线 ID
///
/// `to` 可以携带组标志位（见 [`group_bus_id`]）。
#[inline]
pub const fn encode_bus_id(from_id: u8, to_id: u16) -> u16 {
    (to_id & TO_MASK) | ((from_id as u16 & NODE_ID_MASK) << NODE_ID_WIDTH)
}

/// 解码总线 ID → (from, to)
#[inline]
pub const fn decode_bus_id(bus_id: u16) -> (u8, u16) {
    (
        ((bus_id & FROM_MASK) >> NODE_ID_WIDTH) as u8,
        bus_id & TO_MASK,
    )
}

/// 主机 → 组 的总线 ID
#[inline]
pub const fn group_bus_id(group_id: u8) -> u16 {
    GROUP_MASK | ((HOST_ID as u16) << NODE_ID_WIDTH) | (group_id as u16 & NODE_ID_MASK)
}

/// 是否为组投递
#[inline]
pub const fn is_group(bus_id: u16) -> bool {
    bus_id & GROUP_MASK != 0
}

/// 节点 → 主机 的属性应答总线 ID
#[inline]
pub const fn reply_bus_id(node_id: u8) -> u16 {
    encode_bus_id(node_id, HOST_ID as u16)
}

/// 节点 → 主机位置应答组 的总线 ID
#[inline]
pub const fn position_reply_bus_id(node_id: u8) -> u16 {
    encode_bus_id(node_id, GROUP_MASK | groups::POSITION_REPLY as u16)
}
