//! # WAM Protocol
//!
//! Puck 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `address`: 11 位总线 ID 的编码/解码（节点 ID、组 ID）
//! - `property`: 逻辑属性名、Puck 类型、角色字以及 (类型, 固件版本) → 属性 ID 查表
//! - `codec`: 属性请求/应答帧的构建与解析（标准值、组合位置、打包力矩）
//!
//! ## 字节序
//!
//! Puck 固件使用小端字节序传输属性值（与 Motorola 格式的 CAN 协议不同）。

pub mod address;
pub mod codec;
pub mod property;

// 重新导出常用类型
pub use address::*;
pub use codec::*;
pub use property::*;

/// CAN 2.0 标准帧的统一抽象
///
/// `BusFrame` 是协议层和总线层之间的中间抽象：
/// - 协议层只负责构建/解析 `BusFrame`，不关心底层是 SocketCAN 还是模拟总线
/// - 总线层（`wam-bus`）负责把 `BusFrame` 转换为具体硬件帧
///
/// # 设计特性
///
/// - **Copy trait**：零成本复制，适合控制周期内的高频收发
/// - **固定 8 字节**：避免堆分配，实时路径上不会触发内存分配
/// - **11 位 ID**：Puck 总线只使用标准帧
///
/// ```rust
/// use wam_protocol::BusFrame;
///
/// let frame = BusFrame::new(0x123, &[1, 2, 3, 4]);
/// assert_eq!(frame.id(), 0x123);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusFrame {
    /// 11 位总线 ID（高位会被截断）
    pub id: u16,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,
}

impl BusFrame {
    /// 创建标准帧
    ///
    /// 超过 8 字节的数据会被截断，ID 会被截断到 11 位。
    pub fn new(id: u16, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id: id & address::BUS_ID_MASK,
            data: fixed_data,
            len: len as u8,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取总线 ID
    pub fn id(&self) -> u16 {
        self.id
    }

    /// 获取完整数据（8字节固定数组）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }
}

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 该类型/固件版本的 Puck 不支持此属性
    #[error("{puck_type:?} pucks with firmware version {vers} do not support property {property:?}")]
    UnsupportedProperty {
        property: Property,
        puck_type: PuckType,
        vers: u16,
    },

    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// 应答中的属性 ID 与请求不一致
    #[error("Unexpected property in reply: expected {expected}, got {actual}")]
    UnexpectedProperty { expected: u8, actual: u8 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: i32 },
}

/// 小端字节序转 i32
pub fn bytes_to_i32_le(bytes: [u8; 4]) -> i32 {
    i32::from_le_bytes(bytes)
}

/// 小端字节序转 i16
pub fn bytes_to_i16_le(bytes: [u8; 2]) -> i16 {
    i16::from_le_bytes(bytes)
}
