//! 属性帧编解码
//!
//! 帧格式：
//!
//! ```text
//! get 请求:  [prop]
//! set 请求:  [prop | 0x80, 0, v0, v1, v2, v3]          (值为小端 i32)
//! 应答:      [prop | 0x80, 0, v0, v1 (, v2, v3)]       (16 位或 32 位)
//! 组合位置:  [p2..p0 (22 位), s2..s0 (22 位, 可选)]
//! 打包力矩:  [T | 0x80, 7 字节承载 4 个 14 位有符号值]
//! ```

use crate::{BusFrame, ProtocolError};

/// set 标志位
pub const SET_MASK: u8 = 0x80;
/// 属性 ID 掩码
pub const PROPERTY_MASK: u8 = 0x7F;

/// 打包力矩的单值范围（14 位有符号）
pub const PACKED_TORQUE_MAX: i32 = 8191;
pub const PACKED_TORQUE_MIN: i32 = -8192;
/// 每帧最多承载的力矩数
pub const PACKED_TORQUES_PER_FRAME: usize = 4;

/// 构建 get 请求帧
pub fn get_request(bus_id: u16, prop_id: u8) -> BusFrame {
    BusFrame::new(bus_id, &[prop_id & PROPERTY_MASK])
}

/// 构建 set 请求帧
pub fn set_request(bus_id: u16, prop_id: u8, value: i32) -> BusFrame {
    let v = value.to_le_bytes();
    BusFrame::new(
        bus_id,
        &[(prop_id & PROPERTY_MASK) | SET_MASK, 0, v[0], v[1], v[2], v[3]],
    )
}

/// 构建属性应答帧（模拟节点使用）
///
/// 值能用 16 位表示时发送 4 字节帧，否则 6 字节。
pub fn property_reply(bus_id: u16, prop_id: u8, value: i32) -> BusFrame {
    let head = (prop_id & PROPERTY_MASK) | SET_MASK;
    if let Ok(short) = i16::try_from(value) {
        let v = short.to_le_bytes();
        BusFrame::new(bus_id, &[head, 0, v[0], v[1]])
    } else {
        let v = value.to_le_bytes();
        BusFrame::new(bus_id, &[head, 0, v[0], v[1], v[2], v[3]])
    }
}

/// 请求帧是否为 set
pub fn is_set_request(frame: &BusFrame) -> bool {
    frame.len > 0 && frame.data[0] & SET_MASK != 0
}

/// 应答解析器
///
/// 组读取对每个成员的应答调用同一个解析器；解析失败的成员按"无应答"处理。
pub trait ReplyParser {
    type Output: Copy;

    fn parse(&self, frame: &BusFrame) -> Result<Self::Output, ProtocolError>;
}

/// 标准属性应答解析器
#[derive(Debug, Clone, Copy)]
pub struct StandardParser {
    pub prop_id: u8,
}

impl StandardParser {
    pub fn new(prop_id: u8) -> Self {
        Self { prop_id }
    }
}

impl ReplyParser for StandardParser {
    type Output = i32;

    fn parse(&self, frame: &BusFrame) -> Result<i32, ProtocolError> {
        let data = frame.data_slice();
        if data.is_empty() {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: 0,
            });
        }

        let echoed = data[0] & PROPERTY_MASK;
        if echoed != self.prop_id & PROPERTY_MASK {
            return Err(ProtocolError::UnexpectedProperty {
                expected: self.prop_id,
                actual: echoed,
            });
        }

        match data.len() {
            4 => Ok(i16::from_le_bytes([data[2], data[3]]) as i32),
            6 => Ok(i32::from_le_bytes([data[2], data[3], data[4], data[5]])),
            n => Err(ProtocolError::InvalidLength {
                expected: 6,
                actual: n,
            }),
        }
    }
}

/// 组合位置应答解析器
///
/// 主编码器（电机）和可选副编码器（关节）各占 22 位，符号扩展为 i32。
#[derive(Debug, Clone, Copy, Default)]
pub struct CombinedPositionParser;

const POSITION_BITS: u32 = 22;

fn decode_22(b: &[u8]) -> i32 {
    let raw = ((b[0] as i32 & 0x3F) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
    (raw << (32 - POSITION_BITS)) >> (32 - POSITION_BITS)
}

fn encode_22(value: i32, out: &mut [u8]) {
    let raw = value & 0x3F_FFFF;
    out[0] = ((raw >> 16) & 0x3F) as u8;
    out[1] = (raw >> 8) as u8;
    out[2] = raw as u8;
}

impl ReplyParser for CombinedPositionParser {
    type Output = (i32, Option<i32>);

    fn parse(&self, frame: &BusFrame) -> Result<(i32, Option<i32>), ProtocolError> {
        let data = frame.data_slice();
        match data.len() {
            3 => Ok((decode_22(&data[0..3]), None)),
            6 => Ok((decode_22(&data[0..3]), Some(decode_22(&data[3..6])))),
            n => Err(ProtocolError::InvalidLength {
                expected: 6,
                actual: n,
            }),
        }
    }
}

impl CombinedPositionParser {
    /// 构建组合位置应答帧（模拟节点使用）
    pub fn encode(bus_id: u16, primary: i32, secondary: Option<i32>) -> BusFrame {
        let mut data = [0u8; 6];
        encode_22(primary, &mut data[0..3]);
        match secondary {
            Some(s) => {
                encode_22(s, &mut data[3..6]);
                BusFrame::new(bus_id, &data)
            },
            None => BusFrame::new(bus_id, &data[0..3]),
        }
    }
}

/// 构建打包力矩帧
///
/// `torques` 按组内成员顺序排列，超出 14 位的值饱和截断，缺失槽位补 0。
///
/// # 错误
///
/// 超过 4 个值时返回 [`ProtocolError::InvalidLength`]。
pub fn pack_torques(bus_id: u16, prop_id: u8, torques: &[i32]) -> Result<BusFrame, ProtocolError> {
    if torques.len() > PACKED_TORQUES_PER_FRAME {
        return Err(ProtocolError::InvalidLength {
            expected: PACKED_TORQUES_PER_FRAME,
            actual: torques.len(),
        });
    }

    let mut t = [0i32; PACKED_TORQUES_PER_FRAME];
    for (slot, &value) in t.iter_mut().zip(torques) {
        *slot = value.clamp(PACKED_TORQUE_MIN, PACKED_TORQUE_MAX);
    }

    let data = [
        (prop_id & PROPERTY_MASK) | SET_MASK,
        (t[0] >> 6) as u8,
        (((t[0] << 2) & 0xFC) | ((t[1] >> 12) & 0x03)) as u8,
        (t[1] >> 4) as u8,
        (((t[1] << 4) & 0xF0) | ((t[2] >> 10) & 0x0F)) as u8,
        (t[2] >> 2) as u8,
        (((t[2] << 6) & 0xC0) | ((t[3] >> 8) & 0x3F)) as u8,
        t[3] as u8,
    ];
    Ok(BusFrame::new(bus_id, &data))
}

/// 解包打包力矩帧的 4 个 14 位值（模拟节点使用）
pub fn unpack_torques(data: &[u8; 8]) -> [i32; PACKED_TORQUES_PER_FRAME] {
    let d = data.map(|b| b as i32);
    let raw = [
        (d[1] << 6) | (d[2] >> 2),
        ((d[2] & 0x03) << 12) | (d[3] << 4) | (d[4] >> 4),
        ((d[4] & 0x0F) << 10) | (d[5] << 2) | (d[6] >> 6),
        ((d[6] & 0x3F) << 8) | d[7],
    ];
    raw.map(|r| (r << 18) >> 18)
}
