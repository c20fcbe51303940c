//! 属性表
//!
//! Puck 属性的线上 ID 取决于 (有效类型, 固件版本)。同一个逻辑属性在不同类型
//! 的 Puck 上、或在新旧固件之间可能对应不同的 ID，也可能根本不存在。
//!
//! 查表是纯函数：静态表，线性扫描，不分配内存。

use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ProtocolError;

/// 逻辑属性名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Property {
    Vers,
    Role,
    Sn,
    Id,
    Error,
    Stat,
    Addr,
    Value,
    Mode,
    Temp,
    Ptemp,
    Otemp,
    Baud,
    Lock,
    Grpa,
    Grpb,
    Grpc,
    Cmd,
    Save,
    Load,
    Def,
    Find,
    Hold,
    Tstop,
    T,
    Mt,
    V,
    Mv,
    P,
    E,
    Poles,
    Ikcor,
    Ioff,
    Cts,
    Jidx,
    Ipnm,
    Sg,
    Tact,
    Zero,
    Vl1,
    Vl2,
    Tl1,
    Tl2,
    Voltl1,
    Volth1,
    Ft,
}

impl Property {
    /// 写入该属性后是否需要回读确认
    ///
    /// 状态切换和非易失存储类属性写错会让节点进入不可预期状态，必须确认；
    /// 力矩/位置等高频属性不确认。
    pub const fn requires_ack(self) -> bool {
        matches!(
            self,
            Property::Stat
                | Property::Mode
                | Property::Save
                | Property::Def
                | Property::Load
                | Property::Grpa
                | Property::Grpb
                | Property::Grpc
        )
    }

    /// 按名称解析（大小写不敏感），供 CLI 使用
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_PROPERTIES
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// 固件手册中的属性名
    pub const fn name(self) -> &'static str {
        match self {
            Property::Vers => "VERS",
            Property::Role => "ROLE",
            Property::Sn => "SN",
            Property::Id => "ID",
            Property::Error => "ERROR",
            Property::Stat => "STAT",
            Property::Addr => "ADDR",
            Property::Value => "VALUE",
            Property::Mode => "MODE",
            Property::Temp => "TEMP",
            Property::Ptemp => "PTEMP",
            Property::Otemp => "OTEMP",
            Property::Baud => "BAUD",
            Property::Lock => "LOCK",
            Property::Grpa => "GRPA",
            Property::Grpb => "GRPB",
            Property::Grpc => "GRPC",
            Property::Cmd => "CMD",
            Property::Save => "SAVE",
            Property::Load => "LOAD",
            Property::Def => "DEF",
            Property::Find => "FIND",
            Property::Hold => "HOLD",
            Property::Tstop => "TSTOP",
            Property::T => "T",
            Property::Mt => "MT",
            Property::V => "V",
            Property::Mv => "MV",
            Property::P => "P",
            Property::E => "E",
            Property::Poles => "POLES",
            Property::Ikcor => "IKCOR",
            Property::Ioff => "IOFF",
            Property::Cts => "CTS",
            Property::Jidx => "JIDX",
            Property::Ipnm => "IPNM",
            Property::Sg => "SG",
            Property::Tact => "TACT",
            Property::Zero => "ZERO",
            Property::Vl1 => "VL1",
            Property::Vl2 => "VL2",
            Property::Tl1 => "TL1",
            Property::Tl2 => "TL2",
            Property::Voltl1 => "VOLTL1",
            Property::Volth1 => "VOLTH1",
            Property::Ft => "FT",
        }
    }
}

const ALL_PROPERTIES: &[Property] = &[
    Property::Vers,
    Property::Role,
    Property::Sn,
    Property::Id,
    Property::Error,
    Property::Stat,
    Property::Addr,
    Property::Value,
    Property::Mode,
    Property::Temp,
    Property::Ptemp,
    Property::Otemp,
    Property::Baud,
    Property::Lock,
    Property::Grpa,
    Property::Grpb,
    Property::Grpc,
    Property::Cmd,
    Property::Save,
    Property::Load,
    Property::Def,
    Property::Find,
    Property::Hold,
    Property::Tstop,
    Property::T,
    Property::Mt,
    Property::V,
    Property::Mv,
    Property::P,
    Property::E,
    Property::Poles,
    Property::Ikcor,
    Property::Ioff,
    Property::Cts,
    Property::Jidx,
    Property::Ipnm,
    Property::Sg,
    Property::Tact,
    Property::Zero,
    Property::Vl1,
    Property::Vl2,
    Property::Tl1,
    Property::Tl2,
    Property::Voltl1,
    Property::Volth1,
    Property::Ft,
];

/// Puck 类型
///
/// 声明类型来自 ROLE 属性；有效类型在节点未处于 READY 状态时被降级为 `Monitor`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PuckType {
    /// 监控固件（节点处于 RESET 状态）
    Monitor,
    /// 安全模块
    Safety,
    /// 电机控制器
    Motor,
    /// 六维力/力矩传感器
    ForceTorque,
    #[default]
    Unknown,
}

impl PuckType {
    /// 从 ROLE 低 4 位解析类型
    pub fn from_role(role: u16) -> Self {
        match role & 0x0F {
            0 | 5 => PuckType::Motor, // Tater / BHand
            2 => PuckType::Safety,
            6 => PuckType::ForceTorque,
            _ => PuckType::Unknown, // Gimbals 及未知产品
        }
    }
}

/// ROLE 属性位域
///
/// 低 4 位为产品角色，高字节是选件标志。
#[bitsize(16)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq)]
pub struct RoleWord {
    pub product: u4,       // Bit 0-3: 产品角色
    pub reserved: u4,      // Bit 4-7: 保留
    pub mag_encoder: bool, // Bit 8: 磁编码器
    pub strain: bool,      // Bit 9: 应变片
    pub tact: bool,        // Bit 10: 触觉阵列
    pub ops: bool,         // Bit 11: 保留选件
    pub reserved2: u4,     // Bit 12-15: 保留
}

impl RoleWord {
    /// 声明的 Puck 类型
    pub fn puck_type(&self) -> PuckType {
        PuckType::from_role(self.product().value() as u16)
    }
}

/// Puck 选件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuckOption {
    MagEncoder,
    Strain,
    Tact,
}

impl RoleWord {
    pub fn has_option(&self, option: PuckOption) -> bool {
        match option {
            PuckOption::MagEncoder => self.mag_encoder(),
            PuckOption::Strain => self.strain(),
            PuckOption::Tact => self.tact(),
        }
    }
}

/// STAT 属性取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum PuckStatus {
    Reset = 0,
    Ready = 2,
}

/// 区分新旧电机固件属性布局的版本号
pub const MOTOR_LAYOUT_VERSION: u16 = 40;

/// 查表用的角色类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleClass {
    /// 所有类型（含 Monitor）
    Any,
    Motor,
    Safety,
    ForceTorque,
}

impl RoleClass {
    const fn matches(self, puck_type: PuckType) -> bool {
        match self {
            RoleClass::Any => true,
            RoleClass::Motor => matches!(puck_type, PuckType::Motor),
            RoleClass::Safety => matches!(puck_type, PuckType::Safety),
            RoleClass::ForceTorque => matches!(puck_type, PuckType::ForceTorque),
        }
    }
}

struct Entry {
    property: Property,
    class: RoleClass,
    /// 固件版本区间 [min, max)
    vers: (u16, u16),
    id: u8,
}

const fn entry(property: Property, class: RoleClass, vers: (u16, u16), id: u8) -> Entry {
    Entry {
        property,
        class,
        vers,
        id,
    }
}

const ALL: (u16, u16) = (0, u16::MAX);
const LEGACY: (u16, u16) = (0, MOTOR_LAYOUT_VERSION);
const MODERN: (u16, u16) = (MOTOR_LAYOUT_VERSION, u16::MAX);

use Property as P;
use RoleClass::{Any, ForceTorque as Ft, Motor as Mot, Safety as Saf};

#[rustfmt::skip]
static TABLE: &[Entry] = &[
    // 通用属性（Monitor 固件也支持）
    entry(P::Vers, Any, ALL, 0),
    entry(P::Role, Any, ALL, 1),
    entry(P::Sn, Any, ALL, 2),
    entry(P::Id, Any, ALL, 3),
    entry(P::Error, Any, ALL, 4),
    entry(P::Stat, Any, ALL, 5),
    entry(P::Addr, Any, ALL, 6),
    entry(P::Value, Any, ALL, 7),
    entry(P::Mode, Any, ALL, 8),

    // 电机：两种固件共有的前段
    entry(P::Temp, Mot, ALL, 9),
    entry(P::Ptemp, Mot, ALL, 10),
    entry(P::Otemp, Mot, ALL, 11),
    entry(P::Baud, Mot, ALL, 12),
    entry(P::Lock, Mot, ALL, 13),
    entry(P::Grpa, Mot, ALL, 26),
    entry(P::Grpb, Mot, ALL, 27),
    entry(P::Grpc, Mot, ALL, 28),
    entry(P::Cmd, Mot, ALL, 29),
    entry(P::Save, Mot, ALL, 30),
    entry(P::Load, Mot, ALL, 31),
    entry(P::Def, Mot, ALL, 32),
    entry(P::Find, Mot, ALL, 33),

    // 电机：新固件
    entry(P::Hold, Mot, MODERN, 36),
    entry(P::Tstop, Mot, MODERN, 38),
    entry(P::T, Mot, MODERN, 42),
    entry(P::Mt, Mot, MODERN, 43),
    entry(P::V, Mot, MODERN, 44),
    entry(P::Mv, Mot, MODERN, 45),
    entry(P::P, Mot, MODERN, 48),
    entry(P::E, Mot, MODERN, 52),
    entry(P::Poles, Mot, MODERN, 55),
    entry(P::Ikcor, Mot, MODERN, 56),
    entry(P::Ioff, Mot, MODERN, 58),
    entry(P::Cts, Mot, MODERN, 68),
    entry(P::Jidx, Mot, MODERN, 70),
    entry(P::Ipnm, Mot, MODERN, 72),
    entry(P::Sg, Mot, MODERN, 76),
    entry(P::Tact, Mot, MODERN, 106),

    // 电机：旧固件
    entry(P::T, Mot, LEGACY, 36),
    entry(P::Mt, Mot, LEGACY, 37),
    entry(P::V, Mot, LEGACY, 38),
    entry(P::Mv, Mot, LEGACY, 39),
    entry(P::P, Mot, LEGACY, 40),
    entry(P::E, Mot, LEGACY, 41),
    entry(P::Poles, Mot, LEGACY, 46),
    entry(P::Ikcor, Mot, LEGACY, 47),
    entry(P::Ioff, Mot, LEGACY, 48),
    entry(P::Cts, Mot, LEGACY, 50),
    entry(P::Ipnm, Mot, LEGACY, 52),

    // 安全模块
    entry(P::Zero, Saf, ALL, 9),
    entry(P::Vl1, Saf, ALL, 10),
    entry(P::Vl2, Saf, ALL, 11),
    entry(P::Tl1, Saf, ALL, 12),
    entry(P::Tl2, Saf, ALL, 13),
    entry(P::Voltl1, Saf, ALL, 14),
    entry(P::Volth1, Saf, ALL, 16),
    entry(P::Baud, Saf, ALL, 19),
    entry(P::Lock, Saf, ALL, 20),
    entry(P::Cmd, Saf, ALL, 29),
    entry(P::Save, Saf, ALL, 30),
    entry(P::Load, Saf, ALL, 31),
    entry(P::Def, Saf, ALL, 32),
    entry(P::Find, Saf, ALL, 33),

    // 力/力矩传感器
    entry(P::Temp, Ft, ALL, 9),
    entry(P::Baud, Ft, ALL, 12),
    entry(P::Cmd, Ft, ALL, 29),
    entry(P::Save, Ft, ALL, 30),
    entry(P::Load, Ft, ALL, 31),
    entry(P::Def, Ft, ALL, 32),
    entry(P::Find, Ft, ALL, 33),
    entry(P::Ft, Ft, ALL, 54),
];

/// 探测属性 ID（不支持时返回 `None`）
///
/// # 参数
///
/// - `puck_type`: Puck 的**有效**类型
/// - `vers`: 固件版本
pub fn property_id(property: Property, puck_type: PuckType, vers: u16) -> Option<u8> {
    TABLE
        .iter()
        .find(|e| {
            e.property == property
                && e.class.matches(puck_type)
                && vers >= e.vers.0
                && vers < e.vers.1
        })
        .map(|e| e.id)
}

/// 解析属性 ID
///
/// # 错误
///
/// 表中没有匹配项时返回 [`ProtocolError::UnsupportedProperty`]。
pub fn require_property_id(
    property: Property,
    puck_type: PuckType,
    vers: u16,
) -> Result<u8, ProtocolError> {
    property_id(property, puck_type, vers).ok_or(ProtocolError::UnsupportedProperty {
        property,
        puck_type,
        vers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_properties_resolve_for_every_type() {
        for ty in [
            PuckType::Monitor,
            PuckType::Safety,
            PuckType::Motor,
            PuckType::ForceTorque,
            PuckType::Unknown,
        ] {
            assert_eq!(property_id(Property::Stat, ty, 0), Some(5));
            assert_eq!(property_id(Property::Vers, ty, 200), Some(0));
        }
    }

    #[test]
    fn test_motor_layout_depends_on_firmware() {
        assert_eq!(property_id(Property::P, PuckType::Motor, 39), Some(40));
        assert_eq!(property_id(Property::P, PuckType::Motor, 40), Some(48));
        assert_eq!(property_id(Property::T, PuckType::Motor, 10), Some(36));
        assert_eq!(property_id(Property::T, PuckType::Motor, 150), Some(42));
    }

    #[test]
    fn test_probe_absent_for_unsupported_combination() {
        assert_eq!(property_id(Property::Hold, PuckType::Motor, 20), None);
        assert_eq!(property_id(Property::Zero, PuckType::Motor, 150), None);
        assert_eq!(property_id(Property::Ft, PuckType::Safety, 150), None);
    }

    #[test]
    fn test_monitor_only_resolves_common_properties() {
        assert_eq!(property_id(Property::Mode, PuckType::Monitor, 150), Some(8));
        assert_eq!(property_id(Property::P, PuckType::Monitor, 150), None);
        assert_eq!(property_id(Property::Cts, PuckType::Monitor, 150), None);
    }

    #[test]
    fn test_require_reports_unsupported() {
        let err = require_property_id(Property::Tact, PuckType::Motor, 12).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnsupportedProperty {
                property: Property::Tact,
                puck_type: PuckType::Motor,
                vers: 12,
            }
        );
        assert_eq!(
            require_property_id(Property::Zero, PuckType::Safety, 150),
            Ok(9)
        );
    }

    #[test]
    fn test_no_duplicate_entries() {
        for (i, a) in TABLE.iter().enumerate() {
            for b in &TABLE[i + 1..] {
                let overlap = a.vers.0 < b.vers.1 && b.vers.0 < a.vers.1;
                let same_class = a.class == b.class || a.class == Any || b.class == Any;
                assert!(
                    !(a.property == b.property && same_class && overlap),
                    "duplicate entry for {:?}",
                    a.property
                );
            }
        }
    }

    #[test]
    fn test_role_word() {
        let role = RoleWord::from(0x0205u16);
        assert_eq!(role.puck_type(), PuckType::Motor);
        assert!(role.has_option(PuckOption::Strain));
        assert!(!role.has_option(PuckOption::Tact));

        assert_eq!(RoleWord::from(0x0002u16).puck_type(), PuckType::Safety);
        assert_eq!(RoleWord::from(0x0006u16).puck_type(), PuckType::ForceTorque);
        assert_eq!(RoleWord::from(0x0001u16).puck_type(), PuckType::Unknown);
    }

    #[test]
    fn test_status_conversion() {
        assert!(matches!(PuckStatus::try_from(2), Ok(PuckStatus::Ready)));
        assert!(PuckStatus::try_from(1).is_err());
        assert_eq!(i32::from(PuckStatus::Reset), 0);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Property::from_name("mode"), Some(Property::Mode));
        assert_eq!(Property::from_name("VOLTH1"), Some(Property::Volth1));
        assert_eq!(Property::from_name("nope"), None);
    }

    #[test]
    fn test_requires_ack() {
        assert!(Property::Mode.requires_ack());
        assert!(Property::Stat.requires_ack());
        assert!(!Property::T.requires_ack());
    }
}
