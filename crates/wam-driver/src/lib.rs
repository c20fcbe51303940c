//! # WAM Driver
//!
//! 节点协议层：单个 Puck 与 Puck 组的属性事务。
//!
//! ## 模块
//!
//! - `puck`: 单节点身份（VERS/ROLE/STAT）、属性读写、唤醒
//! - `group`: 组读取（单截止时间、缺失成员为 `None`）、广播写、打包力矩
//! - `watchdog`: 连续丢失应答的升级策略
//!
//! 所有事务都在总线的可重入锁内完成，与实时控制周期不会交错。

pub mod error;
pub mod group;
pub mod puck;
pub mod watchdog;

pub use error::DriverError;
pub use group::{CombinedPosition, GroupReplies, PuckGroup, ReplyRoute};
pub use puck::{
    DEFAULT_REPLY_TIMEOUT, Puck, get_property_raw, receive_get_reply, receive_reply,
    send_get_request, set_property_acked, set_property_raw, try_get_property_raw,
};
pub use watchdog::{DEFAULT_MAX_CONSECUTIVE_MISSES, ReplyWatchdog};
