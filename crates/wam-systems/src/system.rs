//! 系统（信号流节点）接口

use crate::{PortKey, SystemError};
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// 端口列表
pub type PortList = SmallVec<[PortKey; 4]>;

/// 已注册系统的句柄
///
/// 带代数：系统被移除后旧句柄不会指向复用同一槽位的新系统。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// 每次 tick 的时间信息
#[derive(Debug, Clone, Copy)]
pub struct TickInfo {
    /// 从 0 开始的 tick 序号
    pub tick: u64,
    /// 距上一次 tick 的实际时间（首次为名义周期）
    pub dt: Duration,
    /// 本次 tick 开始时刻
    pub now: Instant,
}

impl TickInfo {
    pub fn dt_secs(&self) -> f64 {
        self.dt.as_secs_f64()
    }
}

/// 信号流节点
///
/// `inputs`/`outputs` 在注册时调用一次，用于建立端口到系统的映射；
/// `operate` 在执行管理器的图锁内被调用，每次 tick 最多一次。
pub trait System: Send {
    fn name(&self) -> &str;

    fn inputs(&self) -> PortList {
        PortList::new()
    }

    fn outputs(&self) -> PortList {
        PortList::new()
    }

    fn operate(&mut self, tick: &TickInfo) -> Result<(), SystemError>;
}
