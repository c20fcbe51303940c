//! # WAM Bus Transport
//!
//! 总线传输层：CAN 硬件抽象 + 带事务锁和按 ID 邮箱的总线管理器。
//!
//! ## 分层
//!
//! - [`CanAdapter`]：硬件后端（SocketCAN、模拟总线），单线程 `&mut self` 收发
//! - [`CommunicationsBus`]：上层使用的共享总线接口（`&self`，可跨线程），
//!   提供可重入的事务锁，保证多帧请求/应答不会与其他总线用户交错
//! - [`BusManager`]：`CommunicationsBus` 的标准实现，包装任意 `CanAdapter`

use std::time::Duration;
use thiserror::Error;

pub use parking_lot::ReentrantMutexGuard;
pub use wam_protocol::BusFrame;

pub mod manager;
pub mod metrics;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use manager::BusManager;
pub use metrics::{BusMetrics, BusMetricsSnapshot};

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

/// 总线层统一错误类型
#[derive(Error, Debug)]
pub enum BusError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] BusDeviceError),
    /// 阻塞接收超时
    #[error("Read timeout")]
    Timeout,
    /// 非阻塞接收时尚无数据
    #[error("No frame available")]
    WouldBlock,
    #[error("Bus off")]
    BusOff,
    /// 后端已关闭（模拟总线断开等）
    #[error("Bus closed")]
    Closed,
}

impl BusError {
    /// 是否为"暂时没有数据"类错误（可重试）
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout | BusError::WouldBlock)
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDeviceErrorKind {
    Unknown,
    NotFound,
    AccessDenied,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct BusDeviceError {
    pub kind: BusDeviceErrorKind,
    pub message: String,
}

impl BusDeviceError {
    pub fn new(kind: BusDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            BusDeviceErrorKind::AccessDenied | BusDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for BusDeviceError {
    fn from(message: String) -> Self {
        Self::new(BusDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for BusDeviceError {
    fn from(message: &str) -> Self {
        Self::new(BusDeviceErrorKind::Unknown, message)
    }
}

/// CAN 硬件后端
pub trait CanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), BusError>;

    /// 阻塞接收，超时返回 [`BusError::Timeout`]
    fn receive_timeout(&mut self, timeout: Duration) -> Result<BusFrame, BusError>;

    /// 非阻塞接收，没有数据时返回 `Ok(None)`
    fn try_receive(&mut self) -> Result<Option<BusFrame>, BusError>;
}

/// 接收等待策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// 立即返回；无数据时返回 [`BusError::WouldBlock`]
    NonBlocking,
    /// 最多等待给定时长；到期返回 [`BusError::Timeout`]
    Timeout(Duration),
}

impl Wait {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Wait::Timeout(_))
    }
}

/// 共享总线接口
///
/// 所有方法都是 `&self`，实现者负责内部同步。
///
/// # 事务
///
/// [`lock`](Self::lock) 返回可重入的作用域锁。持有期间其他线程的
/// `lock()` 会阻塞，同一线程可以嵌套获取：
///
/// ```ignore
/// let _guard = bus.lock();
/// bus.send(bus_id, &request)?;
/// let reply = bus.receive(reply_id, Wait::Timeout(timeout))?;
/// ```
pub trait CommunicationsBus: Send + Sync {
    fn lock(&self) -> ReentrantMutexGuard<'_, ()>;

    fn send(&self, bus_id: u16, data: &[u8]) -> Result<(), BusError>;

    /// 接收发往/来自 `bus_id` 的下一帧
    ///
    /// 等待期间收到的其他 ID 的帧会被暂存，供之后对应 ID 的接收使用。
    fn receive(&self, bus_id: u16, wait: Wait) -> Result<BusFrame, BusError>;
}
