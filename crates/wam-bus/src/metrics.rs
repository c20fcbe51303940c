//! 总线指标
//!
//! 原子计数器，可以在任何线程读取，不会引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 总线实时指标
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// 发送的总帧数
    pub tx_frames: AtomicU64,

    /// 接收的总帧数（包括被暂存的帧）
    pub rx_frames: AtomicU64,

    /// 暂存到邮箱的帧数（收到的不是当前等待的 ID）
    pub rx_parked: AtomicU64,

    /// 邮箱覆盖次数
    ///
    /// 同一 ID 的旧帧尚未被取走就被新帧覆盖。持续增长说明有节点在发送
    /// 无人接收的应答。
    pub rx_mailbox_overwrites: AtomicU64,

    /// 阻塞接收超时次数
    pub rx_timeouts: AtomicU64,

    /// 设备错误次数
    pub device_errors: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_parked: self.rx_parked.load(Ordering::Relaxed),
            rx_mailbox_overwrites: self.rx_mailbox_overwrites.load(Ordering::Relaxed),
            rx_timeouts: self.rx_timeouts.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.tx_frames.store(0, Ordering::Relaxed);
        self.rx_frames.store(0, Ordering::Relaxed);
        self.rx_parked.store(0, Ordering::Relaxed);
        self.rx_mailbox_overwrites.store(0, Ordering::Relaxed);
        self.rx_timeouts.store(0, Ordering::Relaxed);
        self.device_errors.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusMetricsSnapshot {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub rx_parked: u64,
    pub rx_mailbox_overwrites: u64,
    pub rx_timeouts: u64,
    pub device_errors: u64,
}
