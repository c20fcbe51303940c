//! 应答看门狗
//!
//! 实时周期中的非阻塞组读取偶尔丢一次应答是正常的，但连续丢失说明节点掉线
//! 或总线故障。看门狗统计连续未收齐应答的读取次数，达到阈值后升级为
//! [`DriverError::ReplyLost`]。

use crate::DriverError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{error, warn};

/// 默认阈值：2ms 周期下约 100ms
pub const DEFAULT_MAX_CONSECUTIVE_MISSES: u32 = 50;

/// 应答看门狗
///
/// 计数器为原子类型，可以在其他线程读取。
#[derive(Debug)]
pub struct ReplyWatchdog {
    max_consecutive_misses: u32,
    consecutive_misses: AtomicU32,
    total_misses: AtomicU64,
}

impl Default for ReplyWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_MISSES)
    }
}

impl ReplyWatchdog {
    pub fn new(max_consecutive_misses: u32) -> Self {
        Self {
            max_consecutive_misses: max_consecutive_misses.max(1),
            consecutive_misses: AtomicU32::new(0),
            total_misses: AtomicU64::new(0),
        }
    }

    /// 记录一次读取结果
    ///
    /// `complete` 为真表示所有成员都有应答，计数清零。
    ///
    /// # 错误
    /// 连续未收齐次数达到阈值时返回 `ReplyLost`；之后每次未收齐都继续返回错误，
    /// 直到一次完整读取。
    pub fn record(&self, complete: bool) -> Result<(), DriverError> {
        if complete {
            let previous = self.consecutive_misses.swap(0, Ordering::Relaxed);
            if previous >= self.max_consecutive_misses {
                warn!("Replies restored after {} consecutive misses", previous);
            }
            return Ok(());
        }

        self.total_misses.fetch_add(1, Ordering::Relaxed);
        let misses = self.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1;
        if misses == self.max_consecutive_misses {
            error!("No complete reply for {} consecutive reads", misses);
        }
        if misses >= self.max_consecutive_misses {
            return Err(DriverError::ReplyLost { misses });
        }
        Ok(())
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses.load(Ordering::Relaxed)
    }

    pub fn total_misses(&self) -> u64 {
        self.total_misses.load(Ordering::Relaxed)
    }

    pub fn max_consecutive_misses(&self) -> u32 {
        self.max_consecutive_misses
    }

    pub fn reset(&self) {
        self.consecutive_misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalates_after_exactly_n_misses() {
        let watchdog = ReplyWatchdog::new(3);
        assert!(watchdog.record(false).is_ok());
        assert!(watchdog.record(false).is_ok());
        let err = watchdog.record(false).unwrap_err();
        assert!(matches!(err, DriverError::ReplyLost { misses: 3 }));
        // 持续失败时继续报告
        assert!(watchdog.record(false).is_err());
    }

    #[test]
    fn test_success_resets_counter() {
        let watchdog = ReplyWatchdog::new(3);
        watchdog.record(false).unwrap();
        watchdog.record(false).unwrap();
        watchdog.record(true).unwrap();
        assert_eq!(watchdog.consecutive_misses(), 0);
        assert!(watchdog.record(false).is_ok());
        assert_eq!(watchdog.total_misses(), 3);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let watchdog = ReplyWatchdog::new(0);
        assert_eq!(watchdog.max_consecutive_misses(), 1);
        assert!(watchdog.record(false).is_err());
    }
}
