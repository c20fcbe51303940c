//! 产品代数与急停锁存

use crate::{ClientError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 产品所属的枚举代数
///
/// 产品管理器在急停清理时递增代数；旧产品的句柄随即失效，
/// 任何运动调用都返回 [`ClientError::Stale`]。
#[derive(Debug, Clone)]
pub struct GenerationToken {
    current: Arc<AtomicU64>,
    value: u64,
}

impl GenerationToken {
    pub(crate) fn new(current: &Arc<AtomicU64>) -> Self {
        Self {
            current: current.clone(),
            value: current.load(Ordering::Acquire),
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.value
    }

    pub fn check(&self) -> Result<()> {
        let current = self.current.load(Ordering::Acquire);
        if current == self.value {
            Ok(())
        } else {
            Err(ClientError::Stale {
                handle: self.value,
                current,
            })
        }
    }
}

/// 急停锁存
///
/// 任意线程观测到 ESTOP 后置位；只有产品管理器的急停清理会复位。
/// 实时线程只读该标志，不访问总线。
#[derive(Debug, Default)]
pub struct EstopLatch {
    observed: AtomicBool,
}

impl EstopLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位；返回之前是否已置位
    pub fn set(&self) -> bool {
        self.observed.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.observed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_goes_stale_on_bump() {
        let shared = Arc::new(AtomicU64::new(0));
        let token = GenerationToken::new(&shared);
        assert!(token.check().is_ok());

        shared.fetch_add(1, Ordering::AcqRel);
        assert!(!token.is_current());
        assert!(matches!(
            token.check(),
            Err(ClientError::Stale {
                handle: 0,
                current: 1
            })
        ));
    }

    #[test]
    fn test_latch() {
        let latch = EstopLatch::new();
        assert!(!latch.set());
        assert!(latch.set());
        assert!(latch.is_set());
        latch.clear();
        assert!(!latch.is_set());
    }
}
