//! 总线管理器
//!
//! 把单线程的 [`CanAdapter`] 包装成可跨线程共享的 [`CommunicationsBus`]：
//!
//! - 事务锁：`parking_lot::ReentrantMutex<()>`，同一线程可嵌套获取
//! - 适配器锁：`parking_lot::Mutex`，只在单次 send/receive 内持有
//! - 邮箱：每个 11 位 ID 一个槽位，保存最近一帧（新帧覆盖旧帧）

use crate::{BusError, BusFrame, BusMetrics, CanAdapter, CommunicationsBus, Wait};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{trace, warn};
use wam_protocol::BUS_ID_MASK;

const MAILBOX_COUNT: usize = BUS_ID_MASK as usize + 1;

struct Inner<A> {
    adapter: A,
    mailboxes: Box<[Option<BusFrame>]>,
}

impl<A: CanAdapter> Inner<A> {
    fn take_parked(&mut self, bus_id: u16) -> Option<BusFrame> {
        self.mailboxes[(bus_id & BUS_ID_MASK) as usize].take()
    }

    fn park(&mut self, frame: BusFrame, metrics: &BusMetrics) {
        let slot = &mut self.mailboxes[(frame.id & BUS_ID_MASK) as usize];
        if slot.is_some() {
            metrics.rx_mailbox_overwrites.fetch_add(1, Ordering::Relaxed);
        }
        metrics.rx_parked.fetch_add(1, Ordering::Relaxed);
        *slot = Some(frame);
    }
}

/// 标准总线管理器
///
/// # 示例
///
/// ```no_run
/// # #[cfg(target_os = "linux")]
/// # fn main() -> Result<(), wam_bus::BusError> {
/// use std::sync::Arc;
/// use wam_bus::{BusManager, CommunicationsBus, SocketCanAdapter};
///
/// let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(SocketCanAdapter::new("can0")?));
/// # Ok(())
/// # }
/// # #[cfg(not(target_os = "linux"))]
/// # fn main() {}
/// ```
pub struct BusManager<A> {
    transaction: ReentrantMutex<()>,
    inner: Mutex<Inner<A>>,
    metrics: BusMetrics,
}

impl<A: CanAdapter> BusManager<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            transaction: ReentrantMutex::new(()),
            inner: Mutex::new(Inner {
                adapter,
                mailboxes: vec![None; MAILBOX_COUNT].into_boxed_slice(),
            }),
            metrics: BusMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }

    /// 丢弃所有暂存帧
    pub fn clear_mailboxes(&self) {
        let mut inner = self.inner.lock();
        inner.mailboxes.iter_mut().for_each(|slot| *slot = None);
    }

    fn receive_nonblocking(&self, inner: &mut Inner<A>, bus_id: u16) -> Result<BusFrame, BusError> {
        // 排空适配器中已到达的帧，找到目标前把其他帧暂存
        loop {
            match inner.adapter.try_receive() {
                Ok(Some(frame)) => {
                    self.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
                    if frame.id == bus_id {
                        return Ok(frame);
                    }
                    inner.park(frame, &self.metrics);
                },
                Ok(None) => return Err(BusError::WouldBlock),
                Err(e) => {
                    self.metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                },
            }
        }
    }

    fn receive_blocking(
        &self,
        inner: &mut Inner<A>,
        bus_id: u16,
        timeout: Duration,
    ) -> Result<BusFrame, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.metrics.rx_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(BusError::Timeout);
            }

            match inner.adapter.receive_timeout(remaining) {
                Ok(frame) => {
                    self.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
                    if frame.id == bus_id {
                        return Ok(frame);
                    }
                    trace!(
                        "Parking frame 0x{:03X} while waiting for 0x{:03X}",
                        frame.id, bus_id
                    );
                    inner.park(frame, &self.metrics);
                },
                Err(BusError::Timeout) => {
                    self.metrics.rx_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(BusError::Timeout);
                },
                Err(e) => {
                    self.metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Bus receive failed while waiting for 0x{:03X}: {}", bus_id, e);
                    return Err(e);
                },
            }
        }
    }
}

impl<A: CanAdapter + Send> CommunicationsBus for BusManager<A> {
    fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.transaction.lock()
    }

    fn send(&self, bus_id: u16, data: &[u8]) -> Result<(), BusError> {
        let frame = BusFrame::new(bus_id, data);
        let mut inner = self.inner.lock();
        match inner.adapter.send(frame) {
            Ok(()) => {
                self.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(e) => {
                self.metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            },
        }
    }

    fn receive(&self, bus_id: u16, wait: Wait) -> Result<BusFrame, BusError> {
        let bus_id = bus_id & BUS_ID_MASK;
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.take_parked(bus_id) {
            return Ok(frame);
        }

        match wait {
            Wait::NonBlocking => self.receive_nonblocking(&mut inner, bus_id),
            Wait::Timeout(timeout) => self.receive_blocking(&mut inner, bus_id, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// 预置接收队列的适配器
    struct ScriptedAdapter {
        rx: VecDeque<BusFrame>,
        sent: Arc<Mutex<Vec<BusFrame>>>,
    }

    impl ScriptedAdapter {
        fn new(rx: Vec<BusFrame>) -> (Self, Arc<Mutex<Vec<BusFrame>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    rx: rx.into(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    impl CanAdapter for ScriptedAdapter {
        fn send(&mut self, frame: BusFrame) -> Result<(), BusError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        fn receive_timeout(&mut self, _timeout: Duration) -> Result<BusFrame, BusError> {
            self.rx.pop_front().ok_or(BusError::Timeout)
        }

        fn try_receive(&mut self) -> Result<Option<BusFrame>, BusError> {
            Ok(self.rx.pop_front())
        }
    }

    #[test]
    fn test_send_records_frame() {
        let (adapter, sent) = ScriptedAdapter::new(vec![]);
        let bus = BusManager::new(adapter);
        bus.send(0x001, &[5]).unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x001);
        assert_eq!(bus.metrics().snapshot().tx_frames, 1);
    }

    #[test]
    fn test_reply_for_other_id_is_parked() {
        let a = BusFrame::new(0x020, &[0x85, 0, 2, 0]);
        let b = BusFrame::new(0x040, &[0x85, 0, 0, 0]);
        let (adapter, _) = ScriptedAdapter::new(vec![b, a]);
        let bus = BusManager::new(adapter);

        // 等待 A 时先收到 B，B 被暂存
        let got = bus.receive(0x020, Wait::Timeout(Duration::from_millis(10))).unwrap();
        assert_eq!(got, a);

        // 之后对 B 的接收直接从邮箱拿到
        let got = bus.receive(0x040, Wait::NonBlocking).unwrap();
        assert_eq!(got, b);
        assert_eq!(bus.metrics().snapshot().rx_parked, 1);
    }

    #[test]
    fn test_nonblocking_miss_is_would_block() {
        let (adapter, _) = ScriptedAdapter::new(vec![]);
        let bus = BusManager::new(adapter);
        assert!(matches!(
            bus.receive(0x020, Wait::NonBlocking),
            Err(BusError::WouldBlock)
        ));
    }

    #[test]
    fn test_blocking_miss_is_timeout() {
        let other = BusFrame::new(0x060, &[1]);
        let (adapter, _) = ScriptedAdapter::new(vec![other]);
        let bus = BusManager::new(adapter);
        assert!(matches!(
            bus.receive(0x020, Wait::Timeout(Duration::from_millis(5))),
            Err(BusError::Timeout)
        ));
        // 超时期间收到的帧仍然保留
        assert_eq!(bus.receive(0x060, Wait::NonBlocking).unwrap(), other);
    }

    #[test]
    fn test_mailbox_keeps_latest() {
        let old = BusFrame::new(0x040, &[1]);
        let new = BusFrame::new(0x040, &[2]);
        let (adapter, _) = ScriptedAdapter::new(vec![old, new]);
        let bus = BusManager::new(adapter);

        assert!(bus.receive(0x020, Wait::NonBlocking).is_err());
        assert_eq!(bus.receive(0x040, Wait::NonBlocking).unwrap(), new);
        assert_eq!(bus.metrics().snapshot().rx_mailbox_overwrites, 1);
    }

    #[test]
    fn test_lock_is_reentrant_and_exclusive() {
        let (adapter, _) = ScriptedAdapter::new(vec![]);
        let bus = Arc::new(BusManager::new(adapter));

        let outer = bus.lock();
        let inner = bus.lock();

        let other = bus.clone();
        let handle = std::thread::spawn(move || {
            let _guard = other.lock();
            Instant::now()
        });

        std::thread::sleep(Duration::from_millis(20));
        let released_at = Instant::now();
        drop(inner);
        drop(outer);

        let acquired_at = handle.join().unwrap();
        assert!(acquired_at >= released_at);
    }
}
