//! BarrettHand（简化）
//!
//! 四个电机 Puck（ID 11..=14：三个手指 + 张开），组 HAND。
//! 只提供整手的开合与状态查询，不包含触觉和应变片读取。

use crate::generation::GenerationToken;
use crate::{ClientError, Result};
use nalgebra::SVector;
use std::f64::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use wam_driver::{DriverError, Puck, PuckGroup};
use wam_protocol::{Property, groups};

/// 手爪自由度
pub const HAND_DOF: usize = 4;
/// 第一个手爪 Puck 的 ID
pub const FIRST_HAND_ID: u8 = 11;

/// 电机固件命令
const CMD_CLOSE: i32 = 18;
const CMD_OPEN: i32 = 20;

/// 电机固件模式
const MODE_IDLE: i32 = 0;
const MODE_PID: i32 = 3;

pub type HandVector = SVector<f64, HAND_DOF>;

/// BarrettHand
pub struct Hand {
    group: PuckGroup,
    ids: [u8; HAND_DOF],
    counts_per_rad: [f64; HAND_DOF],
    holds: [bool; HAND_DOF],
    reply_timeout: Duration,
    generation: GenerationToken,
}

impl std::fmt::Debug for Hand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hand")
            .field("ids", &self.ids)
            .field("generation", &self.generation.value())
            .finish()
    }
}

impl Hand {
    /// `pucks` 为 ID 11..=14 的已唤醒电机 Puck
    pub(crate) fn new(pucks: &[&Puck], generation: GenerationToken) -> Result<Self> {
        if pucks.len() != HAND_DOF {
            return Err(DriverError::InvalidInput(format!(
                "hand needs {} pucks, got {}",
                HAND_DOF,
                pucks.len()
            ))
            .into());
        }

        let mut ids = [0u8; HAND_DOF];
        let mut counts_per_rad = [0.0; HAND_DOF];
        for (i, puck) in pucks.iter().enumerate() {
            ids[i] = puck.id();
            counts_per_rad[i] = puck.get_property(Property::Cts)? as f64 / TAU;
        }

        let group = PuckGroup::new(groups::HAND, pucks)?;
        let reply_timeout = pucks[0].reply_timeout();

        // 没有应答的 HOLD 视为不保持
        let mut holds = [false; HAND_DOF];
        match group.get_property(Property::Hold, reply_timeout) {
            Ok(replies) => {
                for (slot, reply) in holds.iter_mut().zip(replies) {
                    *slot = reply.is_some_and(|v| v != 0);
                }
            },
            Err(e) => debug!("Hand HOLD not available: {}", e),
        }

        Ok(Self {
            group,
            ids,
            counts_per_rad,
            holds,
            reply_timeout,
            generation,
        })
    }

    pub fn ids(&self) -> &[u8; HAND_DOF] {
        &self.ids
    }

    fn command(&self, cmd: i32) -> Result<()> {
        self.generation.check()?;
        self.group.set_property(Property::Cmd, cmd)?;
        Ok(())
    }

    pub fn open(&self) -> Result<()> {
        debug!("Opening hand");
        self.command(CMD_OPEN)
    }

    pub fn close(&self) -> Result<()> {
        debug!("Closing hand");
        self.command(CMD_CLOSE)
    }

    /// 所有手指是否停止运动
    ///
    /// 电机处于 IDLE，或处于 PID 且 HOLD 打开时视为停止。
    pub fn done_moving(&self) -> Result<bool> {
        self.generation.check()?;
        let modes = self.group.get_property(Property::Mode, self.reply_timeout)?;
        for (i, mode) in modes.iter().enumerate() {
            let mode = mode.ok_or(DriverError::Timeout {
                id: self.ids[i],
                timeout: self.reply_timeout,
            })?;
            let stopped = mode == MODE_IDLE || (mode == MODE_PID && self.holds[i]);
            if !stopped {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 轮询直到停止运动；超时返回 `ClientError::Timeout`
    pub fn wait_until_done_moving(&self, poll_period: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.done_moving()? {
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(timeout));
            }
            thread::sleep(poll_period);
        }
        Ok(())
    }

    /// 电机位置（rad）
    pub fn positions(&self) -> Result<HandVector> {
        self.generation.check()?;
        let counts = self.group.get_property(Property::P, self.reply_timeout)?;
        let mut q = HandVector::zeros();
        for (i, c) in counts.iter().enumerate() {
            let c = c.ok_or(DriverError::Timeout {
                id: self.ids[i],
                timeout: self.reply_timeout,
            })?;
            q[i] = c as f64 / self.counts_per_rad[i];
        }
        Ok(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use wam_bus::mock::{SimPuck, SimulatedBus};
    use wam_bus::{BusManager, CommunicationsBus};

    fn hand() -> (SimulatedBus, Hand) {
        hand_with(|_, puck| puck)
    }

    fn hand_with(f: impl Fn(u8, SimPuck) -> SimPuck) -> (SimulatedBus, Hand) {
        let sim = SimulatedBus::new();
        for id in 11..=14 {
            sim.add_puck(f(id, SimPuck::hand(id)));
        }
        let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(sim.adapter()));
        let pucks: Vec<Puck> = (11..=14)
            .map(|id| Puck::new(bus.clone(), id, Duration::from_millis(20)).unwrap())
            .collect();
        let refs: Vec<&Puck> = pucks.iter().collect();
        let generation = Arc::new(AtomicU64::new(0));
        let hand = Hand::new(&refs, GenerationToken::new(&generation)).unwrap();
        (sim, hand)
    }

    #[test]
    fn test_open_close_broadcast_cmd() {
        let (sim, hand) = hand();
        hand.open().unwrap();
        for id in 11..=14 {
            assert_eq!(sim.property(id, Property::Cmd), Some(CMD_OPEN));
        }
        hand.close().unwrap();
        assert_eq!(sim.property(12, Property::Cmd), Some(CMD_CLOSE));
    }

    #[test]
    fn test_done_moving() {
        let (sim, hand) = hand();
        assert!(hand.done_moving().unwrap());

        sim.set_property(13, Property::Mode, 5);
        assert!(!hand.done_moving().unwrap());

        // PID 且未打开 HOLD：仍在运动
        sim.set_property(13, Property::Mode, MODE_PID);
        assert!(!hand.done_moving().unwrap());

        sim.set_property(13, Property::Mode, MODE_IDLE);
        hand.wait_until_done_moving(Duration::from_millis(1), Duration::from_millis(50))
            .unwrap();
    }

    #[test]
    fn test_pid_with_hold_counts_as_stopped() {
        let (sim, hand) = hand_with(|id, puck| {
            if id == 12 {
                puck.with_property(Property::Hold, 1)
            } else {
                puck
            }
        });
        sim.set_property(12, Property::Mode, MODE_PID);
        assert!(hand.done_moving().unwrap());

        sim.set_property(11, Property::Mode, MODE_PID);
        assert!(!hand.done_moving().unwrap());
    }

    #[test]
    fn test_stale_generation() {
        let sim = SimulatedBus::new();
        for id in 11..=14 {
            sim.add_puck(SimPuck::hand(id));
        }
        let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(sim.adapter()));
        let pucks: Vec<Puck> = (11..=14)
            .map(|id| Puck::new(bus.clone(), id, Duration::from_millis(20)).unwrap())
            .collect();
        let refs: Vec<&Puck> = pucks.iter().collect();
        let generation = Arc::new(AtomicU64::new(3));
        let hand = Hand::new(&refs, GenerationToken::new(&generation)).unwrap();

        generation.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        assert!(matches!(hand.open(), Err(ClientError::Stale { handle: 3, current: 4 })));
        assert_eq!(sim.property(11, Property::Cmd), None);
    }

    #[test]
    fn test_positions() {
        let (sim, hand) = hand();
        sim.set_property(14, Property::P, 1024);
        let q = hand.positions().unwrap();
        assert!((q[3] - TAU / 4.0).abs() < 1e-9);

        sim.set_silent(11, true);
        assert!(hand.positions().is_err());
    }
}
