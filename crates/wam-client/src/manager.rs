//! 产品管理器
//!
//! 扫描总线（ID 1..=31），维护 `Puck` 注册表，识别产品并按需构建控制对象。
//!
//! # 所有权
//!
//! 注册表独占所有 `Puck`；产品（WAM、手爪、F/T、安全模块）只保存节点 ID
//! 和解析好的属性 ID，以 `Arc` 形式交给调用者。急停清理会递增代数，
//! 旧产品句柄随即失效（[`ClientError::Stale`]）。
//!
//! 枚举和急停清理都需要 `&mut self`，由借用规则保证与产品构建互斥。

use crate::force_torque::{FORCE_TORQUE_SENSOR_ID, ForceTorqueSensor};
use crate::generation::{EstopLatch, GenerationToken};
use crate::hand::{FIRST_HAND_ID, HAND_DOF, Hand};
use crate::safety::{SafetyMode, SafetyModule};
use crate::wam::Wam;
use crate::{ClientError, ManagerConfig, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use wam_bus::CommunicationsBus;
use wam_driver::{DriverError, Puck, try_get_property_raw};
use wam_protocol::{MAX_ID, MIN_ID, Property, PuckType, require_property_id};

/// 安全模块节点 ID
pub const SAFETY_MODULE_ID: u8 = 10;
/// 第一个 WAM 关节节点 ID
pub const FIRST_WAM_ID: u8 = 1;
/// WAM 最大自由度
pub const MAX_WAM_DOF: usize = 7;

/// 腕部 / 万向节的电机极数
const WRIST_POLES: i32 = 6;
const GIMBALS_POLES: i32 = 8;

/// 产品管理器
pub struct ProductManager {
    bus: Arc<dyn CommunicationsBus>,
    config: ManagerConfig,
    pucks: BTreeMap<u8, Puck>,

    generation: Arc<AtomicU64>,
    estop: Arc<EstopLatch>,

    // 急停后保留
    safety: Option<Arc<SafetyModule>>,

    // 急停后销毁
    em: Option<Arc<wam_systems::ExecutionManager>>,
    wam3: Option<Arc<Wam<3>>>,
    wam4: Option<Arc<Wam<4>>>,
    wam7: Option<Arc<Wam<7>>>,
    hand: Option<Arc<Hand>>,
    fts: Option<Arc<ForceTorqueSensor>>,
}

impl std::fmt::Debug for ProductManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductManager")
            .field("pucks", &self.pucks.keys().collect::<Vec<_>>())
            .field("generation", &self.generation())
            .field("estop_observed", &self.estop.is_set())
            .finish()
    }
}

impl ProductManager {
    /// 校验配置并执行首次枚举
    pub fn new(bus: Arc<dyn CommunicationsBus>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let mut pm = Self {
            bus,
            config,
            pucks: BTreeMap::new(),
            generation: Arc::new(AtomicU64::new(0)),
            estop: Arc::new(EstopLatch::new()),
            safety: None,
            em: None,
            wam3: None,
            wam4: None,
            wam7: None,
            hand: None,
            fts: None,
        };
        pm.enumerate()?;
        Ok(pm)
    }

    pub fn bus(&self) -> &Arc<dyn CommunicationsBus> {
        &self.bus
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// 当前枚举代数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn estop_latch(&self) -> &Arc<EstopLatch> {
        &self.estop
    }

    pub fn puck(&self, id: u8) -> Option<&Puck> {
        self.pucks.get(&id)
    }

    /// 所有已知节点（按 ID 升序）
    pub fn pucks(&self) -> impl Iterator<Item = &Puck> + '_ {
        self.pucks.values()
    }

    // ==================== 枚举 ====================

    /// 扫描总线
    ///
    /// 对 ID 1..=31 探测 STAT：有应答的新节点被创建，已有节点刷新 ROLE/STAT，
    /// 不再应答的节点被移除。
    ///
    /// 没有应答视为节点不存在；探测到节点后身份读取超时或应答格式错误，
    /// 也只把该 ID 当作不存在并继续扫描。只有总线本身的错误会中止枚举。
    pub fn enumerate(&mut self) -> Result<()> {
        let stat = require_property_id(Property::Stat, PuckType::Monitor, 0)?;
        let timeout = self.config.enumeration.reply_timeout();

        info!("Enumerating bus");
        let mut last_id: Option<u8> = None;
        for id in MIN_ID..=MAX_ID {
            match self.probe(id, stat, timeout) {
                Ok(true) => {},
                Ok(false) => {
                    self.forget(id);
                    continue;
                },
                Err(e) if e.is_timeout() || matches!(e, DriverError::Protocol(_)) => {
                    warn!("Puck {} did not answer enumeration, treating as absent: {}", id, e);
                    self.forget(id);
                    continue;
                },
                Err(e) => return Err(e.into()),
            }

            if let Some(last) = last_id
                && last + 1 != id
            {
                info!("    --");
            }
            if let Some(p) = self.pucks.get(&id) {
                info!(
                    "    ID={:2} VERS={:3} ROLE=0x{:04x} TYPE={:?}{}",
                    p.id(),
                    p.vers(),
                    u16::from(p.role()),
                    p.puck_type(),
                    if p.effective_type() == PuckType::Monitor {
                        " (Monitor)"
                    } else {
                        ""
                    }
                );
            }
            last_id = Some(id);
        }

        self.log_products();
        Ok(())
    }

    /// 探测一个 ID 并创建或刷新对应的 `Puck`；`Ok(false)` 表示 STAT 无应答
    fn probe(
        &mut self,
        id: u8,
        stat: u8,
        timeout: Duration,
    ) -> std::result::Result<bool, DriverError> {
        if try_get_property_raw(&*self.bus, id, stat, timeout)?.is_none() {
            return Ok(false);
        }
        match self.pucks.get_mut(&id) {
            Some(puck) => {
                puck.update_role()?;
                puck.update_status()?;
            },
            None => {
                let puck = Puck::new(self.bus.clone(), id, timeout)?;
                self.pucks.insert(id, puck);
            },
        }
        Ok(true)
    }

    fn forget(&mut self, id: u8) {
        if self.pucks.remove(&id).is_some() {
            self.retire(id);
            info!("Puck {} is gone", id);
        }
    }

    /// 节点消失时丢弃缓存中包含它的产品
    ///
    /// WAM 不在这里丢弃：它的系统仍注册在执行管理器中，由急停清理统一销毁。
    fn retire(&mut self, id: u8) {
        if id == SAFETY_MODULE_ID && self.safety.take().is_some() {
            warn!("Safety module disappeared from the bus");
        }
        if id == FORCE_TORQUE_SENSOR_ID && self.fts.take().is_some() {
            warn!("Force-torque sensor disappeared from the bus");
        }
        if hand_ids().any(|h| h == id) && self.hand.take().is_some() {
            warn!("BarrettHand puck {} disappeared from the bus", id);
        }
    }

    fn log_products(&mut self) {
        info!("  Products:");
        let mut none = true;
        let wam_found = self.found_wam();

        if self.found_wam3() {
            none = false;
            info!("    3-DOF WAM");
        }
        if self.found_wam4() {
            none = false;
            info!("    4-DOF WAM");
        }
        if self.found_wam7() {
            none = false;
            let suffix = match (self.found_wam7_wrist(), self.found_wam7_gimbals()) {
                (Ok(true), _) => " (Wrist)",
                (_, Ok(true)) => " (Gimbals)",
                _ => "",
            };
            info!("    7-DOF WAM{}", suffix);
        }
        if wam_found {
            if self.found_safety_module() {
                info!("    Safety Module");
            } else {
                warn!("    *** NO SAFETY MODULE ***");
            }
        }
        if self.found_force_torque_sensor() {
            none = false;
            info!("    Force-Torque Sensor");
        }
        if self.found_hand() {
            none = false;
            info!("    BarrettHand");
        }
        if none {
            info!("    (none)");
        }
    }

    // ==================== 产品识别 ====================

    /// WAM 关节 1..=dof 全部存在，dof+1..=7 全部不存在
    fn verify_wam_pucks(&self, dof: usize) -> bool {
        if dof > MAX_WAM_DOF {
            return false;
        }
        (0..MAX_WAM_DOF).all(|i| {
            let id = FIRST_WAM_ID + i as u8;
            (i < dof) == self.pucks.contains_key(&id)
        })
    }

    pub fn found_wam3(&self) -> bool {
        self.verify_wam_pucks(3)
    }

    pub fn found_wam4(&self) -> bool {
        self.verify_wam_pucks(4)
    }

    pub fn found_wam7(&self) -> bool {
        self.verify_wam_pucks(7)
    }

    pub fn found_wam(&self) -> bool {
        self.found_wam3() || self.found_wam4() || self.found_wam7()
    }

    /// 唤醒 7 号关节并比较其电机极数
    fn wam7_has_poles(&mut self, poles: i32) -> Result<bool> {
        if !self.found_wam7() {
            return Ok(false);
        }
        let Some(p7) = self.pucks.get_mut(&7) else {
            return Ok(false);
        };
        p7.wake()?;
        Ok(p7.get_property(Property::Poles)? == poles)
    }

    pub fn found_wam7_wrist(&mut self) -> Result<bool> {
        self.wam7_has_poles(WRIST_POLES)
    }

    pub fn found_wam7_gimbals(&mut self) -> Result<bool> {
        self.wam7_has_poles(GIMBALS_POLES)
    }

    pub fn found_safety_module(&self) -> bool {
        self.pucks.contains_key(&SAFETY_MODULE_ID)
    }

    pub fn found_force_torque_sensor(&self) -> bool {
        self.pucks.contains_key(&FORCE_TORQUE_SENSOR_ID)
    }

    pub fn found_hand(&self) -> bool {
        hand_ids().all(|id| self.pucks.contains_key(&id))
    }

    /// 6、7 号节点存在且不是 WAM7 腕部
    pub fn found_gimbals_hand_controller(&mut self) -> Result<bool> {
        if !(self.pucks.contains_key(&6) && self.pucks.contains_key(&7)) {
            return Ok(false);
        }
        Ok(!self.found_wam7_wrist()?)
    }

    /// 默认 WAM 配置名
    pub fn wam_default_config_name(&mut self) -> Result<&'static str> {
        if self.found_wam3() {
            Ok("wam3")
        } else if self.found_wam4() {
            Ok("wam4")
        } else if self.found_wam7_wrist()? {
            Ok("wam7w")
        } else if self.found_wam7_gimbals()? {
            Ok("wam7g")
        } else {
            Err(ClientError::NotFound("WAM"))
        }
    }

    // ==================== 产品 ====================

    /// 安全模块（惰性构建，急停清理后保留）
    pub fn get_safety_module(&mut self) -> Result<Arc<SafetyModule>> {
        if let Some(sm) = &self.safety {
            return Ok(sm.clone());
        }
        let puck = self
            .pucks
            .get_mut(&SAFETY_MODULE_ID)
            .ok_or(ClientError::NotFound("Safety module"))?;
        puck.wake()?;
        let sm = Arc::new(SafetyModule::new(puck, self.estop.clone())?);
        self.safety = Some(sm.clone());
        Ok(sm)
    }

    /// 执行管理器（惰性创建，不启动）
    pub fn get_execution_manager(&mut self) -> Arc<wam_systems::ExecutionManager> {
        self.em
            .get_or_insert_with(|| {
                debug!("Creating execution manager");
                Arc::new(wam_systems::ExecutionManager::new(
                    self.config.execution.to_execution_config(),
                ))
            })
            .clone()
    }

    /// 启动执行线程（已在运行时不做任何事）
    pub fn start_execution_manager(&mut self) -> Result<()> {
        let em = self.get_execution_manager();
        if !em.is_running() {
            em.start()?;
        }
        Ok(())
    }

    fn wake_range(&mut self, ids: impl Iterator<Item = u8>) -> Result<()> {
        for id in ids {
            if let Some(puck) = self.pucks.get_mut(&id) {
                puck.wake()?;
            }
        }
        Ok(())
    }

    fn build_wam<const DOF: usize>(&mut self) -> Result<Wam<DOF>> {
        let ids = FIRST_WAM_ID..FIRST_WAM_ID + DOF as u8;
        self.wake_range(ids.clone())?;

        let safety = if self.found_safety_module() {
            Some(self.get_safety_module()?)
        } else {
            warn!("Building WAM{} without a safety module", DOF);
            None
        };
        let em = self.get_execution_manager();

        let pucks: Vec<&Puck> = ids.filter_map(|id| self.pucks.get(&id)).collect();
        Wam::new(
            em,
            &pucks,
            safety,
            self.estop.clone(),
            GenerationToken::new(&self.generation),
            &self.config,
        )
    }

    /// 等待 Shift-Activate（实时轮询，容忍执行线程造成的应答超时）
    fn wait_for_shift_activate(&mut self) -> Result<()> {
        let sm = self.get_safety_module()?;
        info!("Waiting for Shift-Activate");
        sm.wait_for_mode(
            SafetyMode::Active,
            true,
            self.config.safety.activate_poll(),
            None,
        )?;
        Ok(())
    }

    pub fn get_wam3(&mut self, wait_for_shift_activate: bool) -> Result<Arc<Wam<3>>> {
        if !self.found_wam3() {
            return Err(ClientError::NotFound("WAM3"));
        }
        let wam = match &self.wam3 {
            Some(wam) => wam.clone(),
            None => {
                let wam = Arc::new(self.build_wam::<3>()?);
                self.wam3 = Some(wam.clone());
                self.start_execution_manager()?;
                wam
            },
        };
        if wait_for_shift_activate {
            self.wait_for_shift_activate()?;
        }
        Ok(wam)
    }

    pub fn get_wam4(&mut self, wait_for_shift_activate: bool) -> Result<Arc<Wam<4>>> {
        if !self.found_wam4() {
            return Err(ClientError::NotFound("WAM4"));
        }
        let wam = match &self.wam4 {
            Some(wam) => wam.clone(),
            None => {
                let wam = Arc::new(self.build_wam::<4>()?);
                self.wam4 = Some(wam.clone());
                self.start_execution_manager()?;
                wam
            },
        };
        if wait_for_shift_activate {
            self.wait_for_shift_activate()?;
        }
        Ok(wam)
    }

    pub fn get_wam7(&mut self, wait_for_shift_activate: bool) -> Result<Arc<Wam<7>>> {
        if !self.found_wam7() {
            return Err(ClientError::NotFound("WAM7"));
        }
        let wam = match &self.wam7 {
            Some(wam) => wam.clone(),
            None => {
                let wam = Arc::new(self.build_wam::<7>()?);
                self.wam7 = Some(wam.clone());
                self.start_execution_manager()?;
                wam
            },
        };
        if wait_for_shift_activate {
            self.wait_for_shift_activate()?;
        }
        Ok(wam)
    }

    /// 等待 WAM 就绪（安全模块 IDLE）
    ///
    /// 没找到 WAM 时重新枚举一次。返回 WAM 是否已归零；未归零只告警。
    pub fn wait_for_wam(&mut self) -> Result<bool> {
        let sm = self.get_safety_module()?;
        sm.wait_for_mode(SafetyMode::Idle, false, self.config.safety.mode_poll(), None)?;

        if !self.found_wam() {
            self.enumerate()?;
            if !self.found_wam() {
                return Err(ClientError::NotFound("WAM"));
            }
        }

        let zeroed = sm.is_wam_zeroed()?;
        if !zeroed {
            warn!("The WAM needs to be zeroed: move it to its home position");
        }
        Ok(zeroed)
    }

    pub fn get_hand(&mut self) -> Result<Arc<Hand>> {
        if !self.found_hand() {
            return Err(ClientError::NotFound("BarrettHand"));
        }
        if let Some(hand) = &self.hand {
            return Ok(hand.clone());
        }
        self.wake_range(hand_ids())?;
        let pucks: Vec<&Puck> = hand_ids().filter_map(|id| self.pucks.get(&id)).collect();
        let hand = Arc::new(Hand::new(&pucks, GenerationToken::new(&self.generation))?);
        self.hand = Some(hand.clone());
        Ok(hand)
    }

    pub fn get_force_torque_sensor(&mut self) -> Result<Arc<ForceTorqueSensor>> {
        if !self.found_force_torque_sensor() {
            return Err(ClientError::NotFound("Force-torque sensor"));
        }
        if let Some(fts) = &self.fts {
            return Ok(fts.clone());
        }
        let puck = self
            .pucks
            .get_mut(&FORCE_TORQUE_SENSOR_ID)
            .ok_or(ClientError::NotFound("Force-torque sensor"))?;
        puck.wake()?;
        let fts = Arc::new(ForceTorqueSensor::new(
            puck,
            GenerationToken::new(&self.generation),
        )?);
        self.fts = Some(fts.clone());
        Ok(fts)
    }

    // ==================== 急停 ====================

    fn destroy_estop_products(&mut self) {
        // 旧执行管理器永久关闭：仍持有它的旧句柄无法再驱动总线
        if let Some(em) = self.em.take() {
            em.shut_down();
        }
        self.wam3 = None;
        self.wam4 = None;
        self.wam7 = None;
        self.hand = None;
        self.fts = None;
    }

    /// 急停清理
    ///
    /// 递增代数（旧句柄立即失效），关闭并丢弃执行管理器和所有急停产品，
    /// 复位急停锁存，然后重新枚举。安全模块保留。
    pub fn clean_up_after_estop(&mut self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Cleaning up after E-stop (generation {})", generation);
        self.destroy_estop_products();
        self.estop.clear();
        self.enumerate()
    }
}

impl Drop for ProductManager {
    fn drop(&mut self) {
        self.destroy_estop_products();
    }
}

fn hand_ids() -> impl Iterator<Item = u8> + Clone {
    FIRST_HAND_ID..FIRST_HAND_ID + HAND_DOF as u8
}
