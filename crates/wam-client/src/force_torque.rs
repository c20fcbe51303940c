//! 六维力/力矩传感器（简化）
//!
//! 只暴露原始读数、温度和去皮；标定矩阵和多帧读数解析不在这里。

use crate::Result;
use crate::generation::GenerationToken;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wam_bus::{CommunicationsBus, Wait};
use wam_driver::{Puck, get_property_raw, set_property_raw};
use wam_protocol::Property;

/// 力/力矩传感器节点 ID
pub const FORCE_TORQUE_SENSOR_ID: u8 = 8;

pub struct ForceTorqueSensor {
    bus: Arc<dyn CommunicationsBus>,
    id: u8,
    ft: u8,
    temp: u8,
    reply_timeout: Duration,
    generation: GenerationToken,
}

impl std::fmt::Debug for ForceTorqueSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceTorqueSensor")
            .field("id", &self.id)
            .field("generation", &self.generation.value())
            .finish()
    }
}

impl ForceTorqueSensor {
    pub(crate) fn new(puck: &Puck, generation: GenerationToken) -> Result<Self> {
        Ok(Self {
            bus: puck.bus().clone(),
            id: puck.id(),
            ft: puck.require_property_id(Property::Ft)?,
            temp: puck.require_property_id(Property::Temp)?,
            reply_timeout: puck.reply_timeout(),
            generation,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn get(&self, prop_id: u8) -> Result<i32> {
        self.generation.check()?;
        Ok(get_property_raw(
            &*self.bus,
            self.id,
            prop_id,
            Wait::Timeout(self.reply_timeout),
        )?)
    }

    /// FT 属性的原始值
    pub fn raw_reading(&self) -> Result<i32> {
        self.get(self.ft)
    }

    /// 传感器温度（℃）
    pub fn temperature(&self) -> Result<i32> {
        self.get(self.temp)
    }

    /// 以当前读数为零点
    pub fn tare(&self) -> Result<()> {
        self.generation.check()?;
        debug!("Taring force/torque sensor {}", self.id);
        set_property_raw(&*self.bus, self.id, self.ft, 0)?;
        Ok(())
    }
}
