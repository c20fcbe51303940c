//! # WAM Client
//!
//! 产品层：安全模块、WAM 控制对象、手爪、力/力矩传感器和产品管理器。
//!
//! ```no_run
//! use std::sync::Arc;
//! use wam_bus::{BusManager, CommunicationsBus, SocketCanAdapter};
//! use wam_client::{ManagerConfig, ProductManager};
//!
//! # fn main() -> wam_client::Result<()> {
//! let config = ManagerConfig::default();
//! let adapter = SocketCanAdapter::new(&config.bus.interface)?;
//! let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(adapter));
//!
//! let mut pm = ProductManager::new(bus, config)?;
//! pm.wait_for_wam()?;
//! let wam = pm.get_wam4(true)?;
//! wam.hold_position()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod force_torque;
mod generation;
mod hand;
mod manager;
mod safety;
mod wam;

pub use config::{
    BusConfig, EnumerationConfig, ExecutionSection, ManagerConfig, SafetyConfig, WamConfig,
};
pub use error::{ClientError, Result};
pub use force_torque::{FORCE_TORQUE_SENSOR_ID, ForceTorqueSensor};
pub use generation::{EstopLatch, GenerationToken};
pub use hand::{FIRST_HAND_ID, HAND_DOF, Hand, HandVector};
pub use manager::{FIRST_WAM_ID, MAX_WAM_DOF, ProductManager, SAFETY_MODULE_ID};
pub use safety::{SafetyMode, SafetyModule};
pub use wam::{
    FaultLatch, JointPositionHold, JointPositionSource, JointTorqueSink, JointVector, Wam,
};
