//! 命令定义和实现

pub mod enumerate;
pub mod hold;
pub mod property;
pub mod safety;

pub use enumerate::EnumerateCommand;
pub use hold::HoldCommand;
pub use property::{GetCommand, SetCommand};
pub use safety::{SafetyCommand, WaitModeCommand};

use anyhow::Result;
use std::sync::Arc;
use wam_sdk::{CommunicationsBus, ManagerConfig, ProductManager};

/// 打开配置中的 SocketCAN 接口
#[cfg(target_os = "linux")]
pub fn open_bus(config: &ManagerConfig) -> Result<Arc<dyn CommunicationsBus>> {
    use wam_sdk::BusManager;
    use wam_sdk::bus::SocketCanAdapter;

    println!("🔌 Opening {}...", config.bus.interface);
    let adapter = SocketCanAdapter::new(config.bus.interface.as_str())?;
    Ok(Arc::new(BusManager::new(adapter)))
}

#[cfg(not(target_os = "linux"))]
pub fn open_bus(_config: &ManagerConfig) -> Result<Arc<dyn CommunicationsBus>> {
    anyhow::bail!("SocketCAN is only available on Linux")
}

/// 打开总线并枚举
pub fn open_manager(config: ManagerConfig) -> Result<ProductManager> {
    let bus = open_bus(&config)?;
    Ok(ProductManager::new(bus, config)?)
}
