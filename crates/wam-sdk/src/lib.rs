//! WAM SDK - WAM 机械臂 Rust SDK
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 帧、地址编码、属性表、打包力矩
//! - **总线层** (`bus`): CAN 硬件抽象、SocketCAN、带事务锁的总线管理器
//! - **驱动层** (`driver`): Puck / PuckGroup 事务、应答看门狗
//! - **系统层** (`systems`): 信号流图与实时执行管理器
//! - **客户端层** (`client`): 安全模块、WAM、手爪、产品管理器
//!
//! # 快速开始
//!
//! ```no_run
//! use wam_sdk::prelude::*;
//!
//! # fn main() -> wam_sdk::client::Result<()> {
//! wam_sdk::init_logger();
//! let mut pm = wam_sdk::connect(ManagerConfig::default())?;
//! pm.wait_for_wam()?;
//! let wam = pm.get_wam4(true)?;
//! wam.hold_position()?;
//! # Ok(())
//! # }
//! ```

pub use wam_bus as bus;
pub use wam_client as client;
pub use wam_driver as driver;
pub use wam_protocol as protocol;
pub use wam_systems as systems;

pub mod prelude;

pub use wam_bus::{BusError, BusManager, CommunicationsBus};
pub use wam_client::{ClientError, ManagerConfig, ProductManager, SafetyMode};
pub use wam_driver::DriverError;
pub use wam_protocol::ProtocolError;
pub use wam_systems::{ExecutionManager, GraphError};

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// 安装全局日志订阅器
///
/// 过滤规则取自 `RUST_LOG`，缺省为 `info`；`log` crate 的记录转发到 `tracing`。
/// 重复调用不做任何事。
pub fn init_logger() {
    if tracing_log::LogTracer::init().is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// 在配置指定的 SocketCAN 接口上创建产品管理器（含首次枚举）
#[cfg(target_os = "linux")]
pub fn connect(config: ManagerConfig) -> wam_client::Result<ProductManager> {
    let adapter = wam_bus::SocketCanAdapter::new(config.bus.interface.as_str())?;
    let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(adapter));
    ProductManager::new(bus, config)
}

/// 在任意适配器上创建产品管理器
pub fn connect_with<A>(adapter: A, config: ManagerConfig) -> wam_client::Result<ProductManager>
where
    A: wam_bus::CanAdapter + Send + 'static,
{
    let bus: Arc<dyn CommunicationsBus> = Arc::new(BusManager::new(adapter));
    ProductManager::new(bus, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_is_idempotent() {
        init_logger();
        init_logger();
        tracing::info!("logger installed");
    }
}
