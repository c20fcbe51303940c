//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use wam_sdk::prelude::*;
//! ```

// 客户端层（推荐使用）
pub use wam_client::{
    ForceTorqueSensor, Hand, JointVector, ManagerConfig, ProductManager, SafetyMode,
    SafetyModule, Wam,
};

// 信号流
pub use wam_systems::{
    Callback, Constant, ExecutionConfig, ExecutionManager, ExposedOutput, Gain, Input, Output,
    Probe, Sign, Summer, System, SystemError, TickInfo,
};

// 总线与节点
pub use wam_bus::{BusManager, CommunicationsBus};
pub use wam_driver::{Puck, PuckGroup};
pub use wam_protocol::{Property, PuckType};

// 错误类型
pub use wam_bus::BusError;
pub use wam_client::ClientError;
pub use wam_driver::DriverError;
pub use wam_protocol::ProtocolError;
pub use wam_systems::GraphError;
