//! 客户端错误类型

use crate::SafetyMode;
use std::time::Duration;
use thiserror::Error;
use wam_bus::BusError;
use wam_driver::DriverError;
use wam_protocol::ProtocolError;
use wam_systems::{ExecutionError, GraphError};

/// 客户端层错误
#[derive(Debug, Error)]
pub enum ClientError {
    // ==================== 底层 ====================
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    // ==================== 配置 ====================
    #[error("Failed to read config file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    // ==================== 产品 ====================
    /// 总线上没有找到所需的产品
    #[error("{0} was not found on the bus")]
    NotFound(&'static str),

    /// 产品属于上一代枚举（急停清理后）
    #[error("Product handle is stale (generation {handle}, current {current})")]
    Stale { handle: u64, current: u64 },

    /// 反馈链路故障已锁存
    #[error("Product is faulted: {0}")]
    Faulted(String),

    // ==================== 安全 ====================
    /// 已观测到急停
    #[error("Emergency stop observed")]
    EmergencyStop,

    /// 当前安全模式不允许运动
    #[error("Motion not allowed in safety mode {0:?}")]
    MotionNotAllowed(SafetyMode),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// 急停相关错误：调用者应执行 `clean_up_after_estop`
    pub fn is_estop(&self) -> bool {
        matches!(self, ClientError::EmergencyStop | ClientError::Stale { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_driver_error() {
        let err: ClientError = DriverError::ReplyLost { misses: 50 }.into();
        assert!(matches!(err, ClientError::Driver(_)));
        assert!(!err.is_estop());
        assert!(ClientError::EmergencyStop.is_estop());
    }

    #[test]
    fn test_display() {
        let err = ClientError::MotionNotAllowed(SafetyMode::Idle);
        assert_eq!(err.to_string(), "Motion not allowed in safety mode Idle");
        assert_eq!(
            ClientError::NotFound("WAM4").to_string(),
            "WAM4 was not found on the bus"
        );
    }
}
