//! 驱动层错误类型定义

use std::time::Duration;
use thiserror::Error;
use wam_bus::BusError;
use wam_protocol::ProtocolError;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 总线错误
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// 协议错误（不支持的属性、应答格式错误）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 节点在超时时间内没有应答
    #[error("Puck {id} did not reply within {timeout:?}")]
    Timeout { id: u8, timeout: Duration },

    /// 非阻塞读取时应答尚未到达，可稍后轮询
    #[error("Reply not yet available")]
    NotReady,

    /// 连续多个控制周期没有收到应答
    #[error("Replies lost for {misses} consecutive reads")]
    ReplyLost { misses: u32 },

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DriverError {
    /// 是否为"没有应答"类错误
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. }
                | DriverError::NotReady
                | DriverError::Bus(BusError::Timeout | BusError::WouldBlock)
        )
    }

    /// 是否为"属性不支持"错误
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            DriverError::Protocol(ProtocolError::UnsupportedProperty { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wam_protocol::{Property, PuckType};

    #[test]
    fn test_timeout_and_unsupported_are_distinct() {
        let timeout = DriverError::Timeout {
            id: 3,
            timeout: Duration::from_millis(20),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_unsupported());

        let unsupported = DriverError::from(ProtocolError::UnsupportedProperty {
            property: Property::Hold,
            puck_type: PuckType::Motor,
            vers: 12,
        });
        assert!(unsupported.is_unsupported());
        assert!(!unsupported.is_timeout());
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Timeout {
            id: 7,
            timeout: Duration::from_millis(20),
        };
        assert_eq!(err.to_string(), "Puck 7 did not reply within 20ms");

        let err = DriverError::ReplyLost { misses: 50 };
        assert!(err.to_string().contains("50"));

        let err: DriverError = BusError::WouldBlock.into();
        assert!(err.is_timeout());
    }
}
