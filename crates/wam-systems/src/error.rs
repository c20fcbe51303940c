//! 图引擎错误类型

use crate::SystemId;
use thiserror::Error;

/// 拓扑错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// 输入和输出的值类型不一致
    #[error("type mismatch: input expects {input}, output produces {output}")]
    TypeMismatch {
        input: &'static str,
        output: &'static str,
    },

    /// 连接会形成环
    #[error("connecting {producer} -> {consumer} would create a cycle")]
    Cycle { producer: String, consumer: String },

    /// 端口不属于任何已注册的系统
    #[error("port does not belong to a system registered with this execution manager")]
    ForeignPort,

    #[error("unknown system {0:?}")]
    UnknownSystem(SystemId),

    #[error("input is not connected")]
    NotConnected,
}

/// 系统求值错误
#[derive(Error, Debug)]
pub enum SystemError {
    /// 必需的输入未定义
    #[error("input '{0}' is undefined")]
    MissingInput(&'static str),

    #[error(transparent)]
    Failed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl SystemError {
    pub fn failed(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SystemError::Failed(Box::new(err))
    }
}

/// 执行管理器错误
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("system '{name}' failed: {source}")]
    System {
        name: String,
        #[source]
        source: SystemError,
    },

    /// 实时线程运行期间不能手动 tick
    #[error("execution manager is already running")]
    AlreadyRunning,

    /// 执行管理器已关闭，不再求值
    #[error("execution manager has been shut down")]
    ShutDown,

    #[error("failed to spawn execution thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::TypeMismatch {
            input: "f64",
            output: "i32",
        };
        assert!(err.to_string().contains("f64") && err.to_string().contains("i32"));

        let err = ExecutionError::System {
            name: "hold".into(),
            source: SystemError::MissingInput("reference"),
        };
        assert_eq!(
            err.to_string(),
            "system 'hold' failed: input 'reference' is undefined"
        );
    }

    #[test]
    fn test_failed_wraps_any_error() {
        let io = std::io::Error::other("bus gone");
        let err = SystemError::failed(io);
        assert_eq!(err.to_string(), "bus gone");
    }
}
