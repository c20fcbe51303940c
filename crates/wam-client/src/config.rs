//! # 产品管理器配置
//!
//! TOML 格式，所有段和字段都有默认值：
//!
//! ```toml
//! [bus]
//! interface = "can0"
//!
//! [execution]
//! period_us = 2000
//! rt_priority = 50
//!
//! [enumeration]
//! reply_timeout_ms = 20
//!
//! [wam]
//! max_consecutive_misses = 50
//! hold_kp = [900.0, 2500.0, 600.0, 500.0, 50.0, 50.0, 8.0]
//! hold_kd = [10.0, 20.0, 5.0, 2.0, 0.5, 0.5, 0.05]
//!
//! [safety]
//! activate_poll_ms = 50
//! mode_poll_ms = 100
//! ```
//!
//! 未知字段视为错误，不会被静默忽略。

use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wam_systems::ExecutionConfig;

/// 产品管理器配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub bus: BusConfig,
    pub execution: ExecutionSection,
    pub enumeration: EnumerationConfig,
    pub wam: WamConfig,
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// SocketCAN 接口名
    pub interface: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSection {
    /// 控制周期（微秒）
    pub period_us: u64,
    /// 实时线程优先级（0-99）
    pub rt_priority: Option<u8>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            period_us: 2000,
            rt_priority: Some(50),
        }
    }
}

impl ExecutionSection {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }

    pub fn to_execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            period: self.period(),
            rt_priority: self.rt_priority,
            ..ExecutionConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnumerationConfig {
    /// 单个节点的应答超时（毫秒）
    pub reply_timeout_ms: u64,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 20,
        }
    }
}

impl EnumerationConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WamConfig {
    /// 连续多少次未收齐位置应答后判定链路故障
    pub max_consecutive_misses: u32,
    /// 位置保持 PD 的比例增益（Nm/rad），按关节顺序
    pub hold_kp: Vec<f64>,
    /// 位置保持 PD 的微分增益（Nm·s/rad）
    pub hold_kd: Vec<f64>,
}

impl Default for WamConfig {
    fn default() -> Self {
        Self {
            max_consecutive_misses: wam_driver::DEFAULT_MAX_CONSECUTIVE_MISSES,
            hold_kp: vec![900.0, 2500.0, 600.0, 500.0, 50.0, 50.0, 8.0],
            hold_kd: vec![10.0, 20.0, 5.0, 2.0, 0.5, 0.5, 0.05],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// 等待 ACTIVE 时的轮询周期（毫秒）
    pub activate_poll_ms: u64,
    /// 其他等待模式的轮询周期（毫秒）
    pub mode_poll_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            activate_poll_ms: 50,
            mode_poll_ms: 100,
        }
    }
}

impl SafetyConfig {
    pub fn activate_poll(&self) -> Duration {
        Duration::from_millis(self.activate_poll_ms)
    }

    pub fn mode_poll(&self) -> Duration {
        Duration::from_millis(self.mode_poll_ms)
    }
}

impl ManagerConfig {
    /// 从 TOML 字符串解析并校验
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 语义校验
    pub fn validate(&self) -> Result<()> {
        if self.execution.period_us == 0 {
            return Err(ClientError::InvalidConfig(
                "execution.period_us must be positive".into(),
            ));
        }
        if let Some(p) = self.execution.rt_priority
            && p > 99
        {
            return Err(ClientError::InvalidConfig(format!(
                "execution.rt_priority {} is out of range 0-99",
                p
            )));
        }
        if self.enumeration.reply_timeout_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "enumeration.reply_timeout_ms must be positive".into(),
            ));
        }
        if self.safety.activate_poll_ms == 0 || self.safety.mode_poll_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "safety poll periods must be positive".into(),
            ));
        }
        let gains = self.wam.hold_kp.iter().chain(&self.wam.hold_kd);
        if gains.clone().any(|g| !g.is_finite() || *g < 0.0) {
            return Err(ClientError::InvalidConfig(
                "wam hold gains must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    /// 取前 `dof` 个保持增益；条目不足时报错
    pub(crate) fn hold_gains(&self, dof: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        if self.wam.hold_kp.len() < dof || self.wam.hold_kd.len() < dof {
            return Err(ClientError::InvalidConfig(format!(
                "wam.hold_kp/hold_kd need at least {} entries",
                dof
            )));
        }
        Ok((
            self.wam.hold_kp[..dof].to_vec(),
            self.wam.hold_kd[..dof].to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = ManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.execution.period(), Duration::from_millis(2));
        assert_eq!(config.enumeration.reply_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_sections() {
        let config = ManagerConfig::from_toml_str(
            r#"
            [bus]
            interface = "can1"

            [execution]
            period_us = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.interface, "can1");
        assert_eq!(config.execution.period_us, 1000);
        assert_eq!(config.execution.rt_priority, Some(50));
        assert_eq!(config.wam.max_consecutive_misses, 50);

        let exec = config.execution.to_execution_config();
        assert_eq!(exec.period, Duration::from_millis(1));
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let err = ManagerConfig::from_toml_str("[execution]\nperiod = 5\n").unwrap_err();
        assert!(matches!(err, ClientError::ConfigParse(_)));
    }

    #[test]
    fn test_semantic_validation() {
        let err = ManagerConfig::from_toml_str("[execution]\nperiod_us = 0\n").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));

        let err = ManagerConfig::from_toml_str("[execution]\nrt_priority = 120\n").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));

        let err = ManagerConfig::from_toml_str("[wam]\nhold_kp = [1.0, -2.0]\n").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_hold_gains_length() {
        let mut config = ManagerConfig::default();
        let (kp, kd) = config.hold_gains(4).unwrap();
        assert_eq!(kp, vec![900.0, 2500.0, 600.0, 500.0]);
        assert_eq!(kd.len(), 4);

        config.wam.hold_kp.truncate(3);
        assert!(config.hold_gains(4).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ManagerConfig::load("/nonexistent/wam.toml").unwrap_err();
        assert!(matches!(err, ClientError::ConfigIo(_)));
    }
}
