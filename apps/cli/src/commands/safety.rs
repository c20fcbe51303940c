//! 安全模块命令

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use std::time::Duration;
use wam_sdk::{ManagerConfig, SafetyMode};

/// 命令行可请求的安全模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Estop,
    Idle,
    Active,
}

impl From<ModeArg> for SafetyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Estop => SafetyMode::Estop,
            ModeArg::Idle => SafetyMode::Idle,
            ModeArg::Active => SafetyMode::Active,
        }
    }
}

/// 安全模块命令参数
#[derive(Args, Debug)]
pub struct SafetyCommand {
    /// 请求切换模式
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// 设置速度故障阈值（m/s）
    #[arg(long)]
    pub velocity_limit: Option<f64>,

    /// 设置力矩故障阈值
    #[arg(long)]
    pub torque_limit: Option<f64>,
}

impl SafetyCommand {
    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let mut pm = super::open_manager(config)?;
        let sm = pm.get_safety_module()?;

        if let Some(mode) = self.mode {
            sm.set_mode(mode.into())?;
        }
        if let Some(limit) = self.velocity_limit {
            sm.set_velocity_limit(limit)?;
        }
        if let Some(limit) = self.torque_limit {
            sm.set_torque_limit(limit)?;
        }

        println!("🛡️  Safety module {}", sm.id());
        println!("  Mode:            {}", sm.mode()?);
        println!("  WAM zeroed:      {}", sm.is_wam_zeroed()?);
        println!("  Velocity limit:  {:.3}", sm.velocity_limit()?);
        println!("  Torque limit:    {:.3}", sm.torque_limit()?);
        Ok(())
    }
}

/// 等待模式命令参数
#[derive(Args, Debug)]
pub struct WaitModeCommand {
    /// 目标模式
    #[arg(value_enum)]
    pub mode: ModeArg,

    /// 超时（秒）；不指定时一直等待
    #[arg(short, long)]
    pub timeout: Option<f64>,
}

impl WaitModeCommand {
    pub fn timeout(&self) -> Result<Option<Duration>> {
        match self.timeout {
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                bail!("timeout must be a non-negative number of seconds")
            },
            Some(secs) => Ok(Some(Duration::from_secs_f64(secs))),
            None => Ok(None),
        }
    }

    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let timeout = self.timeout()?;
        let poll = config.safety.mode_poll();
        let mut pm = super::open_manager(config)?;
        let sm = pm.get_safety_module()?;

        let target = SafetyMode::from(self.mode);
        println!("⏳ Waiting for {}...", target);
        if sm.wait_for_mode(target, false, poll, timeout)? {
            println!("✅ Safety module is {}", target);
            Ok(())
        } else {
            bail!("safety module did not reach {} in time", target)
        }
    }
}
