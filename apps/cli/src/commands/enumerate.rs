//! 枚举命令

use anyhow::Result;
use clap::Args;
use wam_sdk::ManagerConfig;
use wam_sdk::protocol::PuckType;

/// 枚举命令参数
#[derive(Args, Debug)]
pub struct EnumerateCommand {
    /// 同时报告 WAM 默认配置名（会唤醒 7 号关节）
    #[arg(long)]
    pub probe_wrist: bool,
}

impl EnumerateCommand {
    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let mut pm = super::open_manager(config)?;

        println!("📋 Pucks:");
        let mut any = false;
        for puck in pm.pucks() {
            any = true;
            let monitor = if puck.effective_type() == PuckType::Monitor {
                " (Monitor)"
            } else {
                ""
            };
            println!(
                "  ID={:2} VERS={:3} TYPE={:?}{}",
                puck.id(),
                puck.vers(),
                puck.puck_type(),
                monitor
            );
        }
        if !any {
            println!("  (none)");
        }

        println!("📦 Products:");
        for (found, name) in [
            (pm.found_wam3(), "3-DOF WAM"),
            (pm.found_wam4(), "4-DOF WAM"),
            (pm.found_wam7(), "7-DOF WAM"),
            (pm.found_safety_module(), "Safety Module"),
            (pm.found_force_torque_sensor(), "Force-Torque Sensor"),
            (pm.found_hand(), "BarrettHand"),
        ] {
            if found {
                println!("  {}", name);
            }
        }

        if self.probe_wrist && pm.found_wam() {
            println!("⚙️  Default WAM config: {}", pm.wam_default_config_name()?);
        }
        Ok(())
    }
}
