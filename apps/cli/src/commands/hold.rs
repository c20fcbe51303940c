//! 位置保持命令
//!
//! 等待 WAM 就绪和 Shift-Activate，保持当前位置，直到 Ctrl-C 或急停。

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use wam_sdk::client::Wam;
use wam_sdk::{ManagerConfig, ProductManager, SafetyMode};

/// 位置保持命令参数
#[derive(Args, Debug)]
pub struct HoldCommand {
    /// 状态打印间隔（毫秒）
    #[arg(long, default_value_t = 500)]
    pub report_ms: u64,
}

impl HoldCommand {
    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl-C handler")?;

        let mut pm = super::open_manager(config)?;
        pm.wait_for_wam()?;
        println!("⏳ Press Shift-Activate...");

        let report = Duration::from_millis(self.report_ms.max(1));
        if pm.found_wam3() {
            let wam = pm.get_wam3(true)?;
            hold(&mut pm, &*wam, &running, report)
        } else if pm.found_wam4() {
            let wam = pm.get_wam4(true)?;
            hold(&mut pm, &*wam, &running, report)
        } else {
            let wam = pm.get_wam7(true)?;
            hold(&mut pm, &*wam, &running, report)
        }
    }
}

fn hold<const DOF: usize>(
    pm: &mut ProductManager,
    wam: &Wam<DOF>,
    running: &AtomicBool,
    report: Duration,
) -> Result<()> {
    wam.hold_position()?;
    println!("🔒 Holding position, Ctrl-C to release");

    let sm = pm.get_safety_module()?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(report);

        if sm.mode()? == SafetyMode::Estop || wam.is_faulted() {
            println!("🛑 Motion stopped: {}", wam.fault().unwrap_or_else(|| "E-stop".into()));
            pm.clean_up_after_estop()?;
            return Ok(());
        }
        let q = wam.joint_positions()?;
        println!("  q = {:.4?}", q.as_slice());
    }

    wam.idle()?;
    println!("✅ Released");
    Ok(())
}
