//! # WAM CLI
//!
//! WAM 总线检查与控制的命令行工具。
//!
//! ```bash
//! # 扫描总线
//! wam-cli enumerate
//!
//! # 读写单个节点的属性
//! wam-cli get --id 3 --property P
//! wam-cli set --id 3 --property MODE --value 0
//!
//! # 安全模块
//! wam-cli safety --velocity-limit 1.5
//! wam-cli wait-mode active --timeout 30
//!
//! # 保持当前位置直到 Ctrl-C
//! wam-cli hold
//! ```
//!
//! 配置文件按 `--config`、`WAM_CONFIG_FILE`、内置默认值的顺序确定。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use commands::{EnumerateCommand, GetCommand, HoldCommand, SafetyCommand, SetCommand, WaitModeCommand};

/// WAM CLI - WAM 机械臂命令行工具
#[derive(Parser, Debug)]
#[command(name = "wam-cli")]
#[command(about = "Command-line interface for WAM bus inspection and control", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件（TOML）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// CAN 接口（覆盖配置）
    #[arg(short, long, global = true)]
    interface: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描总线并列出节点和产品
    Enumerate(EnumerateCommand),

    /// 读取节点属性
    Get(GetCommand),

    /// 写入节点属性
    Set(SetCommand),

    /// 查询或修改安全模块
    Safety(SafetyCommand),

    /// 等待安全模块进入指定模式
    WaitMode(WaitModeCommand),

    /// 保持 WAM 当前位置直到 Ctrl-C
    Hold(HoldCommand),
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::resolve(cli.config, cli.interface)?;

    match cli.command {
        Commands::Enumerate(cmd) => cmd.execute(config),
        Commands::Get(cmd) => cmd.execute(config),
        Commands::Set(cmd) => cmd.execute(config),
        Commands::Safety(cmd) => cmd.execute(config),
        Commands::WaitMode(cmd) => cmd.execute(config),
        Commands::Hold(cmd) => cmd.execute(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "wam-cli", "get", "--id", "3", "--property", "P", "--interface", "can1",
        ])
        .unwrap();
        assert_eq!(cli.interface.as_deref(), Some("can1"));
        assert!(matches!(cli.command, Commands::Get(_)));
    }

    #[test]
    fn test_wait_mode_requires_mode() {
        assert!(Cli::try_parse_from(["wam-cli", "wait-mode"]).is_err());
        let cli = Cli::try_parse_from(["wam-cli", "wait-mode", "active"]).unwrap();
        assert!(matches!(cli.command, Commands::WaitMode(_)));
    }
}
