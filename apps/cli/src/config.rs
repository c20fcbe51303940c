//! 配置解析：`--config` → `WAM_CONFIG_FILE` → 内置默认值

use anyhow::{Context, Result};
use std::path::PathBuf;
use wam_sdk::ManagerConfig;

/// 配置文件路径的环境变量
pub const CONFIG_ENV: &str = "WAM_CONFIG_FILE";

/// 配置来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Arg(PathBuf),
    Env(PathBuf),
    Default,
}

/// 确定配置来源；空的环境变量视为未设置
pub fn source(arg: Option<PathBuf>, env: Option<String>) -> ConfigSource {
    if let Some(path) = arg {
        return ConfigSource::Arg(path);
    }
    match env {
        Some(path) if !path.is_empty() => ConfigSource::Env(PathBuf::from(path)),
        _ => ConfigSource::Default,
    }
}

fn load(source: &ConfigSource) -> Result<ManagerConfig> {
    match source {
        ConfigSource::Arg(path) | ConfigSource::Env(path) => ManagerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        ConfigSource::Default => Ok(ManagerConfig::default()),
    }
}

/// 加载配置并应用命令行覆盖
pub fn resolve(arg: Option<PathBuf>, interface: Option<String>) -> Result<ManagerConfig> {
    let source = source(arg, std::env::var(CONFIG_ENV).ok());
    tracing::info!("Config source: {:?}", source);

    let mut config = load(&source)?;
    if let Some(interface) = interface {
        config.bus.interface = interface;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_source_precedence() {
        assert_eq!(
            source(Some("a.toml".into()), Some("b.toml".into())),
            ConfigSource::Arg("a.toml".into())
        );
        assert_eq!(
            source(None, Some("b.toml".into())),
            ConfigSource::Env("b.toml".into())
        );
        assert_eq!(source(None, Some(String::new())), ConfigSource::Default);
        assert_eq!(source(None, None), ConfigSource::Default);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\ninterface = \"vcan3\"").unwrap();

        let config = load(&ConfigSource::Arg(file.path().to_path_buf())).unwrap();
        assert_eq!(config.bus.interface, "vcan3");
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\nport = \"can0\"").unwrap();
        assert!(load(&ConfigSource::Env(file.path().to_path_buf())).is_err());
    }
}
