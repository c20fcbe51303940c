//! 属性读写命令

use anyhow::{Context, Result};
use clap::Args;
use wam_sdk::ManagerConfig;
use wam_sdk::driver::Puck;
use wam_sdk::protocol::Property;

/// 解析属性名（大小写不敏感）
fn parse_property(name: &str) -> Result<Property, String> {
    Property::from_name(name).ok_or_else(|| format!("unknown property '{}'", name))
}

fn open_puck(config: &ManagerConfig, id: u8, wake: bool) -> Result<Puck> {
    let bus = super::open_bus(config)?;
    let mut puck = Puck::new(bus, id, config.enumeration.reply_timeout())
        .with_context(|| format!("Puck {} did not answer", id))?;
    if wake {
        puck.wake()?;
    }
    Ok(puck)
}

/// 读取属性参数
#[derive(Args, Debug)]
pub struct GetCommand {
    /// 节点 ID（1-31）
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=31))]
    pub id: u8,

    /// 属性名（如 P、MODE、CTS）
    #[arg(short, long, value_parser = parse_property)]
    pub property: Property,

    /// 先唤醒节点
    #[arg(short, long)]
    pub wake: bool,
}

impl GetCommand {
    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let puck = open_puck(&config, self.id, self.wake)?;
        let value = puck.get_property(self.property)?;
        println!("{} {} = {}", self.id, self.property.name(), value);
        Ok(())
    }
}

/// 写入属性参数
#[derive(Args, Debug)]
pub struct SetCommand {
    /// 节点 ID（1-31）
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=31))]
    pub id: u8,

    /// 属性名
    #[arg(short, long, value_parser = parse_property)]
    pub property: Property,

    /// 写入值
    #[arg(short, long, allow_negative_numbers = true)]
    pub value: i32,

    /// 先唤醒节点
    #[arg(short, long)]
    pub wake: bool,
}

impl SetCommand {
    pub fn execute(&self, config: ManagerConfig) -> Result<()> {
        let puck = open_puck(&config, self.id, self.wake)?;
        puck.set_property(self.property, self.value)?;
        println!("✅ {} {} <- {}", self.id, self.property.name(), self.value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("mode"), Ok(Property::Mode));
        assert_eq!(parse_property("P"), Ok(Property::P));
        assert!(parse_property("bogus").is_err());
    }
}
