//! Config command.

use anyhow::Result;
use pollbus_core::BusConfig;

pub fn execute(config: &BusConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
