//! Configuration validation command (`appforge check-config`).

use anyhow::{Context, Result};
use appforge::config::AppConfig;

pub fn cmd_check_config() -> Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;

    println!();
    println!("appforge configuration");
    println!("======================");
    println!();
    let summary = config.summary();
    let width = summary.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in summary {
        println!("  {:width$}  {}", key, value, width = width);
    }
    println!();
    println!("Configuration is valid.");
    Ok(())
}
