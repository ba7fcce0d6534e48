// Configuration file parser

//! Configuration file parsing and validation
//!
//! Every key is optional; a missing file section falls back to the defaults
//! in [`crate::types::GeneralConfig`].

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.socket_path.as_os_str().is_empty() {
        anyhow::bail!("socket_path cannot be empty");
    }

    // env_logger also accepts directive lists ("ipsec_monitor=debug"); only
    // the bare level is checked here
    let level = config.general.log_level.to_ascii_lowercase();
    if !level.contains('=') && !LOG_LEVELS.contains(&level.as_str()) {
        anyhow::bail!(
            "Invalid log_level '{}', expected one of {:?}",
            config.general.log_level,
            LOG_LEVELS
        );
    }

    if !config.general.state_file.is_absolute() {
        anyhow::bail!(
            "state_file must be an absolute path, got {:?}",
            config.general.state_file
        );
    }

    Ok(())
}
