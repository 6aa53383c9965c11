//! Server Configuration
//!
//! This module locates and loads the configuration file.

use qan_analytics::config::Config;
use std::path::Path;

/// Default configuration file in the working directory
const DEFAULT_CONFIG_FILE: &str = "qan.toml";

/// Load configuration from file or environment
///
/// Priority:
/// 1. Explicit path (CLI `--config`)
/// 2. `QAN_CONFIG` environment variable
/// 3. `qan.toml` in the working directory
/// 4. Default configuration
///
/// Environment overrides are applied in every case. An explicitly named
/// file that cannot be loaded is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, String> {
    let explicit = path
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("QAN_CONFIG").ok());

    if let Some(path) = explicit {
        let config = Config::from_file_with_env(&path)?;
        eprintln!("[config] Loaded configuration from: {}", path);
        return Ok(config);
    }

    if Path::new(DEFAULT_CONFIG_FILE).exists() {
        match Config::from_file_with_env(DEFAULT_CONFIG_FILE) {
            Ok(config) => {
                eprintln!("[config] Loaded configuration from {}", DEFAULT_CONFIG_FILE);
                return Ok(config);
            },
            Err(e) => {
                eprintln!("[config] {}. Using defaults.", e);
            },
        }
    }

    eprintln!("[config] Using default configuration");
    Ok(Config::from_env())
}
