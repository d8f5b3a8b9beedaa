//! CLI configuration utilities

use anyhow::{Context, Result};
use lectern_core::SessionConfig;
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the data directory
pub const CONFIG_FILE_NAME: &str = "lectern.toml";

/// Load the client configuration.
///
/// An explicit `--config` path wins; otherwise `lectern.toml` in the data
/// directory is used when present, and environment variables alone when
/// not. `--data-dir` overrides the configured storage directory.
pub fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<SessionConfig> {
    let default_file = data_dir
        .clone()
        .unwrap_or_else(|| SessionConfig::default().storage.resolve_dir())
        .join(CONFIG_FILE_NAME);

    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None if default_file.exists() => Some(default_file),
        None => None,
    };

    let mut config = SessionConfig::load(file.as_deref()).with_context(|| match &file {
        Some(file) => format!("Failed to load configuration from {}", file.display()),
        None => "Failed to load configuration from the environment".to_string(),
    })?;

    if let Some(dir) = data_dir {
        config.storage.dir = Some(dir);
    }
    Ok(config)
}
