//! Initialize the configuration directory: create ~/.archdash and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `archdash init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing, so the terminal limits are discoverable.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_config_once() {
        let dir = std::env::temp_dir().join(format!("archdash-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        assert!(require_initialized(&path).is_err());

        let created = init_config_dir(&path).expect("init");
        assert_eq!(created, dir);
        require_initialized(&path).expect("initialized");
        let (config, _) = crate::config::load_config(Some(path.clone())).expect("load");
        assert_eq!(config.terminal.history_limit, 100);

        std::fs::write(&path, r#"{"gateway":{"port":1234}}"#).expect("write");
        init_config_dir(&path).expect("second init");
        let (config, _) = crate::config::load_config(Some(path)).expect("load");
        assert_eq!(config.gateway.port, 1234);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
