// Persisted router tunables for nrctl
//
// Stored as JSON in the platform config directory:
// - Linux: ~/.config/netrouter/config.json
// - macOS: ~/Library/Application Support/netrouter/config.json
// - Windows: %APPDATA%\netrouter\config.json
//
// NETROUTER_<KEY> environment variables override what is on disk.

use anyhow::{Context, Result};
use netrouter_core::config::{CONFIG_KEYS, ENV_PREFIX};
use netrouter_core::RouterConfig;
use std::path::{Path, PathBuf};

pub struct ConfigFile {
    path: PathBuf,
    pub config: RouterConfig,
}

impl ConfigFile {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("netrouter");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from `path`, or defaults if there is no file yet
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            RouterConfig::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.config).context("Failed to serialize config")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Set a tunable and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.config.clone();
        updated.set(key, value)?;
        updated.validate()?;
        self.config = updated;
        self.save()
    }

    /// The stored config with environment overrides applied
    pub fn effective(&self) -> Result<RouterConfig> {
        let mut config = self.config.clone();
        for key in CONFIG_KEYS {
            let var = format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                config.set(key, &value).with_context(|| format!("Bad value in {}", var))?;
            }
        }
        Ok(config)
    }

    pub fn list(&self) -> Vec<(&'static str, String)> {
        CONFIG_KEYS
            .iter()
            .filter_map(|&key| self.config.get(key).map(|value| (key, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(file.config, RouterConfig::default());
        assert_eq!(file.list().len(), CONFIG_KEYS.len());
    }

    #[test]
    fn test_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut file = ConfigFile::load_from(&path).unwrap();
        file.set("live_router_check_interval", "30").unwrap();
        file.set("forwarding", "enabled").unwrap();

        let reloaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(reloaded.config.live_router_check_interval, 30);
        assert_eq!(reloaded.config.get("forwarding").as_deref(), Some("enabled"));
    }

    #[test]
    fn test_rejected_set_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut file = ConfigFile::load_from(&path).unwrap();
        assert!(file.set("no_such_key", "1").is_err());
        assert!(file.set("auto_down", "maybe").is_err());
        file.set("dead_router_check_interval", "0").unwrap();
        // would leave check-before-use without a dead interval
        assert!(file.set("check_routers_before_use", "1").is_err());
        assert!(!file.config.check_routers_before_use);
    }
}
