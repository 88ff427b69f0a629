//! Configuration management for plugboard.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::plugin::PLUGIN_PATH_ENV;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery and session settings
    pub plugins: PluginsConfig,
}

/// `[plugins]` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// System plugin search directories
    pub search_dirs: Vec<PathBuf>,

    /// File holding the persisted registry state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Activate plugins that were never seen before
    pub activate_new_plugins: bool,
}

impl PluginsConfig {
    /// State file location, falling back to the config directory.
    pub fn state_file(&self) -> Option<PathBuf> {
        self.state_file.clone().or_else(|| Config::config_dir().map(|d| d.join("state.toml")))
    }

    /// Search directories listed in `PLUGBOARD_PLUGIN_PATH`.
    pub fn env_search_dirs() -> Vec<PathBuf> {
        std::env::var_os(PLUGIN_PATH_ENV)
            .map(|value| parse_path_list(&value))
            .unwrap_or_default()
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            search_dirs: Config::data_dir().map(|d| d.join("plugins")).into_iter().collect(),
            state_file: None,
            activate_new_plugins: true,
        }
    }
}

/// Split an OS path list, dropping empty entries.
pub fn parse_path_list(value: &std::ffi::OsStr) -> Vec<PathBuf> {
    std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect()
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.plugboard.toml` in current directory
    /// 2. `~/.config/plugboard/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".plugboard.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<()> {
        let config_dir =
            Self::config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join("config.toml"), content)?;

        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plugboard"))
    }

    /// Get the data directory path (plugins, caches).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("plugboard"))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.plugins.activate_new_plugins);
        assert!(config.plugins.state_file.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [plugins]
            search_dirs = ["/opt/plugboard/plugins"]
            state_file = "/tmp/state.toml"
            activate_new_plugins = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.search_dirs, vec![PathBuf::from("/opt/plugboard/plugins")]);
        assert_eq!(config.plugins.state_file(), Some(PathBuf::from("/tmp/state.toml")));
        assert!(!config.plugins.activate_new_plugins);
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[plugins]\nactivate_new_plugins = false\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert!(!config.plugins.activate_new_plugins);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[plugins]"));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_path_list() {
        let dirs = parse_path_list(std::ffi::OsStr::new("/a::/b"));
        assert_eq!(dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
