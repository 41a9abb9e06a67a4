use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level host config, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding one workspace per session.
    pub machines_dir: PathBuf,
    /// Where the emulator binaries and their support files live.
    pub resources: ResourcesConfig,
    /// Remote display settings.
    pub display: DisplayConfig,
    /// Control channel settings.
    pub monitor: MonitorConfig,
}

/// Emulator support resources section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Directory containing `qemu-img` and `qemu-system-<arch>` executables.
    pub bin_dir: PathBuf,
    /// Directory prepended to the dynamic library search path of every child.
    pub lib_dir: PathBuf,
    /// Firmware/ROM directory handed to the emulator with `-L`.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Argument for the emulator's `-vnc` listener.
    pub vnc_listen: String,
    /// Upper bound on framebuffer update requests per second.
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long a control request may wait for its response.
    pub timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vmhost");
        Self {
            machines_dir: base.join("machines"),
            resources: ResourcesConfig {
                bin_dir: base.join("qemu").join("bin"),
                lib_dir: base.join("qemu").join("lib"),
                data_dir: base.join("qemu").join("share"),
            },
            display: DisplayConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        HostConfig::default().resources
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            vnc_listen: "127.0.0.1:0".to_string(),
            frame_rate: 60,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl MonitorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HostConfig {
    /// Load config from a TOML file path. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Default location of the host config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vmhost")
        .join("config.toml")
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write config {}: {}", .0.display(), .1)]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config.display.frame_rate, 60);
        assert_eq!(config.display.vnc_listen, "127.0.0.1:0");
        assert_eq!(config.monitor.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
            machines_dir = "/srv/vms"

            [resources]
            bin_dir = "/opt/qemu/bin"

            [display]
            frame_rate = 30
        "#;
        let config: HostConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.machines_dir, PathBuf::from("/srv/vms"));
        assert_eq!(config.resources.bin_dir, PathBuf::from("/opt/qemu/bin"));
        // Unspecified fields within a section still get defaults.
        assert!(config.resources.lib_dir.ends_with("lib"));
        assert_eq!(config.display.frame_rate, 30);
        assert_eq!(config.display.vnc_listen, "127.0.0.1:0");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.monitor.timeout_secs, 15);
    }

    #[test]
    fn load_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "machines_dir = [").unwrap();
        let err = HostConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = HostConfig::default();
        config.machines_dir = dir.path().join("machines");
        config.display.frame_rate = 24;
        config.save(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded.machines_dir, config.machines_dir);
        assert_eq!(loaded.display.frame_rate, 24);
    }
}
