//! On-disk configuration for the flashing tool.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Persistent settings; everything job-specific travels in `FlashOptions`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Serial port override. When unset the bootloader port is discovered by
    /// its USB identifiers.
    pub port: Option<String>,
    /// Take the USB-HID path by default when the device supports it.
    pub prefer_usbhid: bool,
    /// Path to the bootloader-updater image used when the device carries an
    /// obsolete bootloader.
    pub bootloader_updater_path: Option<String>,
}

impl FlashConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlashConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let config = FlashConfig {
            port: Some("/dev/ttyACM0".into()),
            prefer_usbhid: true,
            bootloader_updater_path: Some("updater.bin".into()),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: FlashConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.port.as_deref(), Some("/dev/ttyACM0"));
        assert!(back.prefer_usbhid);
        assert_eq!(back.bootloader_updater_path.as_deref(), Some("updater.bin"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: FlashConfig = toml::from_str("").unwrap();
        assert!(config.port.is_none());
        assert!(!config.prefer_usbhid);
    }
}
