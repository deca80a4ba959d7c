use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_FILE_NAME: &str = ".proximity.toml";
pub const DEFAULT_INTERVAL_SECONDS: u64 = 20;
pub const DEFAULT_SCAN_TIMEOUT_SECONDS: u64 = 8;
pub const DEFAULT_MAX_DEVICES: usize = 10;
pub const DEFAULT_SHELL: &str = "bash";

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<ActionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
    pub devices: Option<Vec<DeviceEntry>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub max_devices: Option<usize>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct ActionConfig {
    pub shell: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// A `[[devices]]` entry as written in the file. Every field is optional so a
/// single malformed entry does not reject the whole file.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct DeviceEntry {
    pub address: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// A configured device and the commands to run on its transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub address: String,
    pub name: String,
    pub start: Vec<String>,
    pub stop: Vec<String>,
}

/// Startup settings resolved from the file and the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub interval: Duration,
    pub scan_timeout: Duration,
    pub max_devices: usize,
    pub shell: String,
    pub action_timeout: Option<Duration>,
}

impl AppConfig {
    /// Skeleton written on first run.
    pub fn template() -> Self {
        AppConfig {
            scan: Some(ScanConfig {
                interval_seconds: Some(DEFAULT_INTERVAL_SECONDS),
                timeout_seconds: Some(DEFAULT_SCAN_TIMEOUT_SECONDS),
                max_devices: Some(DEFAULT_MAX_DEVICES),
            }),
            actions: None,
            mqtt: None,
            devices: Some(vec![DeviceEntry {
                address: Some("FF:FF:FF:FF:FF:FF".to_string()),
                name: Some("Default Name".to_string()),
                start: Vec::new(),
                stop: Vec::new(),
            }]),
        }
    }

    pub fn settings(&self) -> Settings {
        let scan = self.scan.clone().unwrap_or_default();
        let actions = self.actions.clone().unwrap_or_default();
        Settings {
            interval: Duration::from_secs(
                scan.interval_seconds
                    .unwrap_or(DEFAULT_INTERVAL_SECONDS)
                    .max(1),
            ),
            scan_timeout: Duration::from_secs(
                scan.timeout_seconds.unwrap_or(DEFAULT_SCAN_TIMEOUT_SECONDS),
            ),
            max_devices: scan.max_devices.unwrap_or(DEFAULT_MAX_DEVICES),
            shell: actions.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            action_timeout: actions.timeout_seconds.map(Duration::from_secs),
        }
    }

    /// Converts the `[[devices]]` entries into the records the engine joins on.
    ///
    /// Entries without an address cannot be matched and are skipped. Addresses
    /// are kept verbatim; suspicious ones are only reported.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        let Some(entries) = self.devices.as_ref() else {
            warn!("No devices configured");
            return Vec::new();
        };

        entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let Some(address) = entry.address.clone() else {
                    warn!("Device #{} has no address, skipping it", index + 1);
                    return None;
                };
                check_address(&address);
                let name = entry.name.clone().unwrap_or_else(|| {
                    warn!("Device {} has no name, using its address", address);
                    address.clone()
                });
                Some(DeviceConfig {
                    address,
                    name,
                    start: entry.start.clone(),
                    stop: entry.stop.clone(),
                })
            })
            .collect()
    }
}

impl Settings {
    pub fn with_overrides(
        mut self,
        interval_seconds: Option<u64>,
        scan_timeout_seconds: Option<u64>,
        max_devices: Option<usize>,
    ) -> Self {
        if let Some(seconds) = interval_seconds {
            self.interval = Duration::from_secs(seconds.max(1));
        }
        if let Some(seconds) = scan_timeout_seconds {
            self.scan_timeout = Duration::from_secs(seconds);
        }
        if let Some(max) = max_devices {
            self.max_devices = max;
        }
        self
    }
}

// Discovery reports upper-case colon-separated addresses, so anything else
// will never match. Kept as-is, only reported.
fn check_address(address: &str) {
    if address.parse::<MacAddress>().is_err() {
        warn!(
            "Device address {:?} is not a MAC address; it only matches an identical scanned address",
            address
        );
    } else if address.chars().any(|c| c.is_ascii_lowercase()) {
        warn!(
            "Device address {:?} contains lowercase digits; scanned addresses are upper-case and will not match",
            address
        );
    }
}

pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(DEFAULT_FILE_NAME))
}

pub fn load(path: &Path) -> Result<AppConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = toml::de::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Loads the config, or writes a template and returns `None` when the file
/// does not exist yet.
pub fn load_or_init(path: &Path) -> Result<Option<AppConfig>> {
    if path.exists() {
        return load(path).map(Some);
    }
    write_template(path)?;
    info!("New configuration successfully written to: {}", path.display());
    Ok(None)
}

pub fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(&AppConfig::template())
        .context("Failed to serialize default configuration")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write default configuration: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [scan]
            interval_seconds = 30
            timeout_seconds = 5
            max_devices = 4

            [actions]
            shell = "sh"
            timeout_seconds = 60

            [mqtt]
            host = "localhost"
            port = 1883

            [[devices]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Phone"
            start = ["/usr/local/bin/unlock", "/usr/local/bin/lights-on"]
            stop = ["/usr/local/bin/lock"]
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.mqtt.as_ref().map(|m| m.host.as_str()), Some("localhost"));

        let settings = config.settings();
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.scan_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_devices, 4);
        assert_eq!(settings.shell, "sh");
        assert_eq!(settings.action_timeout, Some(Duration::from_secs(60)));

        let devices = config.device_configs();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            devices[0].start,
            vec!["/usr/local/bin/unlock", "/usr/local/bin/lights-on"]
        );
        assert_eq!(devices[0].stop, vec!["/usr/local/bin/lock"]);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: AppConfig = toml::de::from_str("").unwrap();
        let settings = config.settings();
        assert_eq!(settings.interval, Duration::from_secs(DEFAULT_INTERVAL_SECONDS));
        assert_eq!(settings.max_devices, DEFAULT_MAX_DEVICES);
        assert_eq!(settings.shell, DEFAULT_SHELL);
        assert_eq!(settings.action_timeout, None);
        assert!(config.device_configs().is_empty());
    }

    #[test]
    fn test_missing_device_fields() {
        let config_str = r#"
            [[devices]]
            name = "No address"
            start = ["/bin/true"]

            [[devices]]
            address = "11:22:33:44:55:66"
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        let devices = config.device_configs();
        assert_eq!(
            devices,
            vec![DeviceConfig {
                address: "11:22:33:44:55:66".to_string(),
                name: "11:22:33:44:55:66".to_string(),
                start: Vec::new(),
                stop: Vec::new(),
            }]
        );
    }

    #[test]
    fn test_addresses_are_not_normalized() {
        let config_str = r#"
            [[devices]]
            address = "aa:bb:cc:dd:ee:ff"
            name = "Lowercase"
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.device_configs()[0].address, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let settings = AppConfig::default()
            .settings()
            .with_overrides(Some(0), Some(2), Some(3));
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.scan_timeout, Duration::from_secs(2));
        assert_eq!(settings.max_devices, 3);
    }

    #[test]
    fn test_first_run_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("proximity.toml");

        assert!(load_or_init(&path).unwrap().is_none());
        assert!(path.exists());

        let config = load_or_init(&path).unwrap().expect("config after init");
        let devices = config.device_configs();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "FF:FF:FF:FF:FF:FF");
        assert_eq!(devices[0].name, "Default Name");
        assert!(devices[0].start.is_empty());
        assert!(devices[0].stop.is_empty());
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "devices = [[[").unwrap();
        assert!(load(&path).is_err());
    }
}
