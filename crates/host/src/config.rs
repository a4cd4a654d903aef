//! Host configuration management

use crate::usb::{DeviceParams, ManagerConfig, ShimSettings};
use anyhow::{Context, Result, anyhow};
use common::UsbId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    pub usb: UsbSettings,
    #[serde(default)]
    pub hotplug: HotplugSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub pump: PumpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor ID to claim, as hex (e.g. "0xDEAD")
    pub vendor_id: String,
    /// Product ID to claim, as hex (e.g. "0xBEEF")
    pub product_id: String,
    #[serde(default)]
    pub interface: u8,
    #[serde(default = "UsbSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    #[serde(default = "UsbSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    /// Receive buffer size in bytes
    #[serde(default = "UsbSettings::default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Send a zeroed frame to the OUT endpoint once a device is set up
    #[serde(default = "UsbSettings::default_handshake")]
    pub handshake: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: "0xDEAD".to_string(),
            product_id: "0xBEEF".to_string(),
            interface: 0,
            in_endpoint: Self::default_in_endpoint(),
            out_endpoint: Self::default_out_endpoint(),
            buffer_size: Self::default_buffer_size(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            handshake: Self::default_handshake(),
        }
    }
}

impl UsbSettings {
    fn default_in_endpoint() -> u8 {
        0x81
    }

    fn default_out_endpoint() -> u8 {
        0x01
    }

    fn default_buffer_size() -> usize {
        60
    }

    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_handshake() -> bool {
        true
    }
}

/// Platform shim timing, used only without native hotplug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotplugSettings {
    #[serde(default = "HotplugSettings::default_delay_ms")]
    pub shim_initial_delay_ms: u64,
    #[serde(default = "HotplugSettings::default_delay_ms")]
    pub shim_retry_interval_ms: u64,
    #[serde(default = "HotplugSettings::default_max_attempts")]
    pub shim_max_attempts: u32,
}

impl Default for HotplugSettings {
    fn default() -> Self {
        Self {
            shim_initial_delay_ms: Self::default_delay_ms(),
            shim_retry_interval_ms: Self::default_delay_ms(),
            shim_max_attempts: Self::default_max_attempts(),
        }
    }
}

impl HotplugSettings {
    fn default_delay_ms() -> u64 {
        1000
    }

    fn default_max_attempts() -> u32 {
        10
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// How long a Device waits for its cancelled receive transfer
    #[serde(default = "ShutdownSettings::default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            teardown_timeout_ms: Self::default_teardown_timeout_ms(),
        }
    }
}

impl ShutdownSettings {
    fn default_teardown_timeout_ms() -> u64 {
        10_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSettings {
    #[serde(default = "PumpSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl PumpSettings {
    fn default_poll_interval_ms() -> u64 {
        100
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
            },
            usb: UsbSettings::default(),
            hotplug: HotplugSettings::default(),
            shutdown: ShutdownSettings::default(),
            pump: PumpSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-echo-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-echo-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-echo-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.usb.vendor_id, "vendor_id")?;
        parse_hex_id(&self.usb.product_id, "product_id")?;

        if self.usb.in_endpoint & common::usb_types::ENDPOINT_DIR_MASK == 0 {
            return Err(anyhow!(
                "Invalid in_endpoint {:#04x}, IN endpoints have the high bit set",
                self.usb.in_endpoint
            ));
        }
        if self.usb.out_endpoint & common::usb_types::ENDPOINT_DIR_MASK != 0 {
            return Err(anyhow!(
                "Invalid out_endpoint {:#04x}, OUT endpoints have the high bit clear",
                self.usb.out_endpoint
            ));
        }
        if self.usb.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than zero"));
        }
        if self.hotplug.shim_max_attempts == 0 {
            return Err(anyhow!("shim_max_attempts must be at least 1"));
        }

        Ok(())
    }

    /// The vendor/product pair this host claims
    pub fn usb_id(&self) -> Result<UsbId> {
        Ok(UsbId::new(
            parse_hex_id(&self.usb.vendor_id, "vendor_id")?,
            parse_hex_id(&self.usb.product_id, "product_id")?,
        ))
    }

    pub fn device_params(&self) -> DeviceParams {
        DeviceParams {
            interface: self.usb.interface,
            in_endpoint: self.usb.in_endpoint,
            out_endpoint: self.usb.out_endpoint,
            buffer_size: self.usb.buffer_size,
            transfer_timeout: Duration::from_millis(self.usb.transfer_timeout_ms),
            handshake: self.usb.handshake,
            teardown_timeout: Duration::from_millis(self.shutdown.teardown_timeout_ms),
        }
    }

    pub fn manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig {
            filter: self.usb_id()?,
            device: self.device_params(),
            poll_interval: Duration::from_millis(self.pump.poll_interval_ms),
            shim: ShimSettings {
                initial_delay: Duration::from_millis(self.hotplug.shim_initial_delay_ms),
                retry_interval: Duration::from_millis(self.hotplug.shim_retry_interval_ms),
                max_attempts: self.hotplug.shim_max_attempts,
            },
        })
    }
}

/// Parse a hex ID (VID or PID) written as `0x1234`
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
