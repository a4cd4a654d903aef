//! Integration tests for host configuration files
//!
//! Covers:
//! - full and partial files (defaults for omitted sections)
//! - save/load round trip through the filesystem
//! - validation of malformed values

use host::config::{self, HostConfig};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_HOST_CONFIG: &str = r#"
[host]
log_level = "debug"

[usb]
vendor_id = "0x1234"
product_id = "0x5678"
interface = 1
in_endpoint = 0x82
out_endpoint = 0x02
buffer_size = 512
transfer_timeout_ms = 250
handshake = false

[hotplug]
shim_initial_delay_ms = 200
shim_retry_interval_ms = 300
shim_max_attempts = 4

[shutdown]
teardown_timeout_ms = 1500

[pump]
poll_interval_ms = 20
"#;

const MINIMAL_HOST_CONFIG: &str = r#"
[host]
log_level = "info"

[usb]
vendor_id = "0xDEAD"
product_id = "0xBEEF"
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    fs::write(&path, content).unwrap();
    path
}

mod loading {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, FULL_HOST_CONFIG);

        let config = HostConfig::load(Some(path)).unwrap();
        assert_eq!(config.host.log_level, "debug");

        let params = config.device_params();
        assert_eq!(params.interface, 1);
        assert_eq!(params.in_endpoint, 0x82);
        assert_eq!(params.out_endpoint, 0x02);
        assert_eq!(params.buffer_size, 512);
        assert_eq!(params.transfer_timeout, Duration::from_millis(250));
        assert!(!params.handshake);
        assert_eq!(params.teardown_timeout, Duration::from_millis(1500));

        let manager = config.manager_config().unwrap();
        assert!(manager.filter.matches(0x1234, 0x5678));
        assert_eq!(manager.poll_interval, Duration::from_millis(20));
        assert_eq!(manager.shim.initial_delay, Duration::from_millis(200));
        assert_eq!(manager.shim.retry_interval, Duration::from_millis(300));
        assert_eq!(manager.shim.max_attempts, 4);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL_HOST_CONFIG);

        let config = HostConfig::load(Some(path)).unwrap();
        let defaults = HostConfig::default();

        assert_eq!(config.usb.in_endpoint, 0x81);
        assert_eq!(config.usb.out_endpoint, 0x01);
        assert_eq!(config.usb.buffer_size, 60);
        assert!(config.usb.handshake);
        assert_eq!(
            config.shutdown.teardown_timeout_ms,
            defaults.shutdown.teardown_timeout_ms
        );
        assert_eq!(config.pump.poll_interval_ms, defaults.pump.poll_interval_ms);
        assert_eq!(
            config.hotplug.shim_max_attempts,
            defaults.hotplug.shim_max_attempts
        );
    }

    #[test]
    fn test_missing_required_section_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[host]\nlog_level = \"info\"\n");

        assert!(HostConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(HostConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_config_accepts_plain_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL_HOST_CONFIG);

        let config = config::load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.usb_id().unwrap().to_string(), "dead:beef");
    }
}

mod saving {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("host.toml");

        let mut config = HostConfig::default();
        config.usb.vendor_id = "0x0483".to_string();
        config.usb.buffer_size = 64;
        config.save(&path).unwrap();

        let loaded = HostConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.vendor_id, "0x0483");
        assert_eq!(loaded.usb.buffer_size, 64);
        assert_eq!(loaded.host.log_level, "info");
    }
}

mod validation {
    use super::*;

    fn load_with_usb(usb: &str) -> anyhow::Result<HostConfig> {
        let dir = TempDir::new().unwrap();
        let content = format!("[host]\nlog_level = \"info\"\n\n[usb]\n{}", usb);
        let path = write_config(&dir, &content);
        HostConfig::load(Some(path))
    }

    #[test]
    fn test_out_endpoint_as_in_endpoint_rejected() {
        let result = load_with_usb(
            "vendor_id = \"0xDEAD\"\nproduct_id = \"0xBEEF\"\nin_endpoint = 0x81\nout_endpoint = 0x81\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_vendor_id_without_prefix_rejected() {
        let result = load_with_usb("vendor_id = \"DEAD\"\nproduct_id = \"0xBEEF\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let result = load_with_usb(
            "vendor_id = \"0xDEAD\"\nproduct_id = \"0xBEEF\"\nbuffer_size = 0\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let dir = TempDir::new().unwrap();
        let content = MINIMAL_HOST_CONFIG.replace("\"info\"", "\"verbose\"");
        let path = write_config(&dir, &content);

        assert!(HostConfig::load(Some(path)).is_err());
    }
}
