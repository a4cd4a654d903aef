//! Logging setup
//!
//! Output carries thread names: the event pump (`usb-events`), the hotplug
//! dispatcher (`usb-hotplug`), the shim (`usb-shim`) and one consumer per
//! device (`usb-rx-*`) are what tell interleaved lines apart.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target that libusb's own log output is forwarded under
pub const LIBUSB_TARGET: &str = "libusb";

/// Build the filter: `RUST_LOG` when set, otherwise `default_level` with
/// libusb chatter capped at info
pub fn log_filter(default_level: &str) -> crate::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let libusb_level = match default_level {
        "trace" | "debug" => "info",
        other => other,
    };
    EnvFilter::try_new(format!(
        "{},{}={}",
        default_level, LIBUSB_TARGET, libusb_level
    ))
    .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Install the global tracing subscriber
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = log_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        // Only meaningful when RUST_LOG does not override the level
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                log_filter("loud=["),
                Err(crate::Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_libusb_capped_below_debug() {
        if std::env::var_os("RUST_LOG").is_none() {
            let filter = log_filter("debug").unwrap();
            assert!(filter.to_string().contains("libusb=info"));
        }
    }
}
