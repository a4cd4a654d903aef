//! Common utilities for usb-echo-host
//!
//! This crate provides functionality shared by the host library and binary:
//! error handling, logging setup, and the USB type abstractions (device
//! identity, endpoint direction, received frames, serial numbers).

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{Direction, Frame, UsbId, parse_serial};
