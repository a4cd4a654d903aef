//! Error type shared by the host library and binary
//!
//! Transport failures are classified in detail by the host crate and arrive
//! here already rendered, so callers above the USB layer only see which
//! subsystem failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The USB transport rejected an operation
    #[error("USB transport error: {0}")]
    Usb(String),

    /// An operation was attempted in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    Lifecycle(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread spawn or other OS-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
