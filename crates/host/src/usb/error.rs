//! Transport error taxonomy

use thiserror::Error;

/// Errors reported by the USB transport
///
/// One variant per transport return code, so backends other than libusb can
/// map onto the same classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Input/output error")]
    Io,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Access denied (insufficient permissions)")]
    Access,
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    #[error("Entity not found")]
    NotFound,
    #[error("Resource busy")]
    Busy,
    #[error("Operation timed out")]
    Timeout,
    #[error("Overflow")]
    Overflow,
    #[error("Pipe error")]
    Pipe,
    #[error("System call interrupted")]
    Interrupted,
    #[error("Insufficient memory")]
    NoMem,
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("Other error: {0}")]
    Other(String),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => TransportError::Io,
            rusb::Error::InvalidParam => TransportError::InvalidParam,
            rusb::Error::Access => TransportError::Access,
            rusb::Error::NoDevice => TransportError::NoDevice,
            rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Overflow => TransportError::Overflow,
            rusb::Error::Pipe => TransportError::Pipe,
            rusb::Error::Interrupted => TransportError::Interrupted,
            rusb::Error::NoMem => TransportError::NoMem,
            rusb::Error::NotSupported => TransportError::NotSupported,
            _ => TransportError::Other(err.to_string()),
        }
    }
}

impl From<TransportError> for common::Error {
    fn from(err: TransportError) -> Self {
        common::Error::Usb(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(TransportError::from(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(TransportError::from(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(TransportError::from(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(
            TransportError::from(rusb::Error::NotSupported),
            TransportError::NotSupported
        );
        assert!(matches!(
            TransportError::from(rusb::Error::Other),
            TransportError::Other(_)
        ));
    }
}
