//! USB type abstractions and utilities
//!
//! Shared USB-related types used by the host library, its transport
//! backends and the binary.

use std::fmt;

/// Bit 7 of an endpoint address: set for IN (device to host)
pub const ENDPOINT_DIR_MASK: u8 = 0x80;

/// Vendor/product pair identifying the devices this host claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check whether a descriptor's VID/PID matches this identity
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Transfer direction, derived from the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host (high bit set)
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn of(endpoint: u8) -> Self {
        if endpoint & ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("read"),
            Direction::Out => f.write_str("write"),
        }
    }
}

/// One unit of received data tagged with its originating endpoint
///
/// On the wire a frame is one leading endpoint byte followed by exactly the
/// bytes the transfer reported as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub endpoint: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(endpoint: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            endpoint,
            payload: payload.into(),
        }
    }

    /// Encode as `[endpoint, payload...]`
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(1 + self.payload.len());
        wire.push(self.endpoint);
        wire.extend_from_slice(&self.payload);
        wire
    }

    pub fn direction(&self) -> Direction {
        Direction::of(self.endpoint)
    }
}

/// Parse a serial number string descriptor into a signed integer
///
/// Accepts optional leading whitespace, an optional sign and then decimal
/// digits; parsing stops at the first non-digit. Returns `None` when no digit
/// is present or the value does not fit an `i32`.
pub fn parse_serial(raw: &str) -> Option<i32> {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let value: i64 = digits[..end].parse().ok()?;
    let value = if negative { -value } else { value };
    i32::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_endpoint() {
        assert_eq!(Direction::of(0x81), Direction::In);
        assert_eq!(Direction::of(0x01), Direction::Out);
        assert_eq!(Direction::of(0x7F), Direction::Out);
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::new(0x81, vec![0x10, 0x20]);
        assert_eq!(frame.to_wire(), vec![0x81, 0x10, 0x20]);
        assert_eq!(frame.direction(), Direction::In);
        assert_eq!(Frame::new(0x81, Vec::new()).to_wire(), vec![0x81]);
    }

    #[test]
    fn test_parse_serial() {
        assert_eq!(parse_serial("00000042"), Some(42));
        assert_eq!(parse_serial("  17abc"), Some(17));
        assert_eq!(parse_serial("-5"), Some(-5));
        assert_eq!(parse_serial("F6D0D4CE"), None);
        assert_eq!(parse_serial(""), None);
        assert_eq!(parse_serial("99999999999"), None);
    }

    #[test]
    fn test_usb_id_display() {
        let id = UsbId::new(0xDEAD, 0xBEEF);
        assert_eq!(id.to_string(), "dead:beef");
        assert!(id.matches(0xDEAD, 0xBEEF));
        assert!(!id.matches(0xDEAD, 0x0001));
    }
}
