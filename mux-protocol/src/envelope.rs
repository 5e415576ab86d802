//! Framing and message bodies for the loopback client protocol (§4.4).
//!
//! Every client command rides inside a fixed 16-byte envelope. Unlike the
//! mux-frame header (big-endian, USB side), the envelope and the legacy
//! binary bodies are little-endian / host order, matching the original
//! daemon's local socket protocol.

use core::fmt;

pub const ENVELOPE_SIZE: usize = 16;

pub const WIRE_VERSION_BINARY: u32 = 0;
pub const WIRE_VERSION_PLIST: u32 = 1;

pub mod message_type {
    /// Reply carrying a single `u32` result code (version-0 clients).
    pub const RESULT: u32 = 1;
    /// Client request: begin proxying to a device port.
    pub const CONNECT: u32 = 4;
    /// Client request: enter LISTEN state.
    pub const LISTEN: u32 = 3;
    /// Notification: a device became visible.
    pub const DEVICE_ADD: u32 = 2;
    /// Notification: a device went away.
    pub const DEVICE_REMOVE: u32 = 5;
    /// Any version-1 (plist) request or reply.
    pub const PLIST: u32 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Total frame length, this header included.
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    TooShort,
    LengthBelowHeader,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::TooShort => write!(f, "buffer shorter than envelope header"),
            EnvelopeError::LengthBelowHeader => write!(f, "declared length below envelope header size"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Envelope {
    pub fn decode(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < ENVELOPE_SIZE {
            return Err(EnvelopeError::TooShort);
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if (length as usize) < ENVELOPE_SIZE {
            return Err(EnvelopeError::LengthBelowHeader);
        }
        Ok(Self {
            length,
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            message: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            tag: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.message.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
    }
}

/// Version-0 CONNECT request body: `{device_id: u32 (LE), port: u16, _: u16}`.
///
/// `device_id` is little-endian (host order) per the original daemon;
/// `port` is carried already in network byte order and must not be
/// byte-swapped again by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequestV0 {
    pub device_id: u32,
    pub port_network_order: u16,
}

impl ConnectRequestV0 {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < Self::SIZE {
            return Err(EnvelopeError::TooShort);
        }
        Ok(Self {
            device_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            port_network_order: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
        })
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.port_network_order.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]);
    }

    pub fn port_host_order(&self) -> u16 {
        self.port_network_order
    }
}

/// Fixed-layout DEVICE_ADD notification body for version-0 (binary) clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRecordV0 {
    pub device_id: u32,
    pub serial: String,
    pub location: u32,
    pub product_id: u32,
}

impl AttachRecordV0 {
    const SERIAL_FIELD_LEN: usize = 256;
    pub const SIZE: usize = 4 + Self::SERIAL_FIELD_LEN + 4 + 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.device_id.to_le_bytes());
        let mut serial_buf = [0u8; Self::SERIAL_FIELD_LEN];
        let bytes = self.serial.as_bytes();
        let n = bytes.len().min(Self::SERIAL_FIELD_LEN - 1);
        serial_buf[..n].copy_from_slice(&bytes[..n]);
        out.extend_from_slice(&serial_buf);
        out.extend_from_slice(&self.location.to_le_bytes());
        out.extend_from_slice(&self.product_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < Self::SIZE {
            return Err(EnvelopeError::TooShort);
        }
        let device_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let serial_bytes = &buf[4..4 + Self::SERIAL_FIELD_LEN];
        let nul = serial_bytes.iter().position(|&b| b == 0).unwrap_or(serial_bytes.len());
        let serial = String::from_utf8_lossy(&serial_bytes[..nul]).into_owned();
        let rest = &buf[4 + Self::SERIAL_FIELD_LEN..];
        let location = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let product_id = u32::from_le_bytes(rest[4..8].try_into().unwrap());
        Ok(Self { device_id, serial, location, product_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachRecordV0 {
    pub device_id: u32,
}

impl DetachRecordV0 {
    pub const SIZE: usize = 4;

    pub fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.device_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < Self::SIZE {
            return Err(EnvelopeError::TooShort);
        }
        Ok(Self { device_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()) })
    }
}

/// Recognized result codes (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    BadCommand = 1,
    BadDevice = 2,
    ConnRefused = 3,
    BadVersion = 6,
}
