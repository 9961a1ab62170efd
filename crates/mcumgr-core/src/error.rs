//! Error types shared across the crate.

use thiserror::Error;

use crate::protocol::ReturnCode;
use crate::protocol::codec::CodecError;
use crate::transport::TransportError;

/// Malformed or truncated bytes, from the wire or from a firmware file.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid image magic: 0x{actual:08X}")]
    InvalidMagic { actual: u32 },
    #[error("Invalid TLV info magic: 0x{actual:04X}")]
    InvalidTlvMagic { actual: u16 },
    #[error("TLV entry at offset {offset} needs {needed} bytes, {available} available")]
    TruncatedTlv {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Manifest digest marker not found")]
    MarkerNotFound,
    #[error("Response does not match request: {0}")]
    UnexpectedResponse(String),
    #[error("Missing or invalid field '{0}'")]
    InvalidField(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Firmware image parsing failures.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("No hash TLV found in image")]
    NoHashFound,
    #[error("Not a manifest (SUIT) image")]
    NotManifestFormat,
}

/// Top-level error for client, transfer and upgrade operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device returned {}", ReturnCode::from_code(*.code))]
    Device { code: i64, group: Option<u16> },

    #[error("Invalid device state: {0}")]
    InvalidDeviceState(String),

    #[error("Device did not respond after reset ({attempts} polls)")]
    ResetPollTimeout { attempts: u32 },

    #[error("Offset {offset} out of range for {total}-byte transfer")]
    OffsetOutOfRange { offset: usize, total: usize },

    #[error("MTU {mtu} too small, request overhead is {overhead} bytes")]
    MtuTooSmall { mtu: usize, overhead: usize },

    #[error("Resource '{uri}' unavailable: {message}")]
    Resource { uri: String, message: String },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl Error {
    /// Device status code, if the device rejected the request.
    pub fn device_code(&self) -> Option<ReturnCode> {
        match self {
            Error::Device { code, .. } => Some(ReturnCode::from_code(*code)),
            _ => None,
        }
    }

    /// Whether the link went away (device rebooting, out of range, ...).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Disconnected | TransportError::Timeout { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = Error::Device {
            code: 6,
            group: None,
        };
        assert_eq!(err.to_string(), "Device returned BAD_STATE (6)");
        assert_eq!(err.device_code(), Some(ReturnCode::BadState));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::Transport(TransportError::Disconnected).is_disconnect());
        assert!(Error::Transport(TransportError::Timeout { timeout_ms: 10 }).is_disconnect());
        assert!(!Error::InvalidDeviceState("x".into()).is_disconnect());
    }
}
