//! Protocol error types

use crate::types::UsbError;
use thiserror::Error;

/// Errors raised while decoding device-control payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Transfer type tag outside the known set
    #[error("Invalid transfer type: {0}")]
    InvalidTransferType(u64),

    /// Wide string is missing its terminator(s)
    #[error("Unterminated wide string ({units} code units)")]
    UnterminatedString { units: usize },

    /// Descriptor header names another descriptor type
    #[error("Expected descriptor type {expected:#04x}, found {found:#04x}")]
    UnexpectedDescriptorType { expected: u8, found: u8 },

    /// Wide string is not valid UTF-16
    #[error("Invalid UTF-16 in wide string")]
    InvalidUtf16,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ProtocolError> for UsbError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::BufferTooSmall { needed, .. } => UsbError::BufferTooSmall { needed },
            ProtocolError::InvalidTransferType(_)
            | ProtocolError::UnterminatedString { .. }
            | ProtocolError::InvalidUtf16 => UsbError::InvalidParameter,
            ProtocolError::UnexpectedDescriptorType { .. } => UsbError::InvalidDeviceRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 56,
            available: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Buffer too small"));
        assert!(msg.contains("56"));
        assert!(msg.contains("8"));
    }

    #[test]
    fn test_conversion_to_usb_error() {
        let err = ProtocolError::BufferTooSmall {
            needed: 16,
            available: 4,
        };
        assert_eq!(UsbError::from(err), UsbError::BufferTooSmall { needed: 16 });
        assert_eq!(
            UsbError::from(ProtocolError::InvalidTransferType(9)),
            UsbError::InvalidParameter
        );
    }
}
