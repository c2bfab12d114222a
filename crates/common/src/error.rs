//! Common error types

use protocol::UsbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Status to complete a request with when this error ends it
    pub fn usb_status(&self) -> UsbError {
        match self {
            Error::Usb(e) => *e,
            Error::Channel(_) => UsbError::NoDevice,
            Error::Config(_) => UsbError::InvalidParameter,
            Error::Io(_) => UsbError::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
