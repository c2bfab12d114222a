//! Common plumbing for usb-redirector
//!
//! This crate provides what the filter and its lower stack share: the error
//! type, logging setup, the requester address space and locked buffers, URB
//! and completion types, the lower-stack traits, and the channel bridge to
//! the blocking USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod memory;
pub mod stack;
pub mod test_utils;
pub mod urb;

pub use channel::{
    DEFAULT_CHANNEL_DEPTH, UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use memory::{AddressSpace, LockAccess, LockedBuffer};
pub use stack::{PnpDevice, PnpInformation, PnpIrp, UsbBus};
pub use urb::{CompletionParams, IsoPacket, IsochronousUrb, PipeInfo, Urb, UsbCompletion};
