//! USB subsystem
//!
//! The pipe/interface/target hierarchy the redirector dispatches through,
//! and a concrete lower stack over rusb.
//!
//! The rusb side follows the hybrid sync-async layout: the device handle
//! lives on a dedicated `usb-worker` thread, and [`RusbBus`] reaches it over
//! the command bridge.

pub mod bus;
pub mod device;
pub mod interface;
pub mod manager;
pub mod pipe;
pub mod target;
pub mod transfers;
pub mod worker;

pub use bus::{InterfaceLayout, RusbBus, read_layout};
pub use device::{DeviceSummary, RusbPnpDevice, UsbDevice};
pub use interface::UsbInterface;
pub use manager::DeviceManager;
pub use pipe::UsbPipe;
pub use target::UsbTarget;
pub use worker::{UsbWorkerThread, spawn_usb_worker};
