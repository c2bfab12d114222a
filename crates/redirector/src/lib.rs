//! USB device redirection filter
//!
//! A redirector attaches above a USB device, masks its identity so the
//! generic redirector driver binds to it, and serves transfer and
//! configuration requests from a user-mode consumer against the real
//! device.
//!
//! The pieces, bottom-up:
//!
//! - [`device_access`]: property, capability and bus-ID queries against the
//!   device below
//! - [`usb`]: the pipe/interface/target hierarchy, plus a concrete lower
//!   stack over rusb
//! - [`request`] and [`queue`]: the request model and the data and
//!   configuration queues requests are dispatched through
//! - [`strategy`]: PnP interception, buffer locking and transfer dispatch
//! - [`device`]: the filter device tying a strategy to its queues
//! - [`control_plane`]: the registry redirects are reported to

pub mod config;
pub mod control_plane;
pub mod device;
pub mod device_access;
pub mod filter;
pub mod identity;
pub mod queue;
pub mod request;
pub mod strategy;
pub mod usb;

pub use config::RedirectorConfig;
pub use control_plane::{ControlPlane, RedirectEntry, RedirectRegistry};
pub use device::FilterDevice;
pub use device_access::DeviceAccess;
pub use identity::DeviceIdentity;
pub use request::{PendingRequest, Request, RequestOutcome};
pub use strategy::{RedirectorState, RedirectorStrategy};
