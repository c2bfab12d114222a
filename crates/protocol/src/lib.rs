//! Device-control protocol for usb-redirector
//!
//! This crate defines the surface a user-mode consumer talks to a redirected
//! device through: the operation codes, the fixed-layout transfer request
//! payload, isochronous result records and the status every request
//! completes with. It also carries the PnP value types and UTF-16 ID string
//! helpers used by identity interception.
//!
//! # Example
//!
//! ```
//! use protocol::{TransferKind, TransferRequest};
//! use protocol::{decode_transfer_request, encode_transfer_request};
//!
//! let request = TransferRequest {
//!     endpoint_address: 0x81,
//!     buffer: 0x1000,
//!     buffer_length: 64,
//!     transfer_type: TransferKind::Bulk.as_raw(),
//!     ..Default::default()
//! };
//!
//! let bytes = encode_transfer_request(&request);
//! let decoded = decode_transfer_request(&bytes).unwrap();
//! assert_eq!(decoded.kind(), Some(TransferKind::Bulk));
//! ```

pub mod codec;
pub mod error;
pub mod pnp;
pub mod types;
pub mod wide;

pub use codec::{
    BYTES_TRANSFERRED_SIZE, decode_alt_setting, decode_bytes_transferred,
    decode_config_descriptor_header, decode_device_descriptor, decode_iso_results,
    decode_setup_packet, decode_transfer_request, decode_u64, decode_u64_array,
    encode_alt_setting, encode_config_descriptor_header, encode_device_descriptor,
    encode_iso_result, encode_setup_packet, encode_transfer_request, encode_u64,
    encode_u64_array,
};
pub use error::{ProtocolError, Result};
pub use pnp::{BusQueryIdType, DeviceCapabilities, DeviceRegistryProperty, PnpMinorFunction};
pub use types::{
    AltSettingIdxs, ConfigDescriptorHeader, DeviceDescriptor, DeviceIdKey, Direction,
    IoControlCode, IsoTransferResult, PipeType, SetupPacket, TransferKind, TransferRequest,
    UsbError, UsbResult, UsbSpeed, UsbStatus, UsbdStatus, ctl_code, status_code,
};
