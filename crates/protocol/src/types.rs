//! Device-control type definitions
//!
//! This module defines the types exchanged with the user-mode consumer over
//! the device-control surface: operation codes, transfer request payloads,
//! the control setup packet, isochronous result records, and the status
//! taxonomy every request completes with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Final status of a request or sub-operation
///
/// Each variant maps onto one NTSTATUS code (see [`UsbError::ntstatus`]) so
/// that a consumer talking the native device-control protocol sees the
/// status it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbError {
    #[error("Insufficient resources")]
    InsufficientResources,
    #[error("Invalid device state")]
    InvalidDeviceState,
    #[error("Not found")]
    NotFound,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Access violation")]
    AccessViolation,
    #[error("Invalid device request")]
    InvalidDeviceRequest,
    #[error("Buffer too small: {needed} bytes needed")]
    BufferTooSmall { needed: usize },
    #[error("Request cancelled")]
    Cancelled,
    #[error("Not supported")]
    NotSupported,
    /// Endpoint halted (STALL handshake)
    #[error("Endpoint stalled")]
    Stall,
    #[error("Timed out")]
    Timeout,
    #[error("No such device")]
    NoDevice,
    #[error("I/O device error")]
    Io,
    #[error("Device busy")]
    Busy,
    #[error("Buffer overflow")]
    Overflow,
    #[error("Access denied")]
    AccessDenied,
    #[error("Object name collision")]
    ObjectNameCollision,
    #[error("Unsuccessful")]
    Unsuccessful,
    /// Configuration descriptor reports no total length
    #[error("Invalid configuration descriptor")]
    InvalidConfigurationDescriptor,
}

impl UsbError {
    /// NTSTATUS code reported for this error
    pub fn ntstatus(&self) -> u32 {
        match self {
            UsbError::InsufficientResources => 0xC000_009A,
            UsbError::InvalidDeviceState => 0xC000_0184,
            UsbError::NotFound => 0xC000_0225,
            UsbError::InvalidParameter => 0xC000_000D,
            UsbError::AccessViolation => 0xC000_0005,
            UsbError::InvalidDeviceRequest => 0xC000_0010,
            UsbError::BufferTooSmall { .. } => 0xC000_0023,
            UsbError::Cancelled => 0xC000_0120,
            UsbError::NotSupported => 0xC000_00BB,
            UsbError::Stall => 0xC000_014B,
            UsbError::Timeout => 0xC000_00B5,
            UsbError::NoDevice => 0xC000_000E,
            UsbError::Io => 0xC000_0185,
            UsbError::Busy => 0x8000_0011,
            UsbError::Overflow => 0x8000_0005,
            UsbError::AccessDenied => 0xC000_0022,
            UsbError::ObjectNameCollision => 0xC000_0035,
            UsbError::Unsuccessful => 0xC000_0001,
            UsbError::InvalidConfigurationDescriptor => 0xC000_0F00,
        }
    }
}

/// Outcome of an operation that carries no value
pub type UsbStatus = Result<(), UsbError>;

/// Result alias used across the redirector
pub type UsbResult<T> = Result<T, UsbError>;

/// NTSTATUS code of a completion status (`STATUS_SUCCESS` is zero)
pub fn status_code(status: &UsbStatus) -> u32 {
    match status {
        Ok(()) => 0,
        Err(e) => e.ntstatus(),
    }
}

/// USBD status reported by the host controller for a URB or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UsbdStatus(pub u32);

impl UsbdStatus {
    pub const SUCCESS: UsbdStatus = UsbdStatus(0);
    pub const PENDING: UsbdStatus = UsbdStatus(0x4000_0000);
    pub const STALL_PID: UsbdStatus = UsbdStatus(0xC000_0004);
    pub const DATA_OVERRUN: UsbdStatus = UsbdStatus(0xC000_0008);
    pub const DEV_NOT_RESPONDING: UsbdStatus = UsbdStatus(0xC000_0005);
    pub const ISO_NOT_ACCESSED_BY_HW: UsbdStatus = UsbdStatus(0xC002_0000);
    pub const REQUEST_FAILED: UsbdStatus = UsbdStatus(0x8000_0500);
    pub const INVALID_CONFIGURATION_DESCRIPTOR: UsbdStatus = UsbdStatus(0xC000_0F00);

    /// Success and pending codes have the error bit clear
    pub fn is_success(&self) -> bool {
        (self.0 as i32) >= 0
    }
}

/// Transfer direction, taken from bit 7 of an endpoint address or
/// of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    pub fn from_endpoint(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type as declared by the endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Transfer type tag carried by a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferKind {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(TransferKind::Control),
            1 => Some(TransferKind::Bulk),
            2 => Some(TransferKind::Interrupt),
            3 => Some(TransferKind::Isochronous),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> u64 {
        match self {
            TransferKind::Control => 0,
            TransferKind::Bulk => 1,
            TransferKind::Interrupt => 2,
            TransferKind::Isochronous => 3,
        }
    }
}

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// Build a device-control code the way `CTL_CODE` does
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Device-control operations understood by the redirector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoControlCode {
    AbortPipe,
    ResetPipe,
    SetAltSetting,
    ResetDevice,
    ReadPipe,
    WritePipe,
}

impl IoControlCode {
    pub const ALL: [IoControlCode; 6] = [
        IoControlCode::AbortPipe,
        IoControlCode::ResetPipe,
        IoControlCode::SetAltSetting,
        IoControlCode::ResetDevice,
        IoControlCode::ReadPipe,
        IoControlCode::WritePipe,
    ];

    pub const fn code(&self) -> u32 {
        let function = match self {
            IoControlCode::AbortPipe => 0x851,
            IoControlCode::ResetPipe => 0x852,
            IoControlCode::SetAltSetting => 0x853,
            IoControlCode::ResetDevice => 0x854,
            IoControlCode::ReadPipe => 0x855,
            IoControlCode::WritePipe => 0x856,
        };
        ctl_code(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, FILE_ANY_ACCESS)
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Whether the operation moves data (read/write pipe)
    pub fn is_data_transfer(&self) -> bool {
        matches!(self, IoControlCode::ReadPipe | IoControlCode::WritePipe)
    }
}

/// Transfer request payload of `READ_PIPE` / `WRITE_PIPE`
///
/// Addresses refer to the requester's address space and are only
/// meaningful while the request is being preprocessed in caller context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferRequest {
    /// Endpoint address (includes direction bit)
    pub endpoint_address: u64,
    /// Data buffer address; for control transfers the setup packet comes first
    pub buffer: u64,
    /// Data buffer length in bytes
    pub buffer_length: u64,
    /// Raw transfer type tag, see [`TransferKind::from_raw`]
    pub transfer_type: u64,
    /// Number of entries in both isochronous arrays
    pub iso_packets_array_size: u64,
    /// Address of `iso_packets_array_size` u64 packet sizes
    pub iso_packets_array: u64,
    /// Address of `iso_packets_array_size` result records
    pub iso_results_array: u64,
}

impl TransferRequest {
    /// Encoded size in bytes
    pub const SIZE: usize = 7 * 8;

    pub fn kind(&self) -> Option<TransferKind> {
        TransferKind::from_raw(self.transfer_type)
    }
}

/// USB control setup packet (8 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Direction of the data phase (bit 7 of bmRequestType)
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

const GET_DESCRIPTOR: u8 = 0x06;

impl SetupPacket {
    /// Standard `GET_DESCRIPTOR` request for `length` bytes of descriptor
    /// `descriptor_type` number `index`
    pub fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(index),
            index: 0,
            length,
        }
    }
}

/// Bus speed a device is operating at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UsbSpeed {
    /// The bus did not report a speed
    #[default]
    NoSpeed,
    Low,
    Full,
    High,
    Super,
}

/// Standard USB device descriptor (18 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;
    pub const DESCRIPTOR_TYPE: u8 = 0x01;
    pub const CLASS_HUB: u8 = 0x09;

    pub fn is_hub(&self) -> bool {
        self.class == Self::CLASS_HUB
    }
}

/// Fixed header of a configuration descriptor (9 bytes on the wire)
///
/// `total_length` covers the header and every interface, endpoint and
/// class-specific descriptor that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConfigDescriptorHeader {
    /// wTotalLength
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// iConfiguration
    pub string_index: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower, in 2 mA units
    pub max_power: u8,
}

impl ConfigDescriptorHeader {
    pub const SIZE: usize = 9;
    pub const DESCRIPTOR_TYPE: u8 = 0x02;
}

/// Per-packet result mirrored into the caller's isochronous result array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsoTransferResult {
    pub actual_length: u64,
    pub transfer_result: u64,
}

impl IsoTransferResult {
    pub const SIZE: usize = 16;
}

/// Payload of `SET_ALTSETTING`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AltSettingIdxs {
    pub interface_idx: u64,
    pub alt_setting_idx: u64,
}

impl AltSettingIdxs {
    pub const SIZE: usize = 16;
}

/// Identity key of a redirect in the control plane
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdKey {
    pub device_id: String,
    pub instance_id: String,
}

impl DeviceIdKey {
    pub fn new(device_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            instance_id: instance_id.into(),
        }
    }
}
