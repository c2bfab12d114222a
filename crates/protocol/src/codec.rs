//! Fixed-layout little-endian codec for device-control payloads
//!
//! Every payload on the device-control surface is a packed sequence of
//! little-endian integers, so decoding is a bounds check followed by a
//! sequence of `get_*_le` reads.

use crate::error::{ProtocolError, Result};
use crate::types::{
    AltSettingIdxs, ConfigDescriptorHeader, DeviceDescriptor, IsoTransferResult, SetupPacket,
    TransferRequest,
};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the transferred-byte-count output record
pub const BYTES_TRANSFERRED_SIZE: usize = 8;

fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Decode a single u64 input (endpoint address for abort/reset pipe)
pub fn decode_u64(mut buf: &[u8]) -> Result<u64> {
    ensure_len(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a `READ_PIPE` / `WRITE_PIPE` transfer request
pub fn decode_transfer_request(mut buf: &[u8]) -> Result<TransferRequest> {
    ensure_len(buf, TransferRequest::SIZE)?;
    Ok(TransferRequest {
        endpoint_address: buf.get_u64_le(),
        buffer: buf.get_u64_le(),
        buffer_length: buf.get_u64_le(),
        transfer_type: buf.get_u64_le(),
        iso_packets_array_size: buf.get_u64_le(),
        iso_packets_array: buf.get_u64_le(),
        iso_results_array: buf.get_u64_le(),
    })
}

pub fn encode_transfer_request(request: &TransferRequest) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(TransferRequest::SIZE);
    buf.put_u64_le(request.endpoint_address);
    buf.put_u64_le(request.buffer);
    buf.put_u64_le(request.buffer_length);
    buf.put_u64_le(request.transfer_type);
    buf.put_u64_le(request.iso_packets_array_size);
    buf.put_u64_le(request.iso_packets_array);
    buf.put_u64_le(request.iso_results_array);
    buf.to_vec()
}

pub fn decode_setup_packet(mut buf: &[u8]) -> Result<SetupPacket> {
    ensure_len(buf, SetupPacket::SIZE)?;
    Ok(SetupPacket {
        request_type: buf.get_u8(),
        request: buf.get_u8(),
        value: buf.get_u16_le(),
        index: buf.get_u16_le(),
        length: buf.get_u16_le(),
    })
}

pub fn encode_setup_packet(setup: &SetupPacket) -> [u8; SetupPacket::SIZE] {
    let mut out = [0u8; SetupPacket::SIZE];
    let mut buf = &mut out[..];
    buf.put_u8(setup.request_type);
    buf.put_u8(setup.request);
    buf.put_u16_le(setup.value);
    buf.put_u16_le(setup.index);
    buf.put_u16_le(setup.length);
    out
}

pub fn decode_alt_setting(mut buf: &[u8]) -> Result<AltSettingIdxs> {
    ensure_len(buf, AltSettingIdxs::SIZE)?;
    Ok(AltSettingIdxs {
        interface_idx: buf.get_u64_le(),
        alt_setting_idx: buf.get_u64_le(),
    })
}

pub fn encode_alt_setting(idxs: &AltSettingIdxs) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(AltSettingIdxs::SIZE);
    buf.put_u64_le(idxs.interface_idx);
    buf.put_u64_le(idxs.alt_setting_idx);
    buf.to_vec()
}

/// Decode a packed array of u64 values (isochronous packet sizes)
///
/// Trailing bytes that do not form a whole element are ignored.
pub fn decode_u64_array(mut buf: &[u8]) -> Vec<u64> {
    let mut values = Vec::with_capacity(buf.len() / 8);
    while buf.remaining() >= 8 {
        values.push(buf.get_u64_le());
    }
    values
}

pub fn encode_u64_array(values: &[u64]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(values.len() * 8);
    for value in values {
        buf.put_u64_le(*value);
    }
    buf.to_vec()
}

pub fn encode_iso_result(result: &IsoTransferResult) -> [u8; IsoTransferResult::SIZE] {
    let mut out = [0u8; IsoTransferResult::SIZE];
    let mut buf = &mut out[..];
    buf.put_u64_le(result.actual_length);
    buf.put_u64_le(result.transfer_result);
    out
}

/// Decode a packed array of isochronous result records
pub fn decode_iso_results(mut buf: &[u8]) -> Vec<IsoTransferResult> {
    let mut results = Vec::with_capacity(buf.len() / IsoTransferResult::SIZE);
    while buf.remaining() >= IsoTransferResult::SIZE {
        results.push(IsoTransferResult {
            actual_length: buf.get_u64_le(),
            transfer_result: buf.get_u64_le(),
        });
    }
    results
}

/// Decode the 8-byte transferred count written to a request's output
pub fn decode_bytes_transferred(buf: &[u8]) -> Result<u64> {
    decode_u64(buf)
}

fn descriptor_type(buf: &mut &[u8], expected: u8) -> Result<()> {
    let _length = buf.get_u8();
    let found = buf.get_u8();
    if found != expected {
        return Err(ProtocolError::UnexpectedDescriptorType { expected, found });
    }
    Ok(())
}

pub fn decode_device_descriptor(mut buf: &[u8]) -> Result<DeviceDescriptor> {
    ensure_len(buf, DeviceDescriptor::SIZE)?;
    descriptor_type(&mut buf, DeviceDescriptor::DESCRIPTOR_TYPE)?;
    Ok(DeviceDescriptor {
        usb_version: buf.get_u16_le(),
        class: buf.get_u8(),
        subclass: buf.get_u8(),
        protocol: buf.get_u8(),
        max_packet_size0: buf.get_u8(),
        vendor_id: buf.get_u16_le(),
        product_id: buf.get_u16_le(),
        device_version: buf.get_u16_le(),
        manufacturer_index: buf.get_u8(),
        product_index: buf.get_u8(),
        serial_number_index: buf.get_u8(),
        num_configurations: buf.get_u8(),
    })
}

pub fn encode_device_descriptor(descriptor: &DeviceDescriptor) -> [u8; DeviceDescriptor::SIZE] {
    let mut out = [0u8; DeviceDescriptor::SIZE];
    let mut buf = &mut out[..];
    buf.put_u8(DeviceDescriptor::SIZE as u8);
    buf.put_u8(DeviceDescriptor::DESCRIPTOR_TYPE);
    buf.put_u16_le(descriptor.usb_version);
    buf.put_u8(descriptor.class);
    buf.put_u8(descriptor.subclass);
    buf.put_u8(descriptor.protocol);
    buf.put_u8(descriptor.max_packet_size0);
    buf.put_u16_le(descriptor.vendor_id);
    buf.put_u16_le(descriptor.product_id);
    buf.put_u16_le(descriptor.device_version);
    buf.put_u8(descriptor.manufacturer_index);
    buf.put_u8(descriptor.product_index);
    buf.put_u8(descriptor.serial_number_index);
    buf.put_u8(descriptor.num_configurations);
    out
}

/// Decode the header at the start of a configuration descriptor
///
/// Only the header is checked; `total_length` is reported as read, zero
/// included.
pub fn decode_config_descriptor_header(mut buf: &[u8]) -> Result<ConfigDescriptorHeader> {
    ensure_len(buf, ConfigDescriptorHeader::SIZE)?;
    descriptor_type(&mut buf, ConfigDescriptorHeader::DESCRIPTOR_TYPE)?;
    Ok(ConfigDescriptorHeader {
        total_length: buf.get_u16_le(),
        num_interfaces: buf.get_u8(),
        configuration_value: buf.get_u8(),
        string_index: buf.get_u8(),
        attributes: buf.get_u8(),
        max_power: buf.get_u8(),
    })
}

pub fn encode_config_descriptor_header(
    header: &ConfigDescriptorHeader,
) -> [u8; ConfigDescriptorHeader::SIZE] {
    let mut out = [0u8; ConfigDescriptorHeader::SIZE];
    let mut buf = &mut out[..];
    buf.put_u8(ConfigDescriptorHeader::SIZE as u8);
    buf.put_u8(ConfigDescriptorHeader::DESCRIPTOR_TYPE);
    buf.put_u16_le(header.total_length);
    buf.put_u8(header.num_interfaces);
    buf.put_u8(header.configuration_value);
    buf.put_u8(header.string_index);
    buf.put_u8(header.attributes);
    buf.put_u8(header.max_power);
    out
}
