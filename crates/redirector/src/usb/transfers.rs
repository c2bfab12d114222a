//! USB transfer execution
//!
//! Executes the URBs the redirector submits against a rusb device handle.
//! Data moves straight between the requester's locked buffer and the device;
//! rusb errors are mapped to the status taxonomy the redirector completes
//! requests with.

use common::{CompletionParams, IsochronousUrb, LockedBuffer, PipeInfo, Urb, UsbCompletion};
use protocol::{Direction, PipeType, SetupPacket, UsbError, UsbResult, UsbdStatus};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Execute `urb` and build its completion parameters
pub fn execute(handle: &DeviceHandle<Context>, urb: Urb, timeout: Duration) -> CompletionParams {
    match urb {
        Urb::Pipe {
            pipe,
            direction,
            buffer,
        } => {
            let result = execute_pipe_transfer(handle, &pipe, direction, &buffer, timeout);
            let usb = match direction {
                Direction::In => UsbCompletion::PipeRead {
                    length: *result.as_ref().unwrap_or(&0),
                },
                Direction::Out => UsbCompletion::PipeWrite {
                    length: *result.as_ref().unwrap_or(&0),
                },
            };
            finish(result, usb)
        }
        Urb::Control {
            setup,
            buffer,
            offset,
        } => {
            let result = execute_control_transfer(handle, &setup, buffer.as_ref(), offset, timeout);
            let usb = UsbCompletion::ControlTransfer {
                length: *result.as_ref().unwrap_or(&0),
            };
            finish(result, usb)
        }
        Urb::Isochronous(iso) => execute_isochronous_transfer(iso),
    }
}

fn finish(result: UsbResult<usize>, usb: UsbCompletion) -> CompletionParams {
    match result {
        Ok(_) => CompletionParams::new(Ok(()), UsbdStatus::SUCCESS, usb),
        Err(e) => CompletionParams::new(Err(e), usbd_status_for(e), usb),
    }
}

/// Bulk or interrupt transfer on a configured pipe
fn execute_pipe_transfer(
    handle: &DeviceHandle<Context>,
    pipe: &PipeInfo,
    direction: Direction,
    buffer: &LockedBuffer,
    timeout: Duration,
) -> UsbResult<usize> {
    let endpoint = pipe.endpoint_address;
    debug!(
        "{:?} {:?} transfer: endpoint={:#04x}, len={}",
        pipe.pipe_type,
        direction,
        endpoint,
        buffer.len()
    );

    let result = match (pipe.pipe_type, direction) {
        (PipeType::Bulk, Direction::In) => read_into(buffer, 0, |data| {
            handle.read_bulk(endpoint, data, timeout)
        }),
        (PipeType::Interrupt, Direction::In) => read_into(buffer, 0, |data| {
            handle.read_interrupt(endpoint, data, timeout)
        }),
        (PipeType::Bulk, Direction::Out) => {
            let data = buffer.to_vec();
            handle
                .write_bulk(endpoint, &data, timeout)
                .map_err(map_rusb_error)
        }
        (PipeType::Interrupt, Direction::Out) => {
            let data = buffer.to_vec();
            handle
                .write_interrupt(endpoint, &data, timeout)
                .map_err(map_rusb_error)
        }
        (pipe_type, _) => {
            warn!(
                "Pipe URB on {:?} endpoint {:#04x} not executable here",
                pipe_type, endpoint
            );
            Err(UsbError::InvalidDeviceRequest)
        }
    };

    match &result {
        Ok(len) => debug!("Transfer on {:#04x} moved {} bytes", endpoint, len),
        Err(e) => warn!("Transfer on {:#04x} failed: {}", endpoint, e),
    }
    result
}

/// Control transfer on the default endpoint
///
/// The data stage starts `offset` bytes into `buffer`.
fn execute_control_transfer(
    handle: &DeviceHandle<Context>,
    setup: &SetupPacket,
    buffer: Option<&LockedBuffer>,
    offset: usize,
    timeout: Duration,
) -> UsbResult<usize> {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}",
        setup.request_type, setup.request, setup.value, setup.index
    );

    let available = buffer.map_or(0, |b| b.len().saturating_sub(offset));
    let length = available.min(usize::from(setup.length));

    let result = match (setup.direction(), buffer) {
        (Direction::In, Some(buffer)) if length > 0 => {
            read_into_range(buffer, offset, length, |data| {
                handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                )
            })
        }
        (Direction::In, _) => handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut [],
                timeout,
            )
            .map_err(map_rusb_error),
        (Direction::Out, buffer) => {
            let data = match buffer {
                Some(buffer) => buffer.read_at(offset, length)?,
                None => Vec::new(),
            };
            handle
                .write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &data,
                    timeout,
                )
                .map_err(map_rusb_error)
        }
    };

    if let Err(e) = &result {
        warn!("Control transfer failed: {}", e);
    }
    result
}

/// rusb exposes no synchronous isochronous API
fn execute_isochronous_transfer(mut iso: IsochronousUrb) -> CompletionParams {
    warn!(
        "Isochronous transfer on {:#04x} not supported by this bus",
        iso.endpoint_address
    );
    iso.header_status = UsbdStatus::REQUEST_FAILED;
    CompletionParams::new(
        Err(UsbError::NotSupported),
        UsbdStatus::REQUEST_FAILED,
        UsbCompletion::PipeUrb(iso),
    )
}

fn read_into<F>(buffer: &LockedBuffer, offset: usize, read: F) -> UsbResult<usize>
where
    F: FnOnce(&mut [u8]) -> rusb::Result<usize>,
{
    read_into_range(buffer, offset, buffer.len().saturating_sub(offset), read)
}

/// Read from the device into a scratch buffer, then store what arrived
fn read_into_range<F>(buffer: &LockedBuffer, offset: usize, len: usize, read: F) -> UsbResult<usize>
where
    F: FnOnce(&mut [u8]) -> rusb::Result<usize>,
{
    let mut data = vec![0u8; len];
    let received = read(&mut data).map_err(map_rusb_error)?;
    buffer.write_at(offset, &data[..received])?;
    Ok(received)
}

/// Map rusb::Error to the redirector's status taxonomy
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Stall,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParameter,
        rusb::Error::Access => UsbError::AccessDenied,
        rusb::Error::NotSupported => UsbError::NotSupported,
        rusb::Error::NoMem => UsbError::InsufficientResources,
        rusb::Error::Interrupted => UsbError::Cancelled,
        _ => UsbError::Unsuccessful,
    }
}

/// Host controller status reported alongside a failed transfer
pub fn usbd_status_for(err: UsbError) -> UsbdStatus {
    match err {
        UsbError::Stall => UsbdStatus::STALL_PID,
        UsbError::Overflow => UsbdStatus::DATA_OVERRUN,
        UsbError::NoDevice | UsbError::Timeout => UsbdStatus::DEV_NOT_RESPONDING,
        _ => UsbdStatus::REQUEST_FAILED,
    }
}
