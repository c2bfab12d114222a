//! USB target: the configured device and its interfaces
//!
//! Transfers are dispatched by endpoint address. The first interface whose
//! current pipe set holds the endpoint wins; an endpoint nobody holds fails
//! the request with `NotFound`.
//!
//! The device descriptor is read once at creation and served from there.
//! Configuration descriptors are read from the device on every call.

use crate::request::{CompletionRoutine, InFlight, Rejected, Request};
use crate::usb::interface::UsbInterface;
use crate::usb::pipe::UsbPipe;
use common::{LockedBuffer, Urb, UsbBus};
use protocol::{
    DeviceDescriptor, SetupPacket, UsbError, UsbResult, UsbSpeed, UsbStatus,
    decode_config_descriptor_header,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Read configuration descriptor `index`, trimmed to its total length
///
/// A descriptor reporting a zero total length, or shorter than the length
/// it reports, is rejected with `InvalidConfigurationDescriptor`.
fn read_configuration_descriptor(bus: &dyn UsbBus, index: u8) -> UsbResult<Vec<u8>> {
    let mut raw = bus.configuration_descriptor(index).inspect_err(|e| {
        error!("Failed to read configuration descriptor {}: {}", index, e)
    })?;

    let header = decode_config_descriptor_header(&raw).map_err(|e| {
        error!("Bad configuration descriptor {}: {}", index, e);
        UsbError::InvalidConfigurationDescriptor
    })?;
    let total_length = usize::from(header.total_length);
    if total_length == 0 {
        error!("Configuration descriptor {} of unknown size", index);
        return Err(UsbError::InvalidConfigurationDescriptor);
    }
    if raw.len() < total_length {
        error!(
            "Configuration descriptor {} truncated: {} of {} bytes",
            index,
            raw.len(),
            total_length
        );
        return Err(UsbError::InvalidConfigurationDescriptor);
    }

    raw.truncate(total_length);
    Ok(raw)
}

pub struct UsbTarget {
    bus: Arc<dyn UsbBus>,
    descriptor: DeviceDescriptor,
    interfaces: Vec<UsbInterface>,
}

impl UsbTarget {
    /// Select the device configuration and bind every interface
    ///
    /// The first configuration descriptor must be valid before anything is
    /// selected.
    pub fn create(bus: Arc<dyn UsbBus>) -> UsbResult<Self> {
        let descriptor = bus
            .device_descriptor()
            .inspect_err(|e| error!("Failed to read device descriptor: {}", e))?;
        read_configuration_descriptor(&*bus, 0)?;

        let count = bus
            .select_configuration()
            .inspect_err(|e| error!("Failed to select configuration: {}", e))?;
        if count == 0 {
            error!("Configuration has no interfaces");
            return Err(UsbError::InvalidDeviceState);
        }

        let mut interfaces = Vec::new();
        if interfaces.try_reserve_exact(usize::from(count)).is_err() {
            error!("Cannot allocate {} interfaces", count);
            return Err(UsbError::InsufficientResources);
        }
        for number in 0..count {
            interfaces.push(UsbInterface::create(Arc::clone(&bus), number)?);
        }

        info!(
            "USB target {:04x}:{:04x} configured with {} interfaces ({:?} speed)",
            descriptor.vendor_id,
            descriptor.product_id,
            count,
            bus.speed()
        );
        Ok(Self {
            bus,
            descriptor,
            interfaces,
        })
    }

    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn speed(&self) -> UsbSpeed {
        self.bus.speed()
    }

    pub fn configuration_descriptor(&self, index: u8) -> UsbResult<Vec<u8>> {
        read_configuration_descriptor(&*self.bus, index)
    }

    /// Cycle the device's port
    ///
    /// The device drops off the bus and comes back; pipe sets are left as
    /// they are.
    pub fn cycle_port(&self) -> UsbStatus {
        self.bus
            .cycle_port()
            .inspect_err(|e| error!("Port cycle failed: {}", e))
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn interface(&self, number: usize) -> Option<&UsbInterface> {
        self.interfaces.get(number)
    }

    fn find_pipe(&self, endpoint_address: u8) -> Option<UsbPipe> {
        self.interfaces
            .iter()
            .find_map(|interface| interface.find_pipe_by_endpoint_address(endpoint_address))
    }

    fn pipe_or_complete(&self, request: Request, endpoint_address: u8) -> Option<(UsbPipe, Request)> {
        match self.find_pipe(endpoint_address) {
            Some(pipe) => Some((pipe, request)),
            None => {
                warn!(
                    "No pipe for endpoint {:#04x} (request {})",
                    endpoint_address,
                    request.id()
                );
                request.complete(Err(UsbError::NotFound));
                None
            }
        }
    }

    pub fn read_pipe_async(
        &self,
        request: Request,
        endpoint_address: u8,
        buffer: LockedBuffer,
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        let (pipe, request) = self.pipe_or_complete(request, endpoint_address)?;
        pipe.read_async(&*self.bus, request, buffer, completion)
    }

    pub fn write_pipe_async(
        &self,
        request: Request,
        endpoint_address: u8,
        buffer: LockedBuffer,
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        let (pipe, request) = self.pipe_or_complete(request, endpoint_address)?;
        pipe.write_async(&*self.bus, request, buffer, completion)
    }

    pub fn read_isochronous_pipe_async(
        &self,
        request: Request,
        endpoint_address: u8,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        let (pipe, request) = self.pipe_or_complete(request, endpoint_address)?;
        pipe.read_isochronous_async(&*self.bus, request, buffer, packet_sizes, completion)
    }

    pub fn write_isochronous_pipe_async(
        &self,
        request: Request,
        endpoint_address: u8,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        let (pipe, request) = self.pipe_or_complete(request, endpoint_address)?;
        pipe.write_isochronous_async(&*self.bus, request, buffer, packet_sizes, completion)
    }

    pub fn abort_pipe(&self, endpoint_address: u8) -> UsbStatus {
        self.find_pipe(endpoint_address)
            .ok_or(UsbError::NotFound)?
            .abort(&*self.bus)
    }

    pub fn reset_pipe(&self, endpoint_address: u8) -> UsbStatus {
        self.find_pipe(endpoint_address)
            .ok_or(UsbError::NotFound)?
            .reset(&*self.bus)
    }

    pub fn set_interface_alt_setting(&self, interface: u64, alt_setting: u64) -> UsbStatus {
        let interface = usize::try_from(interface)
            .ok()
            .and_then(|index| self.interfaces.get(index));
        let (Some(interface), Ok(alt_setting)) = (interface, u8::try_from(alt_setting)) else {
            warn!(
                "Alt-setting selection out of range ({} interfaces)",
                self.interfaces.len()
            );
            return Err(UsbError::InvalidParameter);
        };
        interface.set_alt_setting(alt_setting)
    }

    /// Reset every interface, reporting the last failure
    pub fn reset_device(&self) -> UsbStatus {
        let mut result = Ok(());
        for interface in &self.interfaces {
            if let Err(e) = interface.reset() {
                result = Err(e);
            }
        }
        result
    }

    /// Send a control transfer on the default pipe
    ///
    /// The data stage starts `offset` bytes into `data`. On success the
    /// request belongs to `completion`; otherwise it comes back with the
    /// status.
    pub fn control_transfer_async(
        &self,
        request: Request,
        setup: SetupPacket,
        data: Option<LockedBuffer>,
        offset: usize,
        completion: CompletionRoutine,
    ) -> Result<InFlight, Rejected> {
        let available = data.as_ref().map_or(0, LockedBuffer::len);
        if offset > available {
            return Err(Rejected {
                request,
                status: UsbError::InvalidParameter,
            });
        }

        debug!(
            "Control transfer {:#04x}/{:#04x} with {} data bytes (request {})",
            setup.request_type,
            setup.request,
            available - offset,
            request.id()
        );
        let urb = Urb::Control {
            setup,
            buffer: data,
            offset,
        };
        request.send_with_completion(&*self.bus, urb, completion)
    }
}
