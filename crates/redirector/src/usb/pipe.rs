//! Configured USB pipe
//!
//! Pipes are snapshots of one generation of an interface's pipe set. They
//! carry no lock of their own; a pipe taken from an older generation still
//! addresses the same endpoint but is never handed out again.

use crate::request::{CompletionRoutine, InFlight, Request};
use common::{IsochronousUrb, LockedBuffer, PipeInfo, Urb, UsbBus};
use protocol::{Direction, PipeType, UsbError, UsbResult, UsbStatus};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbPipe {
    info: PipeInfo,
    interface: u8,
    generation: u64,
}

impl UsbPipe {
    /// Bind to configured pipe `index` of `interface`
    ///
    /// Transfers on the pipe may carry any length, so the lower stack's
    /// max-packet-size validation is switched off for the endpoint.
    pub fn create(bus: &dyn UsbBus, interface: u8, index: u8, generation: u64) -> UsbResult<Self> {
        let info = bus.configured_pipe(interface, index)?;
        bus.disable_max_packet_size_check(info.endpoint_address);
        Ok(Self {
            info,
            interface,
            generation,
        })
    }

    pub fn info(&self) -> PipeInfo {
        self.info
    }

    pub fn endpoint_address(&self) -> u8 {
        self.info.endpoint_address
    }

    pub fn pipe_type(&self) -> PipeType {
        self.info.pipe_type
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn format(&self, direction: Direction, isochronous: bool) -> UsbStatus {
        if self.info.direction() != direction {
            warn!(
                "Endpoint {:#04x} cannot carry {:?} transfers",
                self.info.endpoint_address, direction
            );
            return Err(UsbError::InvalidDeviceRequest);
        }
        if (self.info.pipe_type == PipeType::Isochronous) != isochronous {
            warn!(
                "Endpoint {:#04x} is {:?}, isochronous transfer requested: {}",
                self.info.endpoint_address, self.info.pipe_type, isochronous
            );
            return Err(UsbError::InvalidDeviceRequest);
        }
        Ok(())
    }

    pub fn read_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        buffer: LockedBuffer,
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        self.transfer_async(bus, request, Direction::In, buffer, completion)
    }

    pub fn write_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        buffer: LockedBuffer,
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        self.transfer_async(bus, request, Direction::Out, buffer, completion)
    }

    fn transfer_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        direction: Direction,
        buffer: LockedBuffer,
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        if let Err(status) = self.format(direction, false) {
            request.complete(Err(status));
            return None;
        }

        debug!(
            "Submitting {} bytes on endpoint {:#04x} (request {})",
            buffer.len(),
            self.info.endpoint_address,
            request.id()
        );
        let urb = Urb::Pipe {
            pipe: self.info,
            direction,
            buffer,
        };
        submit(bus, request, urb, completion)
    }

    pub fn read_isochronous_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        self.isochronous_async(bus, request, Direction::In, buffer, packet_sizes, completion)
    }

    pub fn write_isochronous_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        self.isochronous_async(bus, request, Direction::Out, buffer, packet_sizes, completion)
    }

    fn isochronous_async(
        &self,
        bus: &dyn UsbBus,
        request: Request,
        direction: Direction,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
        completion: CompletionRoutine,
    ) -> Option<InFlight> {
        let urb = self.format(direction, true).and_then(|()| {
            IsochronousUrb::new(self.info.endpoint_address, direction, buffer, packet_sizes)
        });
        match urb {
            Ok(urb) => submit(bus, request, Urb::Isochronous(urb), completion),
            Err(status) => {
                warn!(
                    "Cannot build isochronous transfer of {} packets on {:#04x}: {}",
                    packet_sizes.len(),
                    self.info.endpoint_address,
                    status
                );
                request.complete(Err(status));
                None
            }
        }
    }

    /// Abort outstanding transfers, blocking until the lower stack answers
    pub fn abort(&self, bus: &dyn UsbBus) -> UsbStatus {
        bus.abort_pipe(self.info.endpoint_address).inspect_err(|e| {
            warn!("Abort of pipe {:#04x} failed: {}", self.info.endpoint_address, e)
        })
    }

    /// Clear a halt on the pipe, blocking until the lower stack answers
    pub fn reset(&self, bus: &dyn UsbBus) -> UsbStatus {
        bus.reset_pipe(self.info.endpoint_address).inspect_err(|e| {
            warn!("Reset of pipe {:#04x} failed: {}", self.info.endpoint_address, e)
        })
    }
}

fn submit(
    bus: &dyn UsbBus,
    request: Request,
    urb: Urb,
    completion: CompletionRoutine,
) -> Option<InFlight> {
    match request.send_with_completion(bus, urb, completion) {
        Ok(in_flight) => Some(in_flight),
        Err(rejected) => {
            warn!(
                "Lower stack refused request {}: {}",
                rejected.request.id(),
                rejected.status
            );
            rejected.complete();
            None
        }
    }
}
