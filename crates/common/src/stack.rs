//! Lower device stack seen by the filter
//!
//! The redirector sits on top of two collaborators: the USB bus stack that
//! actually executes transfers and the PnP device object that answers
//! identity, capability and property queries. Both are reached only through
//! the traits below, so the filter runs unchanged over real hardware or a
//! mock.

use crate::urb::{CompletionParams, PipeInfo, Urb};
use protocol::{
    BusQueryIdType, DeviceCapabilities, DeviceDescriptor, DeviceRegistryProperty,
    PnpMinorFunction, UsbError, UsbResult, UsbSpeed, UsbStatus,
};
use tokio::sync::oneshot;

/// USB bus stack beneath the filter
///
/// Every method except [`UsbBus::submit`] may block until the lower stack
/// answers and must not be called from an async task directly.
pub trait UsbBus: Send + Sync {
    /// Device descriptor as the bus stack cached it at enumeration
    fn device_descriptor(&self) -> UsbResult<DeviceDescriptor>;

    /// Read configuration descriptor `index` with everything it contains
    ///
    /// The returned bytes are whatever the device answered, unvalidated.
    fn configuration_descriptor(&self, index: u8) -> UsbResult<Vec<u8>>;

    fn speed(&self) -> UsbSpeed;

    /// Cycle the port the device hangs off, making it re-enumerate
    fn cycle_port(&self) -> UsbStatus;

    /// Select the device configuration with all of its interfaces
    ///
    /// Returns the number of configured interfaces.
    fn select_configuration(&self) -> UsbResult<u8>;

    /// Select `alt_setting` on interface `interface`
    fn select_setting(&self, interface: u8, alt_setting: u8) -> UsbStatus;

    /// Number of pipes configured on `interface` for its current setting
    fn num_configured_pipes(&self, interface: u8) -> u8;

    /// Configured pipe `index` of `interface`
    fn configured_pipe(&self, interface: u8, index: u8) -> UsbResult<PipeInfo>;

    /// Let transfers on `endpoint` carry any size, not just multiples of
    /// the maximum packet size
    fn disable_max_packet_size_check(&self, endpoint: u8);

    fn abort_pipe(&self, endpoint: u8) -> UsbStatus;

    fn reset_pipe(&self, endpoint: u8) -> UsbStatus;

    /// Queue `urb` without waiting for it to execute
    ///
    /// The receiver resolves once with the completion parameters. A dropped
    /// sender means the transfer was cancelled below the filter.
    fn submit(&self, urb: Urb) -> UsbResult<oneshot::Receiver<CompletionParams>>;
}

/// Payload a PnP request carries back up the stack
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PnpInformation {
    #[default]
    None,
    /// NUL or double-NUL terminated UTF-16 ID string
    Id(Vec<u16>),
    Capabilities(DeviceCapabilities),
}

/// A PnP request travelling down to the lower device and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnpIrp {
    pub minor: PnpMinorFunction,
    /// Requested ID type for `QUERY_ID`
    pub id_type: Option<BusQueryIdType>,
    pub status: UsbStatus,
    pub information: PnpInformation,
}

impl PnpIrp {
    /// A fresh request, not yet handled by anyone
    pub fn new(minor: PnpMinorFunction) -> Self {
        Self {
            minor,
            id_type: None,
            status: Err(UsbError::NotSupported),
            information: PnpInformation::None,
        }
    }

    pub fn query_id(id_type: BusQueryIdType) -> Self {
        Self {
            id_type: Some(id_type),
            ..Self::new(PnpMinorFunction::QueryId)
        }
    }

    /// Capability query carrying an initialised capability record
    pub fn query_capabilities() -> Self {
        Self {
            information: PnpInformation::Capabilities(DeviceCapabilities::default()),
            ..Self::new(PnpMinorFunction::QueryCapabilities)
        }
    }

    /// Complete the request with a status and payload
    pub fn complete(&mut self, status: UsbStatus, information: PnpInformation) {
        self.status = status;
        self.information = information;
    }
}

/// PnP device object beneath the filter
pub trait PnpDevice: Send + Sync {
    /// Send `irp` down and wait for the lower device to complete it
    fn send_pnp(&self, irp: &mut PnpIrp);

    /// Read a registry property into `buffer`
    ///
    /// Returns the property size. When `buffer` is too small nothing is
    /// copied and `BufferTooSmall` carries the size needed.
    fn device_property(&self, property: DeviceRegistryProperty, buffer: &mut [u8])
    -> UsbResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_irp_is_unhandled() {
        let irp = PnpIrp::query_id(BusQueryIdType::HardwareIds);
        assert_eq!(irp.minor, PnpMinorFunction::QueryId);
        assert_eq!(irp.status, Err(UsbError::NotSupported));
        assert_eq!(irp.information, PnpInformation::None);
    }

    #[test]
    fn test_capability_query_carries_record() {
        let mut irp = PnpIrp::query_capabilities();
        assert!(matches!(
            irp.information,
            PnpInformation::Capabilities(caps) if caps.address == DeviceCapabilities::NO_ADDRESS
        ));

        irp.complete(Ok(()), PnpInformation::None);
        assert!(irp.status.is_ok());
    }
}
