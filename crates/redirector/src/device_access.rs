//! Device property, capability and bus ID queries
//!
//! Every query goes synchronously down to the lower PnP device. Results are
//! copied into buffers sized exactly to the value; a failed query yields
//! nothing rather than a partially filled result.

use crate::identity::DeviceIdentity;
use common::{PnpDevice, PnpInformation, PnpIrp};
use protocol::wide::{from_wide_multi_sz, from_wide_sz, multi_sz_len, sz_len};
use protocol::{BusQueryIdType, DeviceCapabilities, DeviceRegistryProperty, UsbError, UsbResult};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Accessor over the lower PnP device
#[derive(Clone)]
pub struct DeviceAccess {
    device: Arc<dyn PnpDevice>,
}

impl DeviceAccess {
    pub fn new(device: Arc<dyn PnpDevice>) -> Self {
        Self { device }
    }

    /// Read a registry property into a buffer of exactly its size
    ///
    /// An empty property is a valid zero-length result.
    pub fn device_property(&self, property: DeviceRegistryProperty) -> Option<Vec<u8>> {
        let needed = match self.device.device_property(property, &mut []) {
            Ok(_) => return Some(Vec::new()),
            Err(UsbError::BufferTooSmall { needed }) => needed,
            Err(e) => {
                warn!("Failed to query size of {:?}: {}", property, e);
                return None;
            }
        };

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(needed).is_err() {
            error!("Cannot allocate {} bytes for {:?}", needed, property);
            return None;
        }
        buffer.resize(needed, 0);

        match self.device.device_property(property, &mut buffer) {
            Ok(len) => {
                buffer.truncate(len);
                Some(buffer)
            }
            Err(e) => {
                warn!("Failed to read {:?}: {}", property, e);
                None
            }
        }
    }

    pub fn query_capabilities(&self) -> UsbResult<DeviceCapabilities> {
        let mut irp = PnpIrp::query_capabilities();
        self.device.send_pnp(&mut irp);

        if let Err(e) = irp.status {
            warn!("Capability query failed: {}", e);
            return Err(e);
        }
        match irp.information {
            PnpInformation::Capabilities(caps) => Ok(caps),
            _ => Err(UsbError::InvalidDeviceState),
        }
    }

    /// Query a bus ID and return a duplicate sized exactly to the string
    ///
    /// Hardware and compatible IDs are returned as double-NUL-terminated
    /// lists, the other types as a single NUL-terminated string.
    pub fn query_bus_id(&self, id_type: BusQueryIdType) -> Option<Vec<u16>> {
        let mut irp = PnpIrp::query_id(id_type);
        self.device.send_pnp(&mut irp);

        if let Err(e) = irp.status {
            debug!("{:?} query failed: {}", id_type, e);
            return None;
        }
        let PnpInformation::Id(raw) = irp.information else {
            warn!("{:?} query succeeded without an ID buffer", id_type);
            return None;
        };

        let len = if id_type.is_multi_sz() {
            multi_sz_len(&raw)
        } else {
            sz_len(&raw)
        };
        let len = match len {
            Ok(len) => len,
            Err(e) => {
                warn!("Malformed {:?} from lower device: {}", id_type, e);
                return None;
            }
        };

        let mut duplicate = Vec::new();
        if duplicate.try_reserve_exact(len).is_err() {
            error!("Cannot allocate {:?} duplicate", id_type);
            return None;
        }
        duplicate.extend_from_slice(&raw[..len]);
        Some(duplicate)
    }

    pub fn device_id(&self) -> Option<String> {
        self.query_string(BusQueryIdType::DeviceId)
    }

    pub fn instance_id(&self) -> Option<String> {
        self.query_string(BusQueryIdType::InstanceId)
    }

    pub fn hardware_ids(&self) -> Option<Vec<String>> {
        self.query_list(BusQueryIdType::HardwareIds)
    }

    pub fn compatible_ids(&self) -> Option<Vec<String>> {
        self.query_list(BusQueryIdType::CompatibleIds)
    }

    /// Bus address from the capability record
    pub fn address(&self) -> Option<u32> {
        self.query_capabilities()
            .ok()
            .map(|caps| caps.address)
            .filter(|&address| address != DeviceCapabilities::NO_ADDRESS)
    }

    /// Read the identity the redirect is registered under
    ///
    /// Device ID and instance ID are mandatory and must be non-empty.
    pub fn read_device_identity(&self) -> UsbResult<DeviceIdentity> {
        let device_id = self
            .device_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                error!("Lower device has no device ID");
                UsbError::InvalidDeviceState
            })?;
        let instance_id = self
            .instance_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                error!("Lower device {} has no instance ID", device_id);
                UsbError::InvalidDeviceState
            })?;

        Ok(DeviceIdentity {
            hardware_ids: self.hardware_ids().unwrap_or_default(),
            compatible_ids: self.compatible_ids().unwrap_or_default(),
            device_id,
            instance_id,
        })
    }

    fn query_string(&self, id_type: BusQueryIdType) -> Option<String> {
        let raw = self.query_bus_id(id_type)?;
        from_wide_sz(&raw)
            .map_err(|e| warn!("{:?} is not valid UTF-16: {}", id_type, e))
            .ok()
    }

    fn query_list(&self, id_type: BusQueryIdType) -> Option<Vec<String>> {
        let raw = self.query_bus_id(id_type)?;
        from_wide_multi_sz(&raw)
            .map_err(|e| warn!("{:?} is not valid UTF-16: {}", id_type, e))
            .ok()
    }
}
