//! Plug-and-Play value types
//!
//! Minor function codes, bus query ID types, the device capability record
//! and registry property identifiers used by identity and capability queries.

use serde::{Deserialize, Serialize};

/// PnP minor function codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PnpMinorFunction {
    StartDevice = 0x00,
    QueryRemoveDevice = 0x01,
    RemoveDevice = 0x02,
    CancelRemoveDevice = 0x03,
    StopDevice = 0x04,
    QueryStopDevice = 0x05,
    CancelStopDevice = 0x06,
    QueryDeviceRelations = 0x07,
    QueryInterface = 0x08,
    QueryCapabilities = 0x09,
    QueryDeviceText = 0x0C,
    QueryId = 0x13,
    QueryPnpDeviceState = 0x14,
    QueryBusInformation = 0x15,
    SurpriseRemoval = 0x17,
}

/// ID type requested by `QUERY_ID`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusQueryIdType {
    DeviceId = 0,
    HardwareIds = 1,
    CompatibleIds = 2,
    InstanceId = 3,
    DeviceSerialNumber = 4,
    ContainerId = 5,
}

impl BusQueryIdType {
    /// Hardware and compatible IDs are double-NUL-terminated lists
    pub fn is_multi_sz(&self) -> bool {
        matches!(
            self,
            BusQueryIdType::HardwareIds | BusQueryIdType::CompatibleIds
        )
    }
}

/// Device capability record returned by `QUERY_CAPABILITIES`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub lock_supported: bool,
    pub eject_supported: bool,
    pub removable: bool,
    pub dock_device: bool,
    pub unique_id: bool,
    pub silent_install: bool,
    pub raw_device_ok: bool,
    pub surprise_removal_ok: bool,
    pub no_display_in_ui: bool,
    /// Bus-relative address, `u32::MAX` when unknown
    pub address: u32,
    /// Number displayed to the user (port number), `u32::MAX` when unknown
    pub ui_number: u32,
}

impl DeviceCapabilities {
    pub const NO_ADDRESS: u32 = u32::MAX;
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            lock_supported: false,
            eject_supported: false,
            removable: false,
            dock_device: false,
            unique_id: false,
            silent_install: false,
            raw_device_ok: false,
            surprise_removal_ok: false,
            no_display_in_ui: false,
            address: Self::NO_ADDRESS,
            ui_number: Self::NO_ADDRESS,
        }
    }
}

/// Registry-backed device properties readable through the accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRegistryProperty {
    DeviceDescription,
    HardwareId,
    CompatibleIds,
    Manufacturer,
    LocationInformation,
    PhysicalDeviceObjectName,
    Address,
}
