//! Device identities
//!
//! The redirector answers bus queries with a fixed synthetic identity so the
//! node is picked up by the generic redirector driver instead of whatever
//! class driver the real hardware would load.

use protocol::wide::{to_wide_multi_sz, to_wide_sz};
use protocol::{BusQueryIdType, DeviceCapabilities, DeviceIdKey};
use serde::Serialize;

/// Prefix of every redirector instance ID
pub const DRIVER_NAME: &str = "UsbRedir";

pub const REDIRECTOR_DEVICE_ID: &str = "USB\\Vid_2B23&Pid_CAFE&Rev_0001";

pub const REDIRECTOR_HARDWARE_IDS: [&str; 2] =
    ["USB\\Vid_2B23&Pid_CAFE&Rev_0001", "USB\\Vid_2B23&Pid_CAFE"];

pub const REDIRECTOR_COMPATIBLE_IDS: [&str; 3] = [
    "USB\\Class_FF&SubClass_FF&Prot_FF",
    "USB\\Class_FF&SubClass_FF",
    "USB\\Class_FF",
];

/// Instance ID of the redirector owned by filter instance `instance_number`
pub fn instance_id(instance_number: u32) -> String {
    format!("{}{}", DRIVER_NAME, instance_number)
}

/// Synthetic answer to a `QUERY_ID`, or `None` for ID types left untouched
pub fn synthetic_id(id_type: BusQueryIdType, instance_number: u32) -> Option<Vec<u16>> {
    match id_type {
        BusQueryIdType::DeviceId => Some(to_wide_sz(REDIRECTOR_DEVICE_ID)),
        BusQueryIdType::HardwareIds => Some(to_wide_multi_sz(&REDIRECTOR_HARDWARE_IDS)),
        BusQueryIdType::CompatibleIds => Some(to_wide_multi_sz(&REDIRECTOR_COMPATIBLE_IDS)),
        BusQueryIdType::InstanceId => Some(to_wide_sz(&instance_id(instance_number))),
        BusQueryIdType::DeviceSerialNumber | BusQueryIdType::ContainerId => None,
    }
}

/// Force the capability flags of a redirector node
///
/// The node is raw-capable, hidden, never removable or ejectable, and
/// installs without prompting.
pub fn patch_capabilities(caps: &mut DeviceCapabilities) {
    caps.raw_device_ok = true;
    caps.no_display_in_ui = true;
    caps.removable = false;
    caps.eject_supported = false;
    caps.silent_install = true;
}

/// Identity of the real device, read once when the filter attaches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub instance_id: String,
    pub hardware_ids: Vec<String>,
    pub compatible_ids: Vec<String>,
}

impl DeviceIdentity {
    /// Key the control plane tracks the redirect under
    pub fn key(&self) -> DeviceIdKey {
        DeviceIdKey::new(self.device_id.clone(), self.instance_id.clone())
    }
}
