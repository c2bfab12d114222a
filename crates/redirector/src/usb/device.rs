//! USB device abstraction
//!
//! [`UsbDevice`] wraps a rusb device and owns its handle while it is
//! redirected. [`RusbPnpDevice`] answers identity, capability and property
//! queries for it the way the bus driver would, from the descriptors read
//! at attach time.

use crate::usb::transfers::map_rusb_error;
use common::{PnpDevice, PnpInformation, PnpIrp};
use protocol::wide::{to_wide_multi_sz, to_wide_sz};
use protocol::{
    BusQueryIdType, DeviceCapabilities, DeviceDescriptor, DeviceRegistryProperty,
    PnpMinorFunction, UsbError, UsbResult, UsbSpeed, UsbStatus,
};
use rusb::{Context, Device, DeviceHandle, Version};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Descriptor-level facts about a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    /// Hub port path from the root
    pub port_numbers: Vec<u8>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub revision: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub speed: UsbSpeed,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceSummary {
    /// `USB\VID_xxxx&PID_xxxx`
    pub fn device_id(&self) -> String {
        format!("USB\\VID_{:04X}&PID_{:04X}", self.vendor_id, self.product_id)
    }

    /// Serial number when the device has one, else its bus and port path
    pub fn instance_id(&self) -> String {
        match self.serial_number.as_deref().filter(|s| valid_instance_id(s)) {
            Some(serial) => serial.to_string(),
            None => {
                let path: Vec<String> = self.port_numbers.iter().map(u8::to_string).collect();
                format!("{}&{}", self.bus_number, path.join("."))
            }
        }
    }

    /// Most specific first
    pub fn hardware_ids(&self) -> Vec<String> {
        let device_id = self.device_id();
        vec![
            format!("{}&REV_{:04X}", device_id, self.revision),
            device_id,
        ]
    }

    pub fn compatible_ids(&self) -> Vec<String> {
        vec![
            format!(
                "USB\\Class_{:02X}&SubClass_{:02X}&Prot_{:02X}",
                self.class, self.subclass, self.protocol
            ),
            format!("USB\\Class_{:02X}&SubClass_{:02X}", self.class, self.subclass),
            format!("USB\\Class_{:02X}", self.class),
        ]
    }

    pub fn is_root_hub(&self) -> bool {
        self.vendor_id == 0x1d6b && self.class == 9
    }
}

/// Serial numbers with separators or control characters cannot serve as
/// instance IDs
fn valid_instance_id(serial: &str) -> bool {
    !serial.is_empty()
        && serial
            .chars()
            .all(|c| c.is_ascii_graphic() && c != ',' && c != '\\')
}

/// BCD field rebuilt from rusb's decoded version
fn bcd(version: Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

pub fn map_device_speed(speed: rusb::Speed) -> UsbSpeed {
    match speed {
        rusb::Speed::Low => UsbSpeed::Low,
        rusb::Speed::Full => UsbSpeed::Full,
        rusb::Speed::High => UsbSpeed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => UsbSpeed::Super,
        _ => UsbSpeed::NoSpeed,
    }
}

/// USB device wrapper owning the handle while the device is redirected
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: rusb::DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    claimed_interfaces: Vec<u8>,
}

impl UsbDevice {
    pub fn new(device: Device<Context>) -> UsbResult<Self> {
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

        Ok(Self {
            device,
            descriptor,
            handle: None,
            claimed_interfaces: Vec::new(),
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    pub fn device(&self) -> &Device<Context> {
        &self.device
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        let d = &self.descriptor;
        DeviceDescriptor {
            usb_version: bcd(d.usb_version()),
            class: d.class_code(),
            subclass: d.sub_class_code(),
            protocol: d.protocol_code(),
            max_packet_size0: d.max_packet_size(),
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            device_version: bcd(d.device_version()),
            manufacturer_index: d.manufacturer_string_index().unwrap_or(0),
            product_index: d.product_string_index().unwrap_or(0),
            serial_number_index: d.serial_number_string_index().unwrap_or(0),
            num_configurations: d.num_configurations(),
        }
    }

    pub fn speed(&self) -> UsbSpeed {
        map_device_speed(self.device.speed())
    }

    /// Descriptor facts, with strings read when the device can be opened
    pub fn summary(&self) -> DeviceSummary {
        let mut class = self.descriptor.class_code();
        let mut subclass = self.descriptor.sub_class_code();
        let mut protocol = self.descriptor.protocol_code();

        // Class 0 defers to the interfaces
        if class == 0
            && let Some(first) = self.device.active_config_descriptor().ok().and_then(|config| {
                config
                    .interfaces()
                    .next()
                    .and_then(|interface| interface.descriptors().next())
                    .map(|d| (d.class_code(), d.sub_class_code(), d.protocol_code()))
            })
        {
            (class, subclass, protocol) = first;
        }

        let mut summary = DeviceSummary {
            bus_number: self.bus_number(),
            device_address: self.device_address(),
            port_numbers: self.device.port_numbers().unwrap_or_default(),
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            revision: bcd(self.descriptor.device_version()),
            class,
            subclass,
            protocol,
            speed: self.speed(),
            ..Default::default()
        };

        match &self.handle {
            Some(handle) => self.read_string_descriptors(handle, &mut summary),
            None => {
                if let Ok(handle) = self.device.open() {
                    self.read_string_descriptors(&handle, &mut summary);
                }
            }
        }
        summary
    }

    /// Open the device for redirection
    ///
    /// Kernel drivers are detached and every interface of the active
    /// configuration is claimed.
    pub fn open(&mut self) -> UsbStatus {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        debug!(
            "Opened device {:03}:{:03}",
            self.bus_number(),
            self.device_address()
        );

        let config = self.device.active_config_descriptor().map_err(|e| {
            warn!("Failed to get active config descriptor: {}", e);
            map_rusb_error(e)
        })?;

        for interface in config.interfaces() {
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                ),
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("Failed to claim interface {}: {}", number, e);
                self.handle = Some(handle);
                self.close();
                return Err(map_rusb_error(e));
            }
            debug!("Claimed interface {}", number);
            self.claimed_interfaces.push(number);
        }

        self.handle = Some(handle);
        Ok(())
    }

    /// Release claimed interfaces and give them back to the kernel
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        for &interface in &self.claimed_interfaces {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        self.claimed_interfaces.clear();
        debug!(
            "Closed device {:03}:{:03}",
            self.bus_number(),
            self.device_address()
        );
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&DeviceHandle<Context>> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut DeviceHandle<Context>> {
        self.handle.as_mut()
    }

    fn read_string_descriptors(&self, handle: &DeviceHandle<Context>, summary: &mut DeviceSummary) {
        let read = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };
        summary.manufacturer = read(self.descriptor.manufacturer_string_index());
        summary.product = read(self.descriptor.product_string_index());
        summary.serial_number = read(self.descriptor.serial_number_string_index());
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// PnP view of a rusb device, answered from its descriptors
pub struct RusbPnpDevice {
    ids: HashMap<BusQueryIdType, Vec<u16>>,
    capabilities: DeviceCapabilities,
    properties: HashMap<DeviceRegistryProperty, Vec<u8>>,
}

impl RusbPnpDevice {
    pub fn new(summary: &DeviceSummary) -> Self {
        let hardware_ids = summary.hardware_ids();
        let compatible_ids = summary.compatible_ids();

        let mut ids = HashMap::new();
        ids.insert(BusQueryIdType::DeviceId, to_wide_sz(&summary.device_id()));
        ids.insert(BusQueryIdType::InstanceId, to_wide_sz(&summary.instance_id()));
        ids.insert(BusQueryIdType::HardwareIds, to_wide_multi_sz(&hardware_ids));
        ids.insert(BusQueryIdType::CompatibleIds, to_wide_multi_sz(&compatible_ids));
        if let Some(serial) = &summary.serial_number {
            ids.insert(BusQueryIdType::DeviceSerialNumber, to_wide_sz(serial));
        }

        let port = summary.port_numbers.last().copied();
        let capabilities = DeviceCapabilities {
            removable: true,
            surprise_removal_ok: true,
            unique_id: summary.serial_number.is_some(),
            address: u32::from(summary.device_address),
            ui_number: port.map_or(DeviceCapabilities::NO_ADDRESS, u32::from),
            ..Default::default()
        };

        let mut properties = HashMap::new();
        if let Some(product) = &summary.product {
            properties.insert(DeviceRegistryProperty::DeviceDescription, wide_bytes(product));
        }
        if let Some(manufacturer) = &summary.manufacturer {
            properties.insert(DeviceRegistryProperty::Manufacturer, wide_bytes(manufacturer));
        }
        properties.insert(
            DeviceRegistryProperty::HardwareId,
            units_to_bytes(&to_wide_multi_sz(&hardware_ids)),
        );
        properties.insert(
            DeviceRegistryProperty::CompatibleIds,
            units_to_bytes(&to_wide_multi_sz(&compatible_ids)),
        );
        if let Some(port) = port {
            properties.insert(
                DeviceRegistryProperty::LocationInformation,
                wide_bytes(&format!(
                    "Port_#{:04}.Hub_#{:04}",
                    port, summary.bus_number
                )),
            );
        }
        properties.insert(
            DeviceRegistryProperty::Address,
            u32::from(summary.device_address).to_le_bytes().to_vec(),
        );

        Self {
            ids,
            capabilities,
            properties,
        }
    }
}

fn units_to_bytes(units: &[u16]) -> Vec<u8> {
    units.iter().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn wide_bytes(s: &str) -> Vec<u8> {
    units_to_bytes(&to_wide_sz(s))
}

impl PnpDevice for RusbPnpDevice {
    fn send_pnp(&self, irp: &mut PnpIrp) {
        match irp.minor {
            PnpMinorFunction::QueryId => match irp.id_type.and_then(|t| self.ids.get(&t)) {
                Some(id) => irp.complete(Ok(()), PnpInformation::Id(id.clone())),
                None => irp.complete(Err(UsbError::NotSupported), PnpInformation::None),
            },
            PnpMinorFunction::QueryCapabilities => {
                irp.complete(Ok(()), PnpInformation::Capabilities(self.capabilities))
            }
            _ => irp.status = Ok(()),
        }
    }

    fn device_property(
        &self,
        property: DeviceRegistryProperty,
        buffer: &mut [u8],
    ) -> UsbResult<usize> {
        let value = self.properties.get(&property).ok_or(UsbError::NotFound)?;
        if buffer.len() < value.len() {
            return Err(UsbError::BufferTooSmall {
                needed: value.len(),
            });
        }
        buffer[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::wide::{from_wide_multi_sz, from_wide_sz};

    fn receiver() -> DeviceSummary {
        DeviceSummary {
            bus_number: 1,
            device_address: 7,
            port_numbers: vec![2, 3],
            vendor_id: 0x046d,
            product_id: 0xc52b,
            revision: 0x1201,
            class: 3,
            subclass: 1,
            protocol: 2,
            speed: UsbSpeed::Full,
            manufacturer: Some("Logitech".into()),
            product: Some("USB Receiver".into()),
            serial_number: None,
        }
    }

    fn query(device: &RusbPnpDevice, id_type: BusQueryIdType) -> PnpIrp {
        let mut irp = PnpIrp::query_id(id_type);
        device.send_pnp(&mut irp);
        irp
    }

    #[test]
    fn test_ids_from_descriptors() {
        let summary = receiver();
        assert_eq!(summary.device_id(), "USB\\VID_046D&PID_C52B");
        assert_eq!(
            summary.hardware_ids(),
            vec!["USB\\VID_046D&PID_C52B&REV_1201", "USB\\VID_046D&PID_C52B"]
        );
        assert_eq!(
            summary.compatible_ids()[0],
            "USB\\Class_03&SubClass_01&Prot_02"
        );
        assert_eq!(summary.instance_id(), "1&2.3");
    }

    #[test]
    fn test_serial_number_becomes_instance_id() {
        let mut summary = receiver();
        summary.serial_number = Some("ABC123".into());
        assert_eq!(summary.instance_id(), "ABC123");

        summary.serial_number = Some("has space".into());
        assert_eq!(summary.instance_id(), "1&2.3");
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(map_device_speed(rusb::Speed::Low), UsbSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), UsbSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::SuperPlus), UsbSpeed::Super);
        assert_eq!(map_device_speed(rusb::Speed::Unknown), UsbSpeed::NoSpeed);
    }

    #[test]
    fn test_bcd_from_version() {
        assert_eq!(bcd(Version(2, 0, 0)), 0x0200);
        assert_eq!(bcd(Version(12, 0, 1)), 0x1201);
    }

    #[test]
    fn test_root_hub_detection() {
        let mut summary = receiver();
        assert!(!summary.is_root_hub());
        summary.vendor_id = 0x1d6b;
        summary.class = 9;
        assert!(summary.is_root_hub());
    }

    #[test]
    fn test_pnp_answers_from_summary() {
        let device = RusbPnpDevice::new(&receiver());

        let irp = query(&device, BusQueryIdType::DeviceId);
        let PnpInformation::Id(raw) = irp.information else {
            panic!("no device ID");
        };
        assert_eq!(from_wide_sz(&raw).unwrap(), "USB\\VID_046D&PID_C52B");

        let irp = query(&device, BusQueryIdType::CompatibleIds);
        let PnpInformation::Id(raw) = irp.information else {
            panic!("no compatible IDs");
        };
        assert_eq!(from_wide_multi_sz(&raw).unwrap().len(), 3);

        let irp = query(&device, BusQueryIdType::DeviceSerialNumber);
        assert_eq!(irp.status, Err(UsbError::NotSupported));
    }

    #[test]
    fn test_capabilities_carry_address() {
        let device = RusbPnpDevice::new(&receiver());
        let mut irp = PnpIrp::query_capabilities();
        device.send_pnp(&mut irp);
        let PnpInformation::Capabilities(caps) = irp.information else {
            panic!("no capabilities");
        };
        assert_eq!(caps.address, 7);
        assert_eq!(caps.ui_number, 3);
        assert!(!caps.unique_id);
    }

    #[test]
    fn test_property_two_call_sizes() {
        let device = RusbPnpDevice::new(&receiver());
        let mut empty = [0u8; 0];
        assert_eq!(
            device.device_property(DeviceRegistryProperty::Manufacturer, &mut empty),
            Err(UsbError::BufferTooSmall { needed: 18 })
        );

        let mut buffer = [0u8; 4];
        assert_eq!(
            device.device_property(DeviceRegistryProperty::Address, &mut buffer),
            Ok(4)
        );
        assert_eq!(u32::from_le_bytes(buffer), 7);
        assert_eq!(
            device.device_property(DeviceRegistryProperty::PhysicalDeviceObjectName, &mut buffer),
            Err(UsbError::NotFound)
        );
    }
}
