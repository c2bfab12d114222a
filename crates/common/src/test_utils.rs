//! Test utilities for usb-redirector
//!
//! Provides a scriptable USB bus and PnP device that stand in for the lower
//! device stack, plus small helpers shared by the test suites.
//!
//! # Example
//!
//! ```
//! use common::stack::UsbBus;
//! use common::test_utils::{BusCall, MockUsbBus};
//!
//! let bus = MockUsbBus::with_bulk_interfaces(2);
//! assert_eq!(bus.select_configuration(), Ok(2));
//! assert_eq!(bus.calls(), vec![BusCall::SelectConfiguration]);
//! ```

use crate::memory::LockedBuffer;
use crate::stack::{PnpDevice, PnpInformation, PnpIrp, UsbBus};
use crate::urb::{CompletionParams, PipeInfo, Urb, UsbCompletion};
use protocol::wide::{to_wide_multi_sz, to_wide_sz};
use protocol::{
    BusQueryIdType, ConfigDescriptorHeader, DeviceCapabilities, DeviceDescriptor,
    DeviceRegistryProperty, Direction, PipeType, PnpMinorFunction, UsbError, UsbResult,
    UsbSpeed, UsbStatus, UsbdStatus, encode_config_descriptor_header,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Deterministic transfer payload of `size` bytes
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Interface layout `[interface][alt_setting] -> pipes`
pub type PipeLayout = Vec<Vec<Vec<PipeInfo>>>;

/// Bulk IN/OUT pair for interface `n` (endpoints `0x81+n` and `0x01+n`)
pub fn bulk_pair(n: u8) -> Vec<PipeInfo> {
    vec![
        PipeInfo::new(0x81 + n, PipeType::Bulk, 512),
        PipeInfo::new(0x01 + n, PipeType::Bulk, 512),
    ]
}

/// Call made on a [`MockUsbBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    ConfigurationDescriptor(u8),
    CyclePort,
    SelectConfiguration,
    SelectSetting { interface: u8, alt_setting: u8 },
    DisableMaxPacketSizeCheck(u8),
    AbortPipe(u8),
    ResetPipe(u8),
    Submit { endpoint: u8, length: usize },
}

#[derive(Default)]
struct MockState {
    calls: Vec<BusCall>,
    alt_settings: Vec<u8>,
    device_descriptor: DeviceDescriptor,
    configuration_descriptor: Option<Vec<u8>>,
    speed: UsbSpeed,
    descriptor_error: Option<UsbError>,
    cycle_port_error: Option<UsbError>,
    select_configuration_error: Option<UsbError>,
    select_setting_errors: HashMap<(u8, u8), UsbError>,
    abort_errors: HashMap<u8, UsbError>,
    reset_errors: HashMap<u8, UsbError>,
    configured_pipe_errors: HashMap<(u8, u8), UsbError>,
    submit_error: Option<UsbError>,
    transfer_error: Option<(UsbError, UsbdStatus)>,
    manual_completion: bool,
    reported_length: Option<usize>,
    iso_header_status: UsbdStatus,
    iso_packet_limit: Option<usize>,
    iso_packet_results: Vec<(usize, UsbdStatus)>,
    pending: VecDeque<(Urb, oneshot::Sender<CompletionParams>)>,
    written: Vec<(u8, Vec<u8>)>,
}

/// Scriptable USB bus
///
/// Transfers complete immediately by default. IN transfers fill the buffer
/// with [`create_mock_bulk_data`]; OUT transfers record what was sent.
pub struct MockUsbBus {
    layout: PipeLayout,
    state: Mutex<MockState>,
}

/// Device descriptor of the Logitech receiver the mocks stand in for
pub fn receiver_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: 0x0200,
        max_packet_size0: 8,
        vendor_id: 0x046d,
        product_id: 0xc52b,
        device_version: 0x1201,
        manufacturer_index: 1,
        product_index: 2,
        num_configurations: 1,
        ..Default::default()
    }
}

impl MockUsbBus {
    pub fn new(layout: PipeLayout) -> Self {
        let state = MockState {
            alt_settings: vec![0; layout.len()],
            device_descriptor: receiver_descriptor(),
            speed: UsbSpeed::Full,
            ..Default::default()
        };
        Self {
            layout,
            state: Mutex::new(state),
        }
    }

    /// `count` interfaces, each with one setting holding a [`bulk_pair`]
    pub fn with_bulk_interfaces(count: u8) -> Self {
        Self::new((0..count).map(|n| vec![bulk_pair(n)]).collect())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_select_configuration(&self, error: UsbError) {
        self.state().select_configuration_error = Some(error);
    }

    pub fn fail_select_setting(&self, interface: u8, alt_setting: u8, error: UsbError) {
        self.state()
            .select_setting_errors
            .insert((interface, alt_setting), error);
    }

    pub fn fail_abort_pipe(&self, endpoint: u8, error: UsbError) {
        self.state().abort_errors.insert(endpoint, error);
    }

    pub fn fail_reset_pipe(&self, endpoint: u8, error: UsbError) {
        self.state().reset_errors.insert(endpoint, error);
    }

    /// Fail lookups of pipe `index` on `interface` whatever the setting
    pub fn fail_configured_pipe(&self, interface: u8, index: u8, error: UsbError) {
        self.state()
            .configured_pipe_errors
            .insert((interface, index), error);
    }

    pub fn set_device_descriptor(&self, descriptor: DeviceDescriptor) {
        self.state().device_descriptor = descriptor;
    }

    /// Answer configuration descriptor reads with `raw` instead of a
    /// descriptor built from the layout
    pub fn set_configuration_descriptor(&self, raw: Vec<u8>) {
        self.state().configuration_descriptor = Some(raw);
    }

    pub fn set_speed(&self, speed: UsbSpeed) {
        self.state().speed = speed;
    }

    /// Fail device and configuration descriptor reads
    pub fn fail_descriptors(&self, error: UsbError) {
        self.state().descriptor_error = Some(error);
    }

    pub fn fail_cycle_port(&self, error: UsbError) {
        self.state().cycle_port_error = Some(error);
    }

    /// Reject every submission outright
    pub fn fail_submit(&self, error: UsbError) {
        self.state().submit_error = Some(error);
    }

    /// Accept submissions but complete them with `error`
    pub fn fail_transfers(&self, error: UsbError, usbd_status: UsbdStatus) {
        self.state().transfer_error = Some((error, usbd_status));
    }

    /// Hold completions until [`MockUsbBus::complete_pending`] is called
    pub fn set_manual_completion(&self, manual: bool) {
        self.state().manual_completion = manual;
    }

    /// Report at most `length` bytes per non-isochronous transfer
    pub fn set_reported_length(&self, length: Option<usize>) {
        self.state().reported_length = length;
    }

    pub fn set_iso_header_status(&self, status: UsbdStatus) {
        self.state().iso_header_status = status;
    }

    /// Complete isochronous packet `n` with the `n`th `(actual_length,
    /// status)` instead of its full size and success; packets past the end
    /// keep the default
    pub fn set_iso_packet_results(&self, results: Vec<(usize, UsbdStatus)>) {
        self.state().iso_packet_results = results;
    }

    /// Return isochronous URBs with at most `limit` packets
    pub fn truncate_iso_packets(&self, limit: Option<usize>) {
        self.state().iso_packet_limit = limit;
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Data sent by OUT transfers, keyed by endpoint (0 for control)
    pub fn written(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().written.clone()
    }

    pub fn current_alt_setting(&self, interface: u8) -> Option<u8> {
        self.state().alt_settings.get(interface as usize).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Complete every held transfer, returning how many were completed
    pub fn complete_pending(&self) -> usize {
        let mut state = self.state();
        let pending: Vec<_> = state.pending.drain(..).collect();
        let count = pending.len();
        for (urb, response) in pending {
            let params = execute(urb, &mut state);
            let _ = response.send(params);
        }
        count
    }

    /// Drop every held transfer without answering it
    pub fn drop_pending(&self) -> usize {
        let mut state = self.state();
        let count = state.pending.len();
        state.pending.clear();
        count
    }
}

fn move_data(
    direction: Direction,
    buffer: &LockedBuffer,
    offset: usize,
    length: usize,
    endpoint: u8,
    state: &mut MockState,
) -> UsbStatus {
    match direction {
        Direction::In => buffer.write_at(offset, &create_mock_bulk_data(length)),
        Direction::Out => {
            let data = buffer.read_at(offset, length)?;
            state.written.push((endpoint, data));
            Ok(())
        }
    }
}

fn execute(urb: Urb, state: &mut MockState) -> CompletionParams {
    if let Some((error, usbd_status)) = state.transfer_error {
        return CompletionParams::for_urb(urb, Err(error), usbd_status, 0);
    }

    match urb {
        Urb::Pipe {
            pipe,
            direction,
            buffer,
        } => {
            let length = state
                .reported_length
                .unwrap_or(buffer.len())
                .min(buffer.len());
            let status = move_data(direction, &buffer, 0, length, pipe.endpoint_address, state);
            let usb = match direction {
                Direction::In => UsbCompletion::PipeRead { length },
                Direction::Out => UsbCompletion::PipeWrite { length },
            };
            CompletionParams::new(status, UsbdStatus::SUCCESS, usb)
        }
        Urb::Control {
            setup,
            buffer,
            offset,
        } => {
            let available = buffer
                .as_ref()
                .map(|b| b.len().saturating_sub(offset))
                .unwrap_or(0);
            let length = state.reported_length.unwrap_or(available).min(available);
            let status = match &buffer {
                Some(buffer) => move_data(setup.direction(), buffer, offset, length, 0, state),
                None => Ok(()),
            };
            CompletionParams::new(
                status,
                UsbdStatus::SUCCESS,
                UsbCompletion::ControlTransfer { length },
            )
        }
        Urb::Isochronous(mut iso) => {
            let mut status = Ok(());
            for index in 0..iso.packets.len() {
                let packet = iso.packets[index];
                if iso.direction == Direction::In {
                    status = status.and(
                        iso.buffer
                            .write_at(packet.offset, &create_mock_bulk_data(packet.size)),
                    );
                }
                let (actual_length, packet_status) = state
                    .iso_packet_results
                    .get(index)
                    .copied()
                    .unwrap_or((packet.size, UsbdStatus::SUCCESS));
                iso.packets[index].actual_length = actual_length.min(packet.size);
                iso.packets[index].status = packet_status;
            }
            if let Some(limit) = state.iso_packet_limit {
                iso.packets.truncate(limit);
            }
            iso.header_status = state.iso_header_status;
            CompletionParams::new(status, iso.header_status, UsbCompletion::PipeUrb(iso))
        }
    }
}

impl MockUsbBus {
    /// Configuration descriptor whose total length covers one interface and
    /// one endpoint descriptor per pipe of the default settings
    fn layout_configuration_descriptor(&self) -> Vec<u8> {
        const INTERFACE_SIZE: usize = 9;
        const ENDPOINT_SIZE: usize = 7;

        let mut raw = Vec::new();
        for (number, settings) in self.layout.iter().enumerate() {
            let pipes = settings.first().map(Vec::as_slice).unwrap_or_default();
            raw.extend_from_slice(&[
                INTERFACE_SIZE as u8,
                0x04,
                number as u8,
                0,
                pipes.len() as u8,
                0xff,
                0,
                0,
                0,
            ]);
            for pipe in pipes {
                let attributes = match pipe.pipe_type {
                    PipeType::Control => 0,
                    PipeType::Isochronous => 1,
                    PipeType::Bulk => 2,
                    PipeType::Interrupt => 3,
                };
                let [low, high] = pipe.max_packet_size.to_le_bytes();
                raw.extend_from_slice(&[
                    ENDPOINT_SIZE as u8,
                    0x05,
                    pipe.endpoint_address,
                    attributes,
                    low,
                    high,
                    pipe.interval,
                ]);
            }
        }

        let header = ConfigDescriptorHeader {
            total_length: (ConfigDescriptorHeader::SIZE + raw.len()) as u16,
            num_interfaces: self.layout.len() as u8,
            configuration_value: 1,
            attributes: 0x80,
            max_power: 50,
            ..Default::default()
        };
        let mut descriptor = encode_config_descriptor_header(&header).to_vec();
        descriptor.extend_from_slice(&raw);
        descriptor
    }
}

impl UsbBus for MockUsbBus {
    fn device_descriptor(&self) -> UsbResult<DeviceDescriptor> {
        let state = self.state();
        match state.descriptor_error {
            Some(error) => Err(error),
            None => Ok(state.device_descriptor),
        }
    }

    fn configuration_descriptor(&self, index: u8) -> UsbResult<Vec<u8>> {
        let mut state = self.state();
        state.calls.push(BusCall::ConfigurationDescriptor(index));
        if let Some(error) = state.descriptor_error {
            return Err(error);
        }
        if index >= state.device_descriptor.num_configurations {
            return Err(UsbError::Stall);
        }
        match &state.configuration_descriptor {
            Some(raw) => Ok(raw.clone()),
            None => Ok(self.layout_configuration_descriptor()),
        }
    }

    fn speed(&self) -> UsbSpeed {
        self.state().speed
    }

    fn cycle_port(&self) -> UsbStatus {
        let mut state = self.state();
        state.calls.push(BusCall::CyclePort);
        state.cycle_port_error.map_or(Ok(()), Err)
    }

    fn select_configuration(&self) -> UsbResult<u8> {
        let mut state = self.state();
        state.calls.push(BusCall::SelectConfiguration);
        if let Some(error) = state.select_configuration_error {
            return Err(error);
        }
        state.alt_settings = vec![0; self.layout.len()];
        Ok(self.layout.len() as u8)
    }

    fn select_setting(&self, interface: u8, alt_setting: u8) -> UsbStatus {
        let mut state = self.state();
        state.calls.push(BusCall::SelectSetting {
            interface,
            alt_setting,
        });
        if let Some(error) = state.select_setting_errors.get(&(interface, alt_setting)) {
            return Err(*error);
        }
        let settings = self
            .layout
            .get(interface as usize)
            .ok_or(UsbError::InvalidParameter)?;
        if alt_setting as usize >= settings.len() {
            return Err(UsbError::InvalidParameter);
        }
        state.alt_settings[interface as usize] = alt_setting;
        Ok(())
    }

    fn num_configured_pipes(&self, interface: u8) -> u8 {
        let alt = self.current_alt_setting(interface).unwrap_or(0);
        self.layout
            .get(interface as usize)
            .and_then(|settings| settings.get(alt as usize))
            .map(|pipes| pipes.len() as u8)
            .unwrap_or(0)
    }

    fn configured_pipe(&self, interface: u8, index: u8) -> UsbResult<PipeInfo> {
        if let Some(error) = self.state().configured_pipe_errors.get(&(interface, index)) {
            return Err(*error);
        }
        let alt = self.current_alt_setting(interface).unwrap_or(0);
        self.layout
            .get(interface as usize)
            .and_then(|settings| settings.get(alt as usize))
            .and_then(|pipes| pipes.get(index as usize))
            .copied()
            .ok_or(UsbError::NotFound)
    }

    fn disable_max_packet_size_check(&self, endpoint: u8) {
        self.state()
            .calls
            .push(BusCall::DisableMaxPacketSizeCheck(endpoint));
    }

    fn abort_pipe(&self, endpoint: u8) -> UsbStatus {
        let mut state = self.state();
        state.calls.push(BusCall::AbortPipe(endpoint));
        state.abort_errors.get(&endpoint).map_or(Ok(()), |e| Err(*e))
    }

    fn reset_pipe(&self, endpoint: u8) -> UsbStatus {
        let mut state = self.state();
        state.calls.push(BusCall::ResetPipe(endpoint));
        state.reset_errors.get(&endpoint).map_or(Ok(()), |e| Err(*e))
    }

    fn submit(&self, urb: Urb) -> UsbResult<oneshot::Receiver<CompletionParams>> {
        let mut state = self.state();
        state.calls.push(BusCall::Submit {
            endpoint: urb.endpoint_address(),
            length: urb.data_len(),
        });
        if let Some(error) = state.submit_error {
            return Err(error);
        }

        let (tx, rx) = oneshot::channel();
        if state.manual_completion {
            state.pending.push_back((urb, tx));
        } else {
            let params = execute(urb, &mut state);
            let _ = tx.send(params);
        }
        Ok(rx)
    }
}

/// Scriptable PnP device with a realistic hardware identity
pub struct MockPnpDevice {
    ids: HashMap<BusQueryIdType, Vec<u16>>,
    capabilities: Option<DeviceCapabilities>,
    properties: HashMap<DeviceRegistryProperty, Vec<u8>>,
    property_error: Option<UsbError>,
    sent: Mutex<Vec<(PnpMinorFunction, Option<BusQueryIdType>)>>,
}

impl MockPnpDevice {
    pub const DEVICE_ID: &'static str = "USB\\VID_046D&PID_C52B";
    pub const INSTANCE_ID: &'static str = "5&2b5a5c1&0&2";

    pub fn new() -> Self {
        let mut ids = HashMap::new();
        ids.insert(BusQueryIdType::DeviceId, to_wide_sz(Self::DEVICE_ID));
        ids.insert(BusQueryIdType::InstanceId, to_wide_sz(Self::INSTANCE_ID));
        ids.insert(
            BusQueryIdType::HardwareIds,
            to_wide_multi_sz(&["USB\\VID_046D&PID_C52B&REV_1201", "USB\\VID_046D&PID_C52B"]),
        );
        ids.insert(
            BusQueryIdType::CompatibleIds,
            to_wide_multi_sz(&[
                "USB\\Class_03&SubClass_01&Prot_01",
                "USB\\Class_03&SubClass_01",
                "USB\\Class_03",
            ]),
        );

        let capabilities = DeviceCapabilities {
            removable: true,
            eject_supported: true,
            surprise_removal_ok: true,
            address: 2,
            ui_number: 2,
            ..Default::default()
        };

        let mut properties = HashMap::new();
        properties.insert(
            DeviceRegistryProperty::DeviceDescription,
            wide_bytes("USB Receiver"),
        );
        properties.insert(DeviceRegistryProperty::Manufacturer, wide_bytes("Logitech"));
        properties.insert(DeviceRegistryProperty::Address, 2u32.to_le_bytes().to_vec());

        Self {
            ids,
            capabilities: Some(capabilities),
            properties,
            property_error: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Answer `QUERY_ID` for `id_type` with `raw`
    pub fn with_id(mut self, id_type: BusQueryIdType, raw: Vec<u16>) -> Self {
        self.ids.insert(id_type, raw);
        self
    }

    /// Fail `QUERY_ID` for `id_type`
    pub fn without_id(mut self, id_type: BusQueryIdType) -> Self {
        self.ids.remove(&id_type);
        self
    }

    /// `None` makes capability queries fail
    pub fn with_capabilities(mut self, capabilities: Option<DeviceCapabilities>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_property(mut self, property: DeviceRegistryProperty, value: Vec<u8>) -> Self {
        self.properties.insert(property, value);
        self
    }

    pub fn failing_properties(mut self, error: UsbError) -> Self {
        self.property_error = Some(error);
        self
    }

    /// PnP requests received so far
    pub fn sent(&self) -> Vec<(PnpMinorFunction, Option<BusQueryIdType>)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockPnpDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn wide_bytes(s: &str) -> Vec<u8> {
    to_wide_sz(s)
        .into_iter()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

impl PnpDevice for MockPnpDevice {
    fn send_pnp(&self, irp: &mut PnpIrp) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((irp.minor, irp.id_type));

        match irp.minor {
            PnpMinorFunction::QueryId => {
                match irp.id_type.and_then(|t| self.ids.get(&t)) {
                    Some(id) => irp.complete(Ok(()), PnpInformation::Id(id.clone())),
                    None => irp.complete(Err(UsbError::NotSupported), PnpInformation::None),
                }
            }
            PnpMinorFunction::QueryCapabilities => match self.capabilities {
                Some(caps) => irp.complete(Ok(()), PnpInformation::Capabilities(caps)),
                None => irp.status = Err(UsbError::Unsuccessful),
            },
            _ => irp.status = Ok(()),
        }
    }

    fn device_property(
        &self,
        property: DeviceRegistryProperty,
        buffer: &mut [u8],
    ) -> UsbResult<usize> {
        if let Some(error) = self.property_error {
            return Err(error);
        }
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
    use crate::memory::{AddressSpace, LockAccess};

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(1024);

        assert_eq!(data.len(), 1024);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0); // Wraps around
    }

    #[test]
    fn test_layout_follows_alt_setting() {
        let bus = MockUsbBus::new(vec![vec![
            vec![],
            vec![PipeInfo::new(0x83, PipeType::Isochronous, 1024)],
        ]]);
        assert_eq!(bus.num_configured_pipes(0), 0);
        bus.select_setting(0, 1).unwrap();
        assert_eq!(bus.num_configured_pipes(0), 1);
        assert_eq!(bus.configured_pipe(0, 0).unwrap().endpoint_address, 0x83);
        assert_eq!(bus.select_setting(0, 2), Err(UsbError::InvalidParameter));
        assert_eq!(bus.current_alt_setting(0), Some(1));
    }

    #[test]
    fn test_configuration_descriptor_follows_layout() {
        let bus = MockUsbBus::with_bulk_interfaces(2);
        let raw = bus.configuration_descriptor(0).unwrap();

        let header = protocol::decode_config_descriptor_header(&raw).unwrap();
        assert_eq!(usize::from(header.total_length), raw.len());
        assert_eq!(raw.len(), 9 + 2 * (9 + 2 * 7));
        assert_eq!(header.num_interfaces, 2);
        assert_eq!(bus.configuration_descriptor(1), Err(UsbError::Stall));
    }

    #[tokio::test]
    async fn test_manual_completion() {
        let bus = MockUsbBus::with_bulk_interfaces(1);
        bus.set_manual_completion(true);
        bus.set_reported_length(Some(4));

        let space = AddressSpace::new();
        let base = space.map(vec![0; 16]);
        let pipe = bus.configured_pipe(0, 0).unwrap();
        let rx = bus
            .submit(Urb::Pipe {
                pipe,
                direction: Direction::In,
                buffer: space.lock(base, 16, LockAccess::Write).unwrap(),
            })
            .unwrap();

        assert_eq!(bus.pending_count(), 1);
        assert_eq!(space.lock_count(base), 1);
        assert_eq!(bus.complete_pending(), 1);

        let params = rx.await.unwrap();
        assert_eq!(params.length(), 4);
        assert_eq!(space.read(base, 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert_eq!(space.lock_count(base), 0);
    }

    #[tokio::test]
    async fn test_dropped_completion() {
        let bus = MockUsbBus::with_bulk_interfaces(1);
        bus.set_manual_completion(true);

        let space = AddressSpace::new();
        let base = space.map(vec![0; 4]);
        let pipe = bus.configured_pipe(0, 1).unwrap();
        let rx = bus
            .submit(Urb::Pipe {
                pipe,
                direction: Direction::Out,
                buffer: space.lock(base, 4, LockAccess::Read).unwrap(),
            })
            .unwrap();

        assert_eq!(bus.drop_pending(), 1);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_mock_property_sizes() {
        let device = MockPnpDevice::new();
        let mut empty = [0u8; 0];
        assert_eq!(
            device.device_property(DeviceRegistryProperty::Manufacturer, &mut empty),
            Err(UsbError::BufferTooSmall { needed: 18 })
        );
        assert_eq!(
            device.device_property(DeviceRegistryProperty::HardwareId, &mut empty),
            Err(UsbError::NotFound)
        );
    }
}
