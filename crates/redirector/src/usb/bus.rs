//! USB bus over the worker bridge
//!
//! [`RusbBus`] is the lower bus stack the redirector drives when it runs
//! over rusb. Pipe layouts come from the active configuration descriptor,
//! read once at attach along with the device descriptor and speed;
//! everything that touches the device goes to the `usb-worker` thread.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::map_rusb_error;
use common::{CompletionParams, PipeInfo, Urb, UsbBridge, UsbBus, UsbCommand};
use protocol::{DeviceDescriptor, PipeType, UsbError, UsbResult, UsbSpeed, UsbStatus};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Pipes of one interface, per alternate setting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    /// `(setting number, pipes)`
    pub settings: Vec<(u8, Vec<PipeInfo>)>,
}

impl InterfaceLayout {
    fn pipes(&self, alt_setting: u8) -> &[PipeInfo] {
        self.settings
            .iter()
            .find(|(number, _)| *number == alt_setting)
            .map(|(_, pipes)| pipes.as_slice())
            .unwrap_or_default()
    }
}

fn pipe_type(transfer_type: rusb::TransferType) -> PipeType {
    match transfer_type {
        rusb::TransferType::Control => PipeType::Control,
        rusb::TransferType::Isochronous => PipeType::Isochronous,
        rusb::TransferType::Bulk => PipeType::Bulk,
        rusb::TransferType::Interrupt => PipeType::Interrupt,
    }
}

/// Read the pipe layout of the active configuration
pub fn read_layout(device: &UsbDevice) -> UsbResult<Vec<InterfaceLayout>> {
    let config = device
        .device()
        .active_config_descriptor()
        .map_err(map_rusb_error)?;

    let layout = config
        .interfaces()
        .map(|interface| InterfaceLayout {
            number: interface.number(),
            settings: interface
                .descriptors()
                .map(|setting| {
                    let pipes = setting
                        .endpoint_descriptors()
                        .map(|endpoint| PipeInfo {
                            endpoint_address: endpoint.address(),
                            pipe_type: pipe_type(endpoint.transfer_type()),
                            max_packet_size: endpoint.max_packet_size(),
                            interval: endpoint.interval(),
                        })
                        .collect();
                    (setting.setting_number(), pipes)
                })
                .collect(),
        })
        .collect();
    Ok(layout)
}

pub struct RusbBus {
    bridge: UsbBridge,
    descriptor: DeviceDescriptor,
    speed: UsbSpeed,
    layout: Vec<InterfaceLayout>,
    alt_settings: Mutex<Vec<u8>>,
}

impl RusbBus {
    pub fn new(bridge: UsbBridge, device: &UsbDevice, layout: Vec<InterfaceLayout>) -> Self {
        Self::with_descriptor(bridge, device.descriptor(), device.speed(), layout)
    }

    pub fn with_descriptor(
        bridge: UsbBridge,
        descriptor: DeviceDescriptor,
        speed: UsbSpeed,
        layout: Vec<InterfaceLayout>,
    ) -> Self {
        let alt_settings = Mutex::new(vec![0; layout.len()]);
        Self {
            bridge,
            descriptor,
            speed,
            layout,
            alt_settings,
        }
    }

    fn current_alt_setting(&self, interface: u8) -> u8 {
        self.alt_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(usize::from(interface))
            .copied()
            .unwrap_or(0)
    }

    fn current_pipes(&self, interface: u8) -> &[PipeInfo] {
        let alt = self.current_alt_setting(interface);
        self.layout
            .get(usize::from(interface))
            .map(|layout| layout.pipes(alt))
            .unwrap_or_default()
    }

    /// Send a command and wait for the worker's answer
    fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<UsbResult<T>>) -> UsbCommand,
    ) -> UsbResult<T> {
        let (tx, rx) = oneshot::channel();
        let command = command(tx);
        let name = command.name();
        self.bridge.send_command_blocking(command).map_err(|e| {
            warn!("Failed to send {} to USB worker: {}", name, e);
            e.usb_status()
        })?;
        rx.blocking_recv().map_err(|_| {
            warn!("USB worker dropped {} without answering", name);
            UsbError::NoDevice
        })?
    }
}

impl UsbBus for RusbBus {
    fn device_descriptor(&self) -> UsbResult<DeviceDescriptor> {
        Ok(self.descriptor)
    }

    fn configuration_descriptor(&self, index: u8) -> UsbResult<Vec<u8>> {
        self.call(|response| UsbCommand::ReadConfigDescriptor { index, response })
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn cycle_port(&self) -> UsbStatus {
        self.call(|response| UsbCommand::CyclePort { response })
    }

    fn select_configuration(&self) -> UsbResult<u8> {
        let count = self.call(|response| UsbCommand::SelectConfiguration { response })?;
        let mut alt_settings = self
            .alt_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        alt_settings.iter_mut().for_each(|alt| *alt = 0);
        Ok(count)
    }

    fn select_setting(&self, interface: u8, alt_setting: u8) -> UsbStatus {
        let layout = self
            .layout
            .get(usize::from(interface))
            .ok_or(UsbError::InvalidParameter)?;
        if !layout.settings.iter().any(|(number, _)| *number == alt_setting) {
            return Err(UsbError::InvalidParameter);
        }

        let number = layout.number;
        self.call(|response| UsbCommand::SelectSetting {
            interface: number,
            alt_setting,
            response,
        })?;

        let mut alt_settings = self
            .alt_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(alt) = alt_settings.get_mut(usize::from(interface)) {
            *alt = alt_setting;
        }
        Ok(())
    }

    fn num_configured_pipes(&self, interface: u8) -> u8 {
        u8::try_from(self.current_pipes(interface).len()).unwrap_or(u8::MAX)
    }

    fn configured_pipe(&self, interface: u8, index: u8) -> UsbResult<PipeInfo> {
        self.current_pipes(interface)
            .get(usize::from(index))
            .copied()
            .ok_or(UsbError::NotFound)
    }

    fn disable_max_packet_size_check(&self, endpoint: u8) {
        // libusb never enforces packet-size multiples
        debug!("Short transfers allowed on {:#04x}", endpoint);
    }

    fn abort_pipe(&self, endpoint: u8) -> UsbStatus {
        self.call(|response| UsbCommand::AbortPipe { endpoint, response })
    }

    fn reset_pipe(&self, endpoint: u8) -> UsbStatus {
        self.call(|response| UsbCommand::ResetPipe { endpoint, response })
    }

    fn submit(&self, urb: Urb) -> UsbResult<oneshot::Receiver<CompletionParams>> {
        let (tx, rx) = oneshot::channel();
        let endpoint = urb.endpoint_address();
        self.bridge
            .try_send_command(UsbCommand::Submit { urb, response: tx })
            .map_err(|e| {
                warn!("Cannot queue transfer on {:#04x}: {}", endpoint, e);
                if self.bridge.is_closed() {
                    UsbError::NoDevice
                } else {
                    UsbError::InsufficientResources
                }
            })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;
    use common::test_utils::{bulk_pair, receiver_descriptor};
    use std::thread;

    fn layout() -> Vec<InterfaceLayout> {
        vec![
            InterfaceLayout {
                number: 0,
                settings: vec![(0, bulk_pair(0))],
            },
            InterfaceLayout {
                number: 1,
                settings: vec![
                    (0, vec![]),
                    (1, vec![PipeInfo::new(0x83, PipeType::Isochronous, 1024)]),
                ],
            },
        ]
    }

    fn bus(bridge: UsbBridge) -> RusbBus {
        RusbBus::with_descriptor(
            bridge,
            receiver_descriptor(),
            UsbSpeed::High,
            layout(),
        )
    }

    #[test]
    fn test_descriptor_and_speed_are_cached() {
        let (bridge, _worker) = create_usb_bridge(4);
        let bus = bus(bridge);
        assert_eq!(bus.device_descriptor(), Ok(receiver_descriptor()));
        assert_eq!(bus.speed(), UsbSpeed::High);
    }

    #[test]
    fn test_configuration_descriptor_goes_to_worker() {
        let (bridge, worker) = create_usb_bridge(4);
        let bus = bus(bridge);

        let handle = thread::spawn(move || match worker.recv_command().unwrap() {
            UsbCommand::ReadConfigDescriptor { index, response } => {
                let _ = response.send(Ok(vec![0x09, 0x02, 0x09, 0x00]));
                index
            }
            other => panic!("unexpected command {}", other.name()),
        });

        assert_eq!(
            bus.configuration_descriptor(2),
            Ok(vec![0x09, 0x02, 0x09, 0x00])
        );
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_cycle_port_without_worker() {
        let (bridge, worker) = create_usb_bridge(4);
        let bus = bus(bridge);
        drop(worker);
        assert_eq!(bus.cycle_port(), Err(UsbError::NoDevice));
    }

    #[test]
    fn test_select_setting_switches_layout() {
        let (bridge, worker) = create_usb_bridge(4);
        let bus = bus(bridge);

        let handle = thread::spawn(move || match worker.recv_command().unwrap() {
            UsbCommand::SelectSetting {
                interface,
                alt_setting,
                response,
            } => {
                let _ = response.send(Ok(()));
                (interface, alt_setting)
            }
            other => panic!("unexpected command {}", other.name()),
        });

        assert_eq!(bus.num_configured_pipes(1), 0);
        bus.select_setting(1, 1).unwrap();
        assert_eq!(handle.join().unwrap(), (1, 1));
        assert_eq!(bus.num_configured_pipes(1), 1);
        assert_eq!(bus.configured_pipe(1, 0).unwrap().endpoint_address, 0x83);
        assert_eq!(bus.configured_pipe(1, 1), Err(UsbError::NotFound));
    }

    #[test]
    fn test_unknown_setting_never_reaches_worker() {
        let (bridge, _worker) = create_usb_bridge(4);
        let bus = bus(bridge);
        assert_eq!(bus.select_setting(0, 3), Err(UsbError::InvalidParameter));
        assert_eq!(bus.select_setting(5, 0), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn test_worker_error_is_returned() {
        let (bridge, worker) = create_usb_bridge(4);
        let bus = bus(bridge);

        let handle = thread::spawn(move || {
            if let Ok(UsbCommand::ResetPipe { response, .. }) = worker.recv_command() {
                let _ = response.send(Err(UsbError::Stall));
            }
        });

        assert_eq!(bus.reset_pipe(0x81), Err(UsbError::Stall));
        handle.join().unwrap();
    }

    #[test]
    fn test_submit_without_worker() {
        let (bridge, worker) = create_usb_bridge(1);
        let bus = bus(bridge);
        drop(worker);

        let urb = Urb::Control {
            setup: Default::default(),
            buffer: None,
            offset: 0,
        };
        assert_eq!(bus.submit(urb).unwrap_err(), UsbError::NoDevice);
    }

    #[test]
    fn test_submit_full_queue() {
        let (bridge, _worker) = create_usb_bridge(1);
        let bus = bus(bridge);

        let control = || Urb::Control {
            setup: Default::default(),
            buffer: None,
            offset: 0,
        };
        let _pending = bus.submit(control()).unwrap();
        assert_eq!(
            bus.submit(control()).unwrap_err(),
            UsbError::InsufficientResources
        );
    }
}
