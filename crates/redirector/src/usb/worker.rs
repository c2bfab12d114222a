//! USB worker thread
//!
//! The device handle lives on a dedicated `usb-worker` thread. Commands
//! arrive over the bridge and are executed one at a time; every transfer is
//! synchronous on this thread, so by the time an abort could be issued no
//! transfer is outstanding.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::{execute, map_rusb_error};
use common::{CompletionParams, UsbCommand, UsbEvent, UsbWorker};
use protocol::{ConfigDescriptorHeader, SetupPacket, UsbError, UsbResult, UsbStatus, UsbdStatus};
use rusb::{Context, DeviceHandle};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct UsbWorkerThread {
    device: UsbDevice,
    worker: UsbWorker,
    timeout: Duration,
    gone: bool,
}

impl UsbWorkerThread {
    /// `device` must already be open
    pub fn new(device: UsbDevice, worker: UsbWorker, timeout: Duration) -> Self {
        Self {
            device,
            worker,
            timeout,
            gone: false,
        }
    }

    /// Execute commands until shutdown or until the bridge closes
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            match self.worker.recv_command() {
                Ok(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    debug!("Command channel closed: {}", e);
                    break;
                }
            }
        }

        self.device.close();
        info!("USB worker thread stopped");
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        let name = cmd.name();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler ({}): {:?}", name, e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::SelectConfiguration { response } => {
                let result = self.with_handle(|handle| {
                    let config = handle
                        .device()
                        .active_config_descriptor()
                        .map_err(map_rusb_error)?;
                    Ok(config.num_interfaces())
                });
                debug!("Select configuration: {:?}", result);
                let _ = response.send(result);
            }

            UsbCommand::SelectSetting {
                interface,
                alt_setting,
                response,
            } => {
                let result = self.with_handle(|handle| {
                    handle
                        .set_alternate_setting(interface, alt_setting)
                        .map_err(map_rusb_error)
                });
                debug!(
                    "Select setting {} on interface {}: {:?}",
                    alt_setting, interface, result
                );
                let _ = response.send(result);
            }

            UsbCommand::AbortPipe { endpoint, response } => {
                debug!("Abort on endpoint {:#04x}: nothing outstanding", endpoint);
                let _ = response.send(self.with_handle(|_| Ok(())));
            }

            UsbCommand::ResetPipe { endpoint, response } => {
                let result: UsbStatus = self.with_handle(|handle| {
                    handle.clear_halt(endpoint).map_err(map_rusb_error)
                });
                if let Err(e) = &result {
                    warn!("Clear halt on endpoint {:#04x} failed: {}", endpoint, e);
                }
                let _ = response.send(result);
            }

            UsbCommand::ReadConfigDescriptor { index, response } => {
                let timeout = self.timeout;
                let result =
                    self.with_handle(|handle| read_config_descriptor(handle, index, timeout));
                if let Err(e) = &result {
                    warn!("Reading configuration descriptor {} failed: {}", index, e);
                }
                let _ = response.send(result);
            }

            UsbCommand::CyclePort { response } => {
                let result = match self.device.handle_mut() {
                    Some(handle) => handle.reset().map_err(map_rusb_error),
                    None => Err(UsbError::NoDevice),
                };
                match &result {
                    Ok(()) => info!("Device port cycled"),
                    Err(UsbError::NoDevice) | Err(UsbError::NotFound) => {
                        // libusb reports a device that re-enumerated differently as gone
                        self.device_gone();
                    }
                    Err(e) => warn!("Port cycle failed: {}", e),
                }
                let _ = response.send(result);
            }

            UsbCommand::Submit { urb, response } => {
                let params = match self.device.handle() {
                    Some(handle) => execute(handle, urb, self.timeout),
                    None => CompletionParams::for_urb(
                        urb,
                        Err(UsbError::NoDevice),
                        UsbdStatus::DEV_NOT_RESPONDING,
                        0,
                    ),
                };
                if params.status == Err(UsbError::NoDevice) {
                    self.device_gone();
                }
                let _ = response.send(params);
            }

            UsbCommand::Shutdown => {
                // Handled by the run loop
            }
        }
    }

    fn with_handle<T>(
        &mut self,
        op: impl FnOnce(&DeviceHandle<Context>) -> UsbResult<T>,
    ) -> UsbResult<T> {
        let result = match self.device.handle() {
            Some(handle) => op(handle),
            None => Err(UsbError::NoDevice),
        };
        if result.as_ref().err() == Some(&UsbError::NoDevice) {
            self.device_gone();
        }
        result
    }

    /// Report the device gone, once
    fn device_gone(&mut self) {
        if self.gone {
            return;
        }
        self.gone = true;
        warn!("USB device stopped responding");
        if let Err(e) = self.worker.send_event(UsbEvent::DeviceGone) {
            error!("Failed to send DeviceGone event: {}", e);
        }
    }
}

fn get_descriptor(
    handle: &DeviceHandle<Context>,
    setup: SetupPacket,
    timeout: Duration,
) -> UsbResult<Vec<u8>> {
    let mut buf = vec![0u8; usize::from(setup.length)];
    let n = handle
        .read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buf,
            timeout,
        )
        .map_err(map_rusb_error)?;
    buf.truncate(n);
    Ok(buf)
}

/// Header first, then the full `wTotalLength` when it is longer
fn read_config_descriptor(
    handle: &DeviceHandle<Context>,
    index: u8,
    timeout: Duration,
) -> UsbResult<Vec<u8>> {
    let header = get_descriptor(
        handle,
        SetupPacket::get_descriptor(
            ConfigDescriptorHeader::DESCRIPTOR_TYPE,
            index,
            ConfigDescriptorHeader::SIZE as u16,
        ),
        timeout,
    )?;
    let total_length = match header.get(2..4) {
        Some(&[low, high]) => u16::from_le_bytes([low, high]),
        _ => return Ok(header),
    };
    if usize::from(total_length) <= header.len() {
        return Ok(header);
    }
    get_descriptor(
        handle,
        SetupPacket::get_descriptor(ConfigDescriptorHeader::DESCRIPTOR_TYPE, index, total_length),
        timeout,
    )
}

/// Spawn the USB worker thread for an opened device
pub fn spawn_usb_worker(
    device: UsbDevice,
    worker: UsbWorker,
    timeout: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(device, worker, timeout).run())
}
