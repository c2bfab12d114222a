//! Redirector strategy
//!
//! The strategy owns the USB target of a redirected device. It answers bus
//! queries with the synthetic redirector identity, locks transfer buffers in
//! the requester's context, and multiplexes read/write requests onto the
//! target's pipes. Configuration requests (abort, reset, alt-setting) run
//! on the blocking pool; alt-setting selection stops the data queue for the
//! duration of the switch.

use crate::control_plane::ControlPlane;
use crate::filter::{FilterStrategy, forward, post_process_on_success};
use crate::identity::{DeviceIdentity, instance_id, patch_capabilities, synthetic_id};
use crate::queue::QueueGate;
use crate::request::{Request, TransferContext};
use crate::usb::UsbTarget;
use common::{CompletionParams, PnpDevice, PnpInformation, PnpIrp, UsbBus, UsbCompletion};
use protocol::{
    BYTES_TRANSFERRED_SIZE, Direction, IoControlCode, IsoTransferResult, PnpMinorFunction,
    SetupPacket, TransferKind, UsbError, UsbResult, UsbStatus, decode_alt_setting,
    UsbdStatus, decode_setup_packet, decode_transfer_request, decode_u64, decode_u64_array,
    encode_iso_result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectorState {
    /// Identity read, target not (yet) usable
    Attaching,
    /// Target configured and registered with the control plane
    Available,
    Closing,
}

pub struct RedirectorStrategy {
    lower: Arc<dyn PnpDevice>,
    bus: Arc<dyn UsbBus>,
    control_plane: Arc<dyn ControlPlane>,
    identity: DeviceIdentity,
    instance_number: u32,
    target: OnceLock<UsbTarget>,
    state: Mutex<RedirectorState>,
    data_gate: QueueGate,
    closed: AtomicBool,
}

impl RedirectorStrategy {
    pub fn new(
        lower: Arc<dyn PnpDevice>,
        bus: Arc<dyn UsbBus>,
        control_plane: Arc<dyn ControlPlane>,
        identity: DeviceIdentity,
        instance_number: u32,
    ) -> Self {
        Self {
            lower,
            bus,
            control_plane,
            identity,
            instance_number,
            target: OnceLock::new(),
            state: Mutex::new(RedirectorState::Attaching),
            data_gate: QueueGate::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn instance_number(&self) -> u32 {
        self.instance_number
    }

    pub fn state(&self) -> RedirectorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate of the data queue, stopped while an alt-setting is switched
    pub fn data_gate(&self) -> &QueueGate {
        &self.data_gate
    }

    /// Configure the USB target and register the redirect
    ///
    /// Blocks on the lower stack. On failure the strategy stays in
    /// `Attaching` and every transfer fails with `InvalidDeviceState`.
    pub fn make_available(&self) -> UsbStatus {
        if self.target.get().is_none() {
            let target = UsbTarget::create(Arc::clone(&self.bus)).inspect_err(|e| {
                error!(
                    "Failed to create USB target for {}: {}",
                    self.identity.device_id, e
                )
            })?;
            // A concurrent caller may have won; either target is equivalent
            let _ = self.target.set(target);
        }

        self.control_plane
            .notify_redirector_attached(
                &self.identity.device_id,
                &self.identity.instance_id,
                self.instance_number,
            )
            .inspect_err(|e| {
                error!(
                    "Control plane refused redirector for {}\\{}: {}",
                    self.identity.device_id, self.identity.instance_id, e
                )
            })?;

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RedirectorState::Available;
        info!(
            "Redirector {} available for {}",
            instance_id(self.instance_number),
            self.identity.device_id
        );
        Ok(())
    }

    /// Leave the control plane; runs once however often it is called
    pub fn on_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            RedirectorState::Closing,
        );
        if previous != RedirectorState::Available {
            debug!(
                "Redirector for {} closed before it became available",
                self.identity.device_id
            );
            return;
        }

        match self.control_plane.remove_redirect(&self.identity.key()) {
            Ok(()) => info!("Redirect for {} removed", self.identity.device_id),
            Err(e) => error!(
                "Failed to remove redirect for {}\\{}: {}",
                self.identity.device_id, self.identity.instance_id, e
            ),
        }
    }

    fn target(&self) -> UsbResult<&UsbTarget> {
        if self.state() != RedirectorState::Available {
            return Err(UsbError::InvalidDeviceState);
        }
        self.target.get().ok_or(UsbError::InvalidDeviceState)
    }

    fn patch_query_id(&self, irp: &mut PnpIrp) {
        let Some(id_type) = irp.id_type else {
            return;
        };
        if let Some(id) = synthetic_id(id_type, self.instance_number) {
            debug!("Replacing {:?} of {}", id_type, self.identity.device_id);
            irp.information = PnpInformation::Id(id);
        }
    }

    pub async fn read_pipe(&self, request: Request) {
        self.transfer(request, Direction::In).await;
    }

    pub async fn write_pipe(&self, request: Request) {
        self.transfer(request, Direction::Out).await;
    }

    async fn transfer(&self, request: Request, direction: Direction) {
        let target = match self.target() {
            Ok(target) => target,
            Err(e) => {
                request.complete(Err(e));
                return;
            }
        };

        let parts = request.context().map(|ctx| {
            (
                ctx.transfer_type,
                ctx.endpoint_address,
                ctx.buffer.clone(),
                ctx.iso_packets
                    .as_ref()
                    .map(|sizes| decode_u64_array(&sizes.to_vec())),
            )
        });
        let Some((kind, endpoint, buffer, packet_sizes)) = parts else {
            warn!("Request {} reached the data queue unprepared", request.id());
            request.complete(Err(UsbError::InvalidParameter));
            return;
        };

        if kind == TransferKind::Control {
            self.do_control_transfer(target, request).await;
            return;
        }
        let Some(buffer) = buffer else {
            request.complete(Err(UsbError::InvalidParameter));
            return;
        };

        let in_flight = match (kind, direction) {
            (TransferKind::Isochronous, direction) => {
                let sizes = packet_sizes.unwrap_or_default();
                match direction {
                    Direction::In => target.read_isochronous_pipe_async(
                        request,
                        endpoint,
                        buffer,
                        &sizes,
                        iso_completion,
                    ),
                    Direction::Out => target.write_isochronous_pipe_async(
                        request,
                        endpoint,
                        buffer,
                        &sizes,
                        iso_completion,
                    ),
                }
            }
            (_, Direction::In) => {
                target.read_pipe_async(request, endpoint, buffer, pipe_read_completion)
            }
            (_, Direction::Out) => {
                target.write_pipe_async(request, endpoint, buffer, pipe_write_completion)
            }
        };

        if let Some(in_flight) = in_flight {
            in_flight.wait().await;
        }
    }

    async fn do_control_transfer(&self, target: &UsbTarget, request: Request) {
        let parts = request
            .context()
            .map(|ctx| (ctx.setup_packet, ctx.buffer.clone()));
        let Some((Some(setup), data)) = parts else {
            request.complete(Err(UsbError::InvalidParameter));
            return;
        };

        match target.control_transfer_async(request, setup, data, 0, control_completion) {
            Ok(in_flight) => in_flight.wait().await,
            Err(rejected) => {
                warn!(
                    "Control transfer for request {} refused: {}",
                    rejected.request.id(),
                    rejected.status
                );
                rejected.complete();
            }
        }
    }

    /// Handle a configuration request
    pub async fn config_control(self: Arc<Self>, request: Request) {
        let status = match request.io_control_code() {
            Some(IoControlCode::AbortPipe) => match decode_endpoint(request.input()) {
                Ok(endpoint) => {
                    self.run_blocking(move |target| target.abort_pipe(endpoint))
                        .await
                }
                Err(e) => Err(e),
            },
            Some(IoControlCode::ResetPipe) => match decode_endpoint(request.input()) {
                Ok(endpoint) => {
                    self.run_blocking(move |target| target.reset_pipe(endpoint))
                        .await
                }
                Err(e) => Err(e),
            },
            Some(IoControlCode::SetAltSetting) => match decode_alt_setting(request.input()) {
                Ok(idxs) => {
                    let _pause = self.data_gate.stop_sync().await;
                    debug!(
                        "Data queue stopped for setting {} on interface {}",
                        idxs.alt_setting_idx, idxs.interface_idx
                    );
                    self.run_blocking(move |target| {
                        target.set_interface_alt_setting(idxs.interface_idx, idxs.alt_setting_idx)
                    })
                    .await
                }
                Err(e) => Err(e.into()),
            },
            Some(IoControlCode::ResetDevice) => {
                self.run_blocking(|target| target.reset_device()).await
            }
            _ => {
                self.io_device_control(request);
                return;
            }
        };

        if let Err(e) = status {
            warn!(
                "Configuration request {:#x} failed: {}",
                request.code(),
                e
            );
        }
        request.complete(status);
    }

    async fn run_blocking<F>(self: &Arc<Self>, op: F) -> UsbStatus
    where
        F: FnOnce(&UsbTarget) -> UsbStatus + Send + 'static,
    {
        let strategy = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(strategy.target()?))
            .await
            .unwrap_or_else(|e| {
                error!("Blocking USB operation failed: {}", e);
                Err(UsbError::Unsuccessful)
            })
    }
}

impl Drop for RedirectorStrategy {
    fn drop(&mut self) {
        self.on_close();
    }
}

impl FilterStrategy for RedirectorStrategy {
    fn lower(&self) -> &dyn PnpDevice {
        &*self.lower
    }

    fn pnp_pre_process(&self, irp: &mut PnpIrp) {
        match irp.minor {
            PnpMinorFunction::QueryId => {
                post_process_on_success(self.lower(), irp, |irp| self.patch_query_id(irp))
            }
            PnpMinorFunction::QueryCapabilities => {
                post_process_on_success(self.lower(), irp, |irp| {
                    if let PnpInformation::Capabilities(caps) = &mut irp.information {
                        patch_capabilities(caps);
                    }
                })
            }
            _ => forward(self.lower(), irp),
        }
    }

    fn io_in_caller_context(&self, mut request: Request) -> Option<Request> {
        let write = match request.io_control_code() {
            Some(IoControlCode::ReadPipe) => false,
            Some(IoControlCode::WritePipe) => true,
            _ => return Some(request),
        };

        match prepare_transfer(&request, write) {
            Ok(context) => {
                request.set_context(context);
                Some(request)
            }
            Err(e) => {
                warn!("Rejecting transfer request {}: {}", request.id(), e);
                request.complete(Err(e));
                None
            }
        }
    }
}

fn decode_endpoint(input: &[u8]) -> UsbResult<u8> {
    let endpoint = decode_u64(input)?;
    u8::try_from(endpoint).map_err(|_| UsbError::NotFound)
}

/// Decode a transfer request and lock everything it points at
fn prepare_transfer(request: &Request, write: bool) -> UsbResult<TransferContext> {
    let transfer = decode_transfer_request(request.input())?;
    if request.output_len() < BYTES_TRANSFERRED_SIZE {
        return Err(UsbError::BufferTooSmall {
            needed: BYTES_TRANSFERRED_SIZE,
        });
    }

    // Endpoint addresses are one byte wide; anything larger names no pipe
    let endpoint = u8::try_from(transfer.endpoint_address).map_err(|_| UsbError::NotFound)?;
    let kind = transfer.kind().ok_or(UsbError::InvalidParameter)?;
    let length = usize::try_from(transfer.buffer_length).map_err(|_| UsbError::InvalidParameter)?;

    let lock_data = |address: u64, len: usize| {
        if write {
            request.lock_user_buffer_for_read(address, len)
        } else {
            request.lock_user_buffer_for_write(address, len)
        }
    };

    let mut context = TransferContext::new(kind, endpoint);
    match kind {
        TransferKind::Control => {
            if length < SetupPacket::SIZE {
                return Err(UsbError::InvalidParameter);
            }
            let raw = request.read_user(transfer.buffer, SetupPacket::SIZE)?;
            let setup = decode_setup_packet(&raw)?;

            let data_len = length - SetupPacket::SIZE;
            if data_len > 0 {
                let data = transfer
                    .buffer
                    .checked_add(SetupPacket::SIZE as u64)
                    .ok_or(UsbError::InvalidParameter)?;
                context.buffer = Some(match setup.direction() {
                    Direction::Out => request.lock_user_buffer_for_read(data, data_len)?,
                    Direction::In => request.lock_user_buffer_for_write(data, data_len)?,
                });
            }
            context.setup_packet = Some(setup);
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            context.buffer = Some(lock_data(transfer.buffer, length)?);
        }
        TransferKind::Isochronous => {
            let count = usize::try_from(transfer.iso_packets_array_size)
                .map_err(|_| UsbError::InvalidParameter)?;
            let sizes_len = count.checked_mul(8).ok_or(UsbError::InvalidParameter)?;
            let results_len = count
                .checked_mul(IsoTransferResult::SIZE)
                .ok_or(UsbError::InvalidParameter)?;

            context.buffer = Some(lock_data(transfer.buffer, length)?);
            context.iso_packets =
                Some(request.lock_user_buffer_for_read(transfer.iso_packets_array, sizes_len)?);
            context.iso_results =
                Some(request.lock_user_buffer_for_write(transfer.iso_results_array, results_len)?);
        }
    }
    Ok(context)
}

fn finish_transfer(
    mut request: Request,
    status: UsbStatus,
    usbd_status: UsbdStatus,
    transferred: u64,
) {
    let written = request.set_bytes_transferred(transferred);
    if let Err(e) = status {
        let endpoint = request.context().map(|ctx| ctx.endpoint_address);
        warn!(
            "Request {} on endpoint {:#04x} failed: {} (USBD status {:#010x}, {} bytes)",
            request.id(),
            endpoint.unwrap_or_default(),
            e,
            usbd_status.0,
            transferred
        );
    }
    request.complete(status.and(written));
}

fn unexpected_completion(request: Request, usb: &UsbCompletion) {
    error!(
        "Request {} got a mismatched completion: {:?}",
        request.id(),
        usb
    );
    request.complete(Err(UsbError::InvalidDeviceRequest));
}

fn pipe_read_completion(request: Request, params: CompletionParams) {
    match params.usb {
        UsbCompletion::PipeRead { length } => {
            finish_transfer(request, params.status, params.usbd_status, length as u64)
        }
        ref other => unexpected_completion(request, other),
    }
}

fn pipe_write_completion(request: Request, params: CompletionParams) {
    match params.usb {
        UsbCompletion::PipeWrite { length } => {
            finish_transfer(request, params.status, params.usbd_status, length as u64)
        }
        ref other => unexpected_completion(request, other),
    }
}

fn control_completion(request: Request, params: CompletionParams) {
    match params.usb {
        UsbCompletion::ControlTransfer { length } => {
            finish_transfer(request, params.status, params.usbd_status, length as u64)
        }
        ref other => unexpected_completion(request, other),
    }
}

/// Mirror packet results and report the summed length
///
/// When the URB does not carry one packet per result slot nothing is
/// mirrored and the request fails with `InvalidParameter`.
fn iso_completion(request: Request, params: CompletionParams) {
    let CompletionParams {
        status,
        usbd_status,
        usb,
    } = params;
    let urb = match usb {
        UsbCompletion::PipeUrb(urb) => urb,
        other => return unexpected_completion(request, &other),
    };

    let mirrored = match request.context().and_then(|ctx| ctx.iso_results.as_ref()) {
        Some(results) if results.len() / IsoTransferResult::SIZE == urb.packet_count() => urb
            .packets
            .iter()
            .enumerate()
            .try_for_each(|(index, packet)| {
                let record = IsoTransferResult {
                    actual_length: packet.actual_length as u64,
                    transfer_result: u64::from(packet.status.0),
                };
                results.write_at(index * IsoTransferResult::SIZE, &encode_iso_result(&record))
            }),
        Some(results) => {
            warn!(
                "Request {}: {} packets came back for {} result slots",
                request.id(),
                urb.packet_count(),
                results.len() / IsoTransferResult::SIZE
            );
            Err(UsbError::InvalidParameter)
        }
        None => Err(UsbError::InvalidParameter),
    };

    let status = match status {
        Ok(()) if !urb.header_status.is_success() => {
            debug!(
                "Request {}: URB failed with USBD status {:#010x}",
                request.id(),
                urb.header_status.0
            );
            Err(UsbError::InvalidDeviceRequest)
        }
        status => status,
    };
    let transferred = if mirrored.is_ok() { urb.transferred() } else { 0 };
    drop(urb);

    finish_transfer(request, mirrored.and(status), usbd_status, transferred);
}
