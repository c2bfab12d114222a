//! Generic filter behaviour
//!
//! A filter strategy sees every PnP request on its way down and every
//! device-control request in the caller's context. The default methods pass
//! PnP traffic through untouched and refuse device-control codes the
//! strategy does not handle.

use crate::request::Request;
use common::{PnpDevice, PnpIrp};
use protocol::UsbError;
use tracing::debug;

/// Send `irp` to the lower device and leave its answer as is
pub fn forward(lower: &dyn PnpDevice, irp: &mut PnpIrp) {
    lower.send_pnp(irp);
}

/// Send `irp` down and run `post` on it once the lower device succeeded
pub fn post_process_on_success<F>(lower: &dyn PnpDevice, irp: &mut PnpIrp, post: F)
where
    F: FnOnce(&mut PnpIrp),
{
    lower.send_pnp(irp);
    if irp.status.is_ok() {
        post(irp);
    }
}

pub trait FilterStrategy: Send + Sync {
    /// PnP device the filter is attached to
    fn lower(&self) -> &dyn PnpDevice;

    fn pnp_pre_process(&self, irp: &mut PnpIrp) {
        forward(self.lower(), irp);
    }

    /// Hook run synchronously in the requester's context before queuing
    ///
    /// Returns the request to queue, or `None` when the hook completed it.
    fn io_in_caller_context(&self, request: Request) -> Option<Request> {
        Some(request)
    }

    fn io_device_control(&self, request: Request) {
        debug!(
            "Unsupported device-control code {:#x} (request {})",
            request.code(),
            request.id()
        );
        request.complete(Err(UsbError::InvalidDeviceRequest));
    }
}
