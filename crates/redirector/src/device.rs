//! Filter device
//!
//! Ties a [`RedirectorStrategy`] to its two queues. Read and write requests
//! go to the data queue, which dispatches in parallel behind the strategy's
//! data gate; everything else goes to the sequential configuration queue.

use crate::config::RedirectorSettings;
use crate::control_plane::ControlPlane;
use crate::device_access::DeviceAccess;
use crate::filter::FilterStrategy;
use crate::identity::DeviceIdentity;
use crate::queue::{DispatchMode, Handler, HandlerFuture, IoQueue, QueueGate};
use crate::request::Request;
use crate::strategy::{RedirectorState, RedirectorStrategy};
use common::{PnpDevice, PnpIrp, UsbBus};
use protocol::{IoControlCode, UsbError, UsbResult};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct FilterDevice {
    strategy: Arc<RedirectorStrategy>,
    data_queue: IoQueue,
    config_queue: IoQueue,
}

impl FilterDevice {
    /// Attach a redirector to the device below `lower` and `bus`
    ///
    /// Fails only when the device identity cannot be read. A target that
    /// cannot be configured leaves the filter attached but unavailable.
    pub async fn attach(
        settings: &RedirectorSettings,
        lower: Arc<dyn PnpDevice>,
        bus: Arc<dyn UsbBus>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> UsbResult<Self> {
        let access = DeviceAccess::new(Arc::clone(&lower));
        let identity = tokio::task::spawn_blocking(move || access.read_device_identity())
            .await
            .unwrap_or_else(|e| {
                error!("Identity query task failed: {}", e);
                Err(UsbError::Unsuccessful)
            })?;
        info!(
            "Attaching redirector {} to {}\\{}",
            settings.instance_number, identity.device_id, identity.instance_id
        );

        let strategy = Arc::new(RedirectorStrategy::new(
            lower,
            bus,
            control_plane,
            identity,
            settings.instance_number,
        ));

        let data_queue = IoQueue::spawn(
            "data",
            settings.queue_depth,
            DispatchMode::Parallel,
            strategy.data_gate().clone(),
            data_handler(&strategy),
        );
        let config_queue = IoQueue::spawn(
            "config",
            settings.queue_depth,
            DispatchMode::Sequential,
            QueueGate::new(),
            config_handler(&strategy),
        );

        let available = {
            let strategy = Arc::clone(&strategy);
            tokio::task::spawn_blocking(move || strategy.make_available())
                .await
                .unwrap_or_else(|e| {
                    error!("Target setup task failed: {}", e);
                    Err(UsbError::Unsuccessful)
                })
        };
        if let Err(e) = available {
            warn!(
                "Redirector attached to {} but not available: {}",
                strategy.identity().device_id,
                e
            );
        }

        Ok(Self {
            strategy,
            data_queue,
            config_queue,
        })
    }

    /// Accept a device-control request from a requester
    ///
    /// Transfer buffers are locked here, before the request is queued.
    pub fn submit(&self, request: Request) {
        let Some(request) = self.strategy.io_in_caller_context(request) else {
            return;
        };
        match request.io_control_code() {
            Some(code) if code.is_data_transfer() => self.data_queue.submit(request),
            _ => self.config_queue.submit(request),
        }
    }

    /// Pass a PnP request through the filter
    pub fn pnp(&self, irp: &mut PnpIrp) {
        self.strategy.pnp_pre_process(irp);
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.strategy.identity()
    }

    pub fn state(&self) -> RedirectorState {
        self.strategy.state()
    }

    /// Drain both queues and leave the control plane
    pub async fn close(self) {
        self.config_queue.shutdown().await;
        self.data_queue.shutdown().await;
        self.strategy.on_close();
        info!("Redirector for {} closed", self.strategy.identity().device_id);
    }
}

fn data_handler(strategy: &Arc<RedirectorStrategy>) -> Handler {
    let strategy = Arc::clone(strategy);
    Arc::new(move |request: Request| -> HandlerFuture {
        let strategy = Arc::clone(&strategy);
        Box::pin(async move {
            match request.io_control_code() {
                Some(IoControlCode::ReadPipe) => strategy.read_pipe(request).await,
                Some(IoControlCode::WritePipe) => strategy.write_pipe(request).await,
                _ => strategy.io_device_control(request),
            }
        })
    })
}

fn config_handler(strategy: &Arc<RedirectorStrategy>) -> Handler {
    let strategy = Arc::clone(strategy);
    Arc::new(move |request: Request| -> HandlerFuture {
        Box::pin(Arc::clone(&strategy).config_control(request))
    })
}
