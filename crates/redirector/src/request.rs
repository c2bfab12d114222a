//! Device-control requests
//!
//! A [`Request`] is owned by exactly one party at a time: the caller-context
//! hook, a queue, or the completion routine of the URB it was sent with.
//! Completing consumes it, so status and output are written once. A request
//! that is dropped without completing reports `Cancelled`.

use common::{AddressSpace, CompletionParams, LockAccess, LockedBuffer, Urb, UsbBus};
use protocol::{
    BYTES_TRANSFERRED_SIZE, IoControlCode, SetupPacket, TransferKind, UsbError, UsbResult,
    UsbStatus, decode_bytes_transferred,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Routine run when the lower stack completes a URB sent with a request
pub type CompletionRoutine = fn(Request, CompletionParams);

/// What the requester gets back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub status: UsbStatus,
    /// Bytes of `output` that are valid
    pub information: usize,
    pub output: Vec<u8>,
}

impl RequestOutcome {
    /// Transferred count written by a data transfer, zero when none was
    pub fn bytes_transferred(&self) -> u64 {
        decode_bytes_transferred(&self.output).unwrap_or(0)
    }
}

/// Per-request transfer context, filled once in caller context
#[derive(Debug)]
pub struct TransferContext {
    pub transfer_type: TransferKind,
    pub endpoint_address: u8,
    /// Data region; for control transfers the part after the setup packet
    pub buffer: Option<LockedBuffer>,
    pub setup_packet: Option<SetupPacket>,
    /// Packet sizes, `8 * count` bytes locked for read
    pub iso_packets: Option<LockedBuffer>,
    /// Packet results, `16 * count` bytes locked for write
    pub iso_results: Option<LockedBuffer>,
}

impl TransferContext {
    pub fn new(transfer_type: TransferKind, endpoint_address: u8) -> Self {
        Self {
            transfer_type,
            endpoint_address,
            buffer: None,
            setup_packet: None,
            iso_packets: None,
            iso_results: None,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    id: u64,
    code: u32,
    input: Vec<u8>,
    output: Vec<u8>,
    information: usize,
    address_space: AddressSpace,
    context: Option<TransferContext>,
    responder: Option<oneshot::Sender<RequestOutcome>>,
}

impl Request {
    /// Build a request carrying raw control code `code`
    ///
    /// The output buffer starts zeroed, so a request failed before any
    /// transfer reports a zero byte count.
    pub fn new(
        code: u32,
        input: Vec<u8>,
        output_len: usize,
        address_space: AddressSpace,
    ) -> (Request, PendingRequest) {
        let (tx, rx) = oneshot::channel();
        let request = Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            code,
            input,
            output: vec![0; output_len],
            information: 0,
            address_space,
            context: None,
            responder: Some(tx),
        };
        (request, PendingRequest { rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn io_control_code(&self) -> Option<IoControlCode> {
        IoControlCode::from_code(self.code)
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Validate and lock requester memory the redirector will read
    pub fn lock_user_buffer_for_read(&self, address: u64, len: usize) -> UsbResult<LockedBuffer> {
        self.address_space.lock(address, len, LockAccess::Read)
    }

    /// Validate and lock requester memory the redirector will write
    pub fn lock_user_buffer_for_write(&self, address: u64, len: usize) -> UsbResult<LockedBuffer> {
        self.address_space.lock(address, len, LockAccess::Write)
    }

    /// Fault-guarded copy out of requester memory
    pub fn read_user(&self, address: u64, len: usize) -> UsbResult<Vec<u8>> {
        self.address_space.read(address, len)
    }

    pub fn set_context(&mut self, context: TransferContext) {
        self.context = Some(context);
    }

    pub fn context(&self) -> Option<&TransferContext> {
        self.context.as_ref()
    }

    /// Write the 8-byte transferred count to the output buffer
    pub fn set_bytes_transferred(&mut self, bytes: u64) -> UsbStatus {
        let out = self
            .output
            .get_mut(..BYTES_TRANSFERRED_SIZE)
            .ok_or(UsbError::BufferTooSmall {
                needed: BYTES_TRANSFERRED_SIZE,
            })?;
        out.copy_from_slice(&bytes.to_le_bytes());
        self.information = BYTES_TRANSFERRED_SIZE;
        Ok(())
    }

    /// Complete with `status`, releasing every lock the request holds
    pub fn complete(mut self, status: UsbStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: UsbStatus) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        // Locks go before the requester can observe the outcome
        self.context = None;

        trace!("Request {} completed: {:?}", self.id, status);
        let outcome = RequestOutcome {
            status,
            information: self.information,
            output: std::mem::take(&mut self.output),
        };
        let _ = responder.send(outcome);
    }

    /// Submit `urb` and hand the request to `completion`
    ///
    /// On success the request belongs to the completion path: `completion`
    /// runs on a runtime worker once the lower stack answers, and a dropped
    /// answer completes the request with `Cancelled`. On failure the request
    /// comes back untouched together with the status.
    pub fn send_with_completion(
        self,
        bus: &dyn UsbBus,
        urb: Urb,
        completion: CompletionRoutine,
    ) -> Result<InFlight, Rejected> {
        let Ok(runtime) = Handle::try_current() else {
            error!("Request {} sent outside of a runtime", self.id);
            return Err(Rejected {
                request: self,
                status: UsbError::InvalidDeviceState,
            });
        };

        let receiver = match bus.submit(urb) {
            Ok(receiver) => receiver,
            Err(status) => {
                return Err(Rejected {
                    request: self,
                    status,
                });
            }
        };

        let handle = runtime.spawn(async move {
            match receiver.await {
                Ok(params) => completion(self, params),
                Err(_) => {
                    warn!("Request {} cancelled below the filter", self.id);
                    self.complete(Err(UsbError::Cancelled));
                }
            }
        });
        Ok(InFlight { handle })
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!("Request {} dropped without completion", self.id);
            self.finish(Err(UsbError::Cancelled));
        }
    }
}

/// A request the lower stack refused, handed back to its owner
#[derive(Debug)]
pub struct Rejected {
    pub request: Request,
    pub status: UsbError,
}

impl Rejected {
    /// Complete the refused request with the refusal status
    pub fn complete(self) {
        self.request.complete(Err(self.status));
    }
}

/// Handle on a request whose URB is with the lower stack
#[derive(Debug)]
pub struct InFlight {
    handle: JoinHandle<()>,
}

impl InFlight {
    /// Wait until the completion routine has run
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!("Completion task failed: {}", e);
        }
    }
}

/// Requester side of a request
#[derive(Debug)]
pub struct PendingRequest {
    rx: oneshot::Receiver<RequestOutcome>,
}

impl PendingRequest {
    pub async fn wait(self) -> RequestOutcome {
        self.rx.await.unwrap_or_else(|_| cancelled_outcome())
    }

    /// Wait from a thread outside the runtime
    pub fn blocking_wait(self) -> RequestOutcome {
        self.rx.blocking_recv().unwrap_or_else(|_| cancelled_outcome())
    }

    /// Outcome if the request has completed already
    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        self.rx.try_recv().ok()
    }
}

fn cancelled_outcome() -> RequestOutcome {
    RequestOutcome {
        status: Err(UsbError::Cancelled),
        information: 0,
        output: Vec::new(),
    }
}
