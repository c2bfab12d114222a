//! I/O queues
//!
//! Each queue is a bounded `async_channel` drained by a dispatcher task.
//! Every dispatched request holds a read permit on the queue's
//! [`QueueGate`] until its handler returns; taking the write side stops
//! the queue once everything in flight has finished.

use crate::request::Request;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::UsbError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-request handler; the request is completed by the handler or by
/// whatever it hands the request to
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One request at a time
    Sequential,
    /// Each request runs in its own task
    Parallel,
}

/// Start/stop barrier over the requests a queue has dispatched
#[derive(Debug, Clone, Default)]
pub struct QueueGate {
    lock: Arc<RwLock<()>>,
}

impl QueueGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every dispatched request to finish and hold new ones back
    ///
    /// The queue restarts when the returned pause is dropped.
    pub async fn stop_sync(&self) -> QueuePause {
        QueuePause {
            _guard: Arc::clone(&self.lock).write_owned().await,
        }
    }
}

/// A stopped queue; dropping it starts the queue again
#[derive(Debug)]
pub struct QueuePause {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub struct IoQueue {
    name: &'static str,
    tx: Sender<Request>,
    dispatcher: JoinHandle<()>,
    gate: QueueGate,
}

impl IoQueue {
    /// Start a queue holding up to `depth` undispatched requests
    pub fn spawn(
        name: &'static str,
        depth: usize,
        mode: DispatchMode,
        gate: QueueGate,
        handler: Handler,
    ) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        let dispatcher = tokio::spawn(dispatch(name, rx, mode, gate.clone(), handler));
        debug!("Queue {} started ({:?}, depth {})", name, mode, depth);
        Self {
            name,
            tx,
            dispatcher,
            gate,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests waiting for dispatch
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Queue `request`, completing it at once when the queue cannot take it
    pub fn submit(&self, request: Request) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                warn!("Queue {} full, rejecting request {}", self.name, request.id());
                request.complete(Err(UsbError::InsufficientResources));
            }
            Err(TrySendError::Closed(request)) => {
                debug!("Queue {} closed, rejecting request {}", self.name, request.id());
                request.complete(Err(UsbError::InvalidDeviceState));
            }
        }
    }

    /// Stop accepting requests and wait until every queued and dispatched
    /// request has finished
    pub async fn shutdown(self) {
        if !self.is_empty() {
            debug!(
                "Queue {} closing with {} requests waiting",
                self.name(),
                self.len()
            );
        }
        self.tx.close();
        if let Err(e) = self.dispatcher.await {
            error!("Queue {} dispatcher failed: {}", self.name, e);
        }
        drop(self.gate.stop_sync().await);
        debug!("Queue {} drained", self.name);
    }
}

async fn dispatch(
    name: &'static str,
    rx: Receiver<Request>,
    mode: DispatchMode,
    gate: QueueGate,
    handler: Handler,
) {
    while let Ok(request) = rx.recv().await {
        let permit = Arc::clone(&gate.lock).read_owned().await;
        debug!("Queue {} dispatching request {}", name, request.id());

        let handling = handler(request);
        match mode {
            DispatchMode::Sequential => {
                handling.await;
                drop(permit);
            }
            DispatchMode::Parallel => {
                tokio::spawn(async move {
                    handling.await;
                    drop(permit);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AddressSpace;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
    use protocol::IoControlCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn new_request() -> (Request, crate::request::PendingRequest) {
        Request::new(
            IoControlCode::ResetDevice.code(),
            Vec::new(),
            0,
            AddressSpace::new(),
        )
    }

    fn completing_handler() -> Handler {
        Arc::new(|request: Request| -> HandlerFuture {
            Box::pin(async move { request.complete(Ok(())) })
        })
    }

    #[tokio::test]
    async fn test_requests_are_dispatched() {
        let queue = IoQueue::spawn(
            "test",
            4,
            DispatchMode::Sequential,
            QueueGate::new(),
            completing_handler(),
        );

        let (request, pending) = new_request();
        queue.submit(request);
        let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, pending.wait())
            .await
            .unwrap();
        assert_eq!(outcome.status, Ok(()));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let (tx, rx) = bounded::<Request>(1);
        rx.close();
        let queue = IoQueue {
            name: "closed",
            tx,
            dispatcher: tokio::spawn(async {}),
            gate: QueueGate::new(),
        };

        let (request, pending) = new_request();
        queue.submit(request);
        assert_eq!(pending.wait().await.status, Err(UsbError::InvalidDeviceState));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let gate = QueueGate::new();
        let pause = gate.stop_sync().await;
        let queue = IoQueue::spawn(
            "full",
            1,
            DispatchMode::Parallel,
            gate,
            completing_handler(),
        );

        // The dispatcher takes the first request and blocks on the gate
        let (first, first_pending) = new_request();
        queue.submit(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (second, _second_pending) = new_request();
        queue.submit(second);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
        assert_eq!(queue.name(), "full");
        let (third, third_pending) = new_request();
        queue.submit(third);

        assert_eq!(
            third_pending.wait().await.status,
            Err(UsbError::InsufficientResources)
        );
        drop(pause);
        assert_eq!(first_pending.wait().await.status, Ok(()));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_sync_waits_for_in_flight() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let handler: Handler = {
            let release = Arc::clone(&release);
            let finished = Arc::clone(&finished);
            Arc::new(move |request: Request| -> HandlerFuture {
                let release = Arc::clone(&release);
                let finished = Arc::clone(&finished);
                Box::pin(async move {
                    release.notified().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    request.complete(Ok(()));
                })
            })
        };

        let gate = QueueGate::new();
        let queue = IoQueue::spawn("data", 8, DispatchMode::Parallel, gate.clone(), handler);
        let (request, pending) = new_request();
        queue.submit(request);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopping = tokio::spawn({
            let gate = gate.clone();
            let finished = Arc::clone(&finished);
            async move {
                let _pause = gate.stop_sync().await;
                finished.load(Ordering::SeqCst)
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        release.notify_one();
        let seen = with_timeout(DEFAULT_TEST_TIMEOUT, stopping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(pending.wait().await.status, Ok(()));
        queue.shutdown().await;
    }
}
