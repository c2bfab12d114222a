//! USB Bridge Integration Tests
//!
//! Tests for the channel bridge between the redirector and the USB worker
//! thread, including transfers whose buffers live in a requester address
//! space.
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_bulk_data, with_timeout};
use common::{
    AddressSpace, CompletionParams, LockAccess, PipeInfo, Urb, UsbCommand, UsbEvent,
    create_usb_bridge,
};
use protocol::{PipeType, UsbError, UsbdStatus};
use std::thread;
use tokio::sync::oneshot;

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_select_setting_command_flow() {
    let (bridge, worker) = create_usb_bridge(8);

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("Failed to receive command");
        if let UsbCommand::SelectSetting {
            interface,
            alt_setting,
            response,
        } = cmd
        {
            assert_eq!((interface, alt_setting), (1, 2));
            response.send(Ok(())).expect("Failed to send");
            true
        } else {
            false
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::SelectSetting {
            interface: 1,
            alt_setting: 2,
            response: tx,
        })
        .await
        .expect("Failed to send command");

    assert_eq!(rx.await.expect("Failed to receive"), Ok(()));
    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_reset_pipe_error_flow() {
    let (bridge, worker) = create_usb_bridge(8);

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::ResetPipe { endpoint, response }) = worker.recv_command() {
            assert_eq!(endpoint, 0x81);
            let _ = response.send(Err(UsbError::Stall));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ResetPipe {
            endpoint: 0x81,
            response: tx,
        })
        .await
        .unwrap();

    assert_eq!(rx.await.unwrap(), Err(UsbError::Stall));
    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_submit_moves_data_into_locked_buffer() {
    let (bridge, worker) = create_usb_bridge(8);
    let space = AddressSpace::new();
    let base = space.map(vec![0; 32]);

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::Submit { urb, response }) = worker.recv_command() {
            if let Urb::Pipe { buffer, .. } = &urb {
                buffer.write_at(0, &create_mock_bulk_data(16)).unwrap();
            }
            let _ = response.send(CompletionParams::for_urb(
                urb,
                Ok(()),
                UsbdStatus::SUCCESS,
                16,
            ));
        }
    });

    let pipe = PipeInfo::new(0x81, PipeType::Bulk, 64);
    let buffer = space.lock(base, 32, LockAccess::Write).unwrap();
    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::Submit {
            urb: Urb::Pipe {
                pipe,
                direction: pipe.direction(),
                buffer,
            },
            response: tx,
        })
        .await
        .unwrap();

    let params = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .expect("Timed out")
        .expect("Completion dropped");
    assert_eq!(params.length(), 16);
    assert_eq!(space.read(base, 16).unwrap(), create_mock_bulk_data(16));
    assert_eq!(space.lock_count(base), 0);

    handle.join().unwrap();
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_usb_bridge(8);

    let handle = thread::spawn(move || {
        loop {
            match worker.recv_command() {
                Ok(UsbCommand::Shutdown) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    });

    bridge.send_command(UsbCommand::Shutdown).await.unwrap();
    assert!(handle.join().unwrap());
}

// ============================================================================
// Event and Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_device_gone_event_flow() {
    let (bridge, worker) = create_usb_bridge(8);

    thread::spawn(move || {
        worker.send_event(UsbEvent::DeviceGone).unwrap();
    });

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .expect("Timed out")
        .unwrap();
    assert_eq!(event, UsbEvent::DeviceGone);
}

#[tokio::test]
async fn test_worker_try_recv_non_blocking() {
    let (bridge, worker) = create_usb_bridge(8);
    assert!(worker.try_recv_command().is_none());

    bridge.try_send_command(UsbCommand::Shutdown).unwrap();
    assert!(matches!(
        worker.try_recv_command(),
        Some(UsbCommand::Shutdown)
    ));
}

#[tokio::test]
async fn test_bridge_sees_worker_drop() {
    let (bridge, worker) = create_usb_bridge(8);
    drop(worker);

    assert!(bridge.is_closed());
    assert!(bridge.send_command(UsbCommand::Shutdown).await.is_err());
    assert!(bridge.recv_event().await.is_err());
}

#[tokio::test]
async fn test_blocking_send_from_worker_pool() {
    let (bridge, worker) = create_usb_bridge(8);

    let sender = bridge.clone();
    tokio::task::spawn_blocking(move || {
        let (tx, _rx) = oneshot::channel();
        sender
            .send_command_blocking(UsbCommand::AbortPipe {
                endpoint: 0x02,
                response: tx,
            })
            .unwrap();
    })
    .await
    .unwrap();

    assert!(matches!(
        worker.try_recv_command(),
        Some(UsbCommand::AbortPipe { endpoint: 0x02, .. })
    ));
}
