//! Channel bridge between the redirector and the USB worker thread
//!
//! The device handle lives on a dedicated blocking thread. Callers hand it
//! [`UsbCommand`]s over a bounded `async_channel` and get their answer back on
//! a oneshot; the worker reports asynchronous conditions as [`UsbEvent`]s.

use crate::urb::{CompletionParams, Urb};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{UsbResult, UsbStatus};
use tokio::sync::oneshot;

/// Default capacity of the command and event channels
pub const DEFAULT_CHANNEL_DEPTH: usize = 256;

/// Commands from the redirector to the USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Select the active configuration, answering with the interface count
    SelectConfiguration {
        response: oneshot::Sender<UsbResult<u8>>,
    },

    /// Select an alternate setting on an interface
    SelectSetting {
        interface: u8,
        alt_setting: u8,
        response: oneshot::Sender<UsbStatus>,
    },

    /// Abort outstanding transfers on an endpoint
    AbortPipe {
        endpoint: u8,
        response: oneshot::Sender<UsbStatus>,
    },

    /// Clear a halt condition on an endpoint
    ResetPipe {
        endpoint: u8,
        response: oneshot::Sender<UsbStatus>,
    },

    /// Read a whole configuration descriptor
    ReadConfigDescriptor {
        index: u8,
        response: oneshot::Sender<UsbResult<Vec<u8>>>,
    },

    /// Reset the port so the device re-enumerates
    CyclePort {
        response: oneshot::Sender<UsbStatus>,
    },

    /// Execute a transfer
    Submit {
        urb: Urb,
        response: oneshot::Sender<CompletionParams>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

impl UsbCommand {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            UsbCommand::SelectConfiguration { .. } => "select-configuration",
            UsbCommand::SelectSetting { .. } => "select-setting",
            UsbCommand::AbortPipe { .. } => "abort-pipe",
            UsbCommand::ResetPipe { .. } => "reset-pipe",
            UsbCommand::ReadConfigDescriptor { .. } => "read-config-descriptor",
            UsbCommand::CyclePort { .. } => "cycle-port",
            UsbCommand::Submit { .. } => "submit",
            UsbCommand::Shutdown => "shutdown",
        }
    }
}

/// Events from the USB thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// The device stopped answering and the worker gave up on it
    DeviceGone,
}

/// Redirector side of the bridge
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command from a blocking context
    pub fn send_command_blocking(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Queue a command without waiting for room in the channel
    pub fn try_send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(cmd) => {
                crate::Error::Channel(format!("command queue full ({})", cmd.name()))
            }
            TrySendError::Closed(cmd) => {
                crate::Error::Channel(format!("USB thread gone ({})", cmd.name()))
            }
        })
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the USB thread has dropped its end
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// USB thread side of the bridge
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for the USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to the redirector (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge with `depth` slots per direction
///
/// Returns (UsbBridge for the redirector, UsbWorker for the USB thread)
pub fn create_usb_bridge(depth: usize) -> (UsbBridge, UsbWorker) {
    let depth = depth.max(1);
    let (cmd_tx, cmd_rx) = bounded(depth);
    let (event_tx, event_rx) = bounded(depth);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
