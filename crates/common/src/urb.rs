//! USB request blocks and their completion parameters
//!
//! A [`Urb`] is what a pipe or the control endpoint hands to the lower bus
//! stack. The lower stack answers every submitted URB exactly once with
//! [`CompletionParams`], or drops the completion sender when the transfer was
//! cancelled underneath us.

use crate::memory::LockedBuffer;
use protocol::{Direction, PipeType, SetupPacket, UsbError, UsbResult, UsbStatus, UsbdStatus};
use serde::{Deserialize, Serialize};

/// Configured endpoint as reported by the lower stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipeInfo {
    pub endpoint_address: u8,
    pub pipe_type: PipeType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl PipeInfo {
    pub fn new(endpoint_address: u8, pipe_type: PipeType, max_packet_size: u16) -> Self {
        Self {
            endpoint_address,
            pipe_type,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_endpoint(self.endpoint_address)
    }
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of the packet within the transfer buffer
    pub offset: usize,
    /// Requested size
    pub size: usize,
    /// Bytes actually moved, filled in by the lower stack
    pub actual_length: usize,
    pub status: UsbdStatus,
}

/// Isochronous URB with one entry per caller-supplied packet size
#[derive(Debug, Clone)]
pub struct IsochronousUrb {
    pub endpoint_address: u8,
    pub direction: Direction,
    pub buffer: LockedBuffer,
    pub packets: Vec<IsoPacket>,
    /// Overall URB status, independent of per-packet statuses
    pub header_status: UsbdStatus,
}

impl IsochronousUrb {
    /// Lay out packets back to back in `buffer`
    ///
    /// Zero packets, or sizes that do not fit the buffer, are rejected with
    /// `InvalidParameter`.
    pub fn new(
        endpoint_address: u8,
        direction: Direction,
        buffer: LockedBuffer,
        packet_sizes: &[u64],
    ) -> UsbResult<Self> {
        if packet_sizes.is_empty() {
            return Err(UsbError::InvalidParameter);
        }

        let mut packets = Vec::new();
        packets
            .try_reserve_exact(packet_sizes.len())
            .map_err(|_| UsbError::InsufficientResources)?;

        let mut offset = 0usize;
        for &size in packet_sizes {
            let size = usize::try_from(size).map_err(|_| UsbError::InvalidParameter)?;
            packets.push(IsoPacket {
                offset,
                size,
                actual_length: 0,
                status: UsbdStatus::ISO_NOT_ACCESSED_BY_HW,
            });
            offset = offset
                .checked_add(size)
                .ok_or(UsbError::InvalidParameter)?;
        }
        if offset > buffer.len() {
            return Err(UsbError::InvalidParameter);
        }

        Ok(Self {
            endpoint_address,
            direction,
            buffer,
            packets,
            header_status: UsbdStatus::PENDING,
        })
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Sum of per-packet actual lengths
    pub fn transferred(&self) -> u64 {
        self.packets.iter().map(|p| p.actual_length as u64).sum()
    }
}

/// Transfer handed to the lower bus stack
#[derive(Debug, Clone)]
pub enum Urb {
    /// Bulk or interrupt transfer on a configured pipe
    Pipe {
        pipe: PipeInfo,
        direction: Direction,
        buffer: LockedBuffer,
    },
    /// Control transfer on the default endpoint
    Control {
        setup: SetupPacket,
        buffer: Option<LockedBuffer>,
        /// Offset of the data stage within `buffer`
        offset: usize,
    },
    Isochronous(IsochronousUrb),
}

impl Urb {
    /// Endpoint the URB is addressed to (0 for the default control pipe)
    pub fn endpoint_address(&self) -> u8 {
        match self {
            Urb::Pipe { pipe, .. } => pipe.endpoint_address,
            Urb::Control { setup, .. } => match setup.direction() {
                Direction::In => 0x80,
                Direction::Out => 0x00,
            },
            Urb::Isochronous(iso) => iso.endpoint_address,
        }
    }

    /// Length of the data stage in bytes
    pub fn data_len(&self) -> usize {
        match self {
            Urb::Pipe { buffer, .. } => buffer.len(),
            Urb::Control { buffer, offset, .. } => buffer
                .as_ref()
                .map(|b| b.len().saturating_sub(*offset))
                .unwrap_or(0),
            Urb::Isochronous(iso) => iso.packets.iter().map(|p| p.size).sum(),
        }
    }
}

/// Transfer-type specific part of a completion
#[derive(Debug, Clone)]
pub enum UsbCompletion {
    PipeRead { length: usize },
    PipeWrite { length: usize },
    ControlTransfer { length: usize },
    /// The URB itself comes back so packet results can be mirrored
    PipeUrb(IsochronousUrb),
}

/// Completion parameters delivered for a submitted URB
#[derive(Debug, Clone)]
pub struct CompletionParams {
    /// Request-level status
    pub status: UsbStatus,
    /// Host controller status
    pub usbd_status: UsbdStatus,
    pub usb: UsbCompletion,
}

impl CompletionParams {
    pub fn new(status: UsbStatus, usbd_status: UsbdStatus, usb: UsbCompletion) -> Self {
        Self {
            status,
            usbd_status,
            usb,
        }
    }

    /// Completion for `urb` moving `length` bytes
    ///
    /// Isochronous URBs are returned as they are; their lengths live in the
    /// packets.
    pub fn for_urb(urb: Urb, status: UsbStatus, usbd_status: UsbdStatus, length: usize) -> Self {
        let usb = match urb {
            Urb::Pipe {
                direction: Direction::In,
                ..
            } => UsbCompletion::PipeRead { length },
            Urb::Pipe {
                direction: Direction::Out,
                ..
            } => UsbCompletion::PipeWrite { length },
            Urb::Control { .. } => UsbCompletion::ControlTransfer { length },
            Urb::Isochronous(iso) => UsbCompletion::PipeUrb(iso),
        };
        Self::new(status, usbd_status, usb)
    }

    /// Transferred length for non-isochronous completions
    pub fn length(&self) -> usize {
        match &self.usb {
            UsbCompletion::PipeRead { length }
            | UsbCompletion::PipeWrite { length }
            | UsbCompletion::ControlTransfer { length } => *length,
            UsbCompletion::PipeUrb(iso) => iso.transferred() as usize,
        }
    }
}
