//! Host channels
//!
//! A channel carries one logical endpoint's traffic. It is armed with a
//! whole transfer; the core splits it into packets and halts the channel
//! when the transfer completes or a transaction fails. The halt reason
//! decides between completing, retrying in place and retrying on the next
//! frame.

use crate::error::{TransferStatus, UsbError};
use crate::otg::{hctsiz, HcInt};
use crate::timing::SoftTimer;
use crate::transfer::{Completion, DmaBuffer, EndpointAddress, SetupPacket, TransferType};

/// Channels the register map provides for
pub const MAX_CHANNELS: usize = 16;

/// Handle for an assigned channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub(crate) u8);

impl ChannelId {
    /// Hardware channel number
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The two channels serving a control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlPipe {
    /// Channel carrying SETUP and OUT stages
    pub out: ChannelId,
    /// Channel carrying IN stages
    pub in_: ChannelId,
}

/// Packet identifier programmed into HCTSIZ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    /// DATA0 toggle
    Data0,
    /// DATA1 toggle
    Data1,
    /// DATA2 (isochronous only)
    Data2,
    /// SETUP token
    Setup,
}

impl Pid {
    /// Value for the HCTSIZ PID field
    pub const fn bits(self) -> u32 {
        let code = match self {
            Pid::Data0 => hctsiz::PID_DATA0,
            Pid::Data1 => hctsiz::PID_DATA1,
            Pid::Data2 => hctsiz::PID_DATA2,
            Pid::Setup => hctsiz::PID_SETUP,
        };
        code << hctsiz::PID_SHIFT
    }

    /// Next data toggle as left in HCTSIZ by the core
    pub const fn from_hctsiz(value: u32) -> Self {
        match (value & hctsiz::PID_MASK) >> hctsiz::PID_SHIFT {
            hctsiz::PID_DATA1 => Pid::Data1,
            hctsiz::PID_DATA2 => Pid::Data2,
            hctsiz::PID_SETUP => Pid::Setup,
            _ => Pid::Data0,
        }
    }
}

/// Endpoint on an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostEndpoint {
    /// Device address, 0 before SET_ADDRESS
    pub device_address: u8,
    /// Endpoint address on the device
    pub address: EndpointAddress,
    /// Transfer type
    pub transfer_type: TransferType,
    /// Max packet size
    pub max_packet_size: u16,
    /// Device is low speed
    pub low_speed: bool,
    /// Data toggle for the next transfer; kept across transfers
    pub toggle: Pid,
}

impl HostEndpoint {
    /// Full-speed endpoint description
    pub const fn new(
        device_address: u8,
        address: EndpointAddress,
        transfer_type: TransferType,
        max_packet_size: u16,
    ) -> Self {
        Self {
            device_address,
            address,
            transfer_type,
            max_packet_size,
            low_speed: false,
            toggle: Pid::Data0,
        }
    }

    /// Mark the device as low speed
    pub const fn low_speed(mut self, low_speed: bool) -> Self {
        self.low_speed = low_speed;
        self
    }
}

/// Control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    /// SETUP packet on the OUT channel
    Setup,
    /// Optional data stage
    Data,
    /// Zero-length status in the opposite direction
    Status,
}

/// Control message bookkeeping, kept on the pipe's OUT channel
#[derive(Clone, Copy)]
pub(crate) struct ControlTransfer {
    pub(crate) setup: SetupPacket,
    pub(crate) buffer: DmaBuffer,
    pub(crate) len: usize,
    pub(crate) stage: ControlStage,
    pub(crate) transferred: usize,
    pub(crate) in_channel: usize,
    pub(crate) timeout_ms: u32,
    pub(crate) callback: Option<Completion>,
}

/// Final result of a transfer run without a callback
pub type Outcome = (TransferStatus, usize, usize);

/// One hardware channel
#[derive(Clone)]
pub struct Channel {
    /// Endpoint served, `None` while free
    pub endpoint: Option<HostEndpoint>,
    /// A transfer or control stage is in flight
    pub active: bool,
    /// Bytes moved so far
    pub transferred: usize,
    /// Bytes still to move
    pub remaining: usize,
    /// Transaction errors since the last successful packet
    pub errors: u8,
    /// NAKs seen by the current transfer
    pub naks: u32,
    pub(crate) buffer: DmaBuffer,
    pub(crate) pid: Option<Pid>,
    pub(crate) armed: usize,
    pub(crate) callback: Option<Completion>,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) timer: SoftTimer,
    pub(crate) timeout_ms: u32,
    /// Frame number an interrupt-endpoint retry is waiting to leave
    pub(crate) retry_after_frame: Option<u16>,
    /// Control pipe OUT channel this stage belongs to
    pub(crate) control_owner: Option<usize>,
    pub(crate) control: Option<ControlTransfer>,
}

impl Channel {
    pub(crate) const fn new() -> Self {
        Self {
            endpoint: None,
            active: false,
            transferred: 0,
            remaining: 0,
            errors: 0,
            naks: 0,
            buffer: DmaBuffer::empty(),
            pid: None,
            armed: 0,
            callback: None,
            outcome: None,
            timer: SoftTimer::new(),
            timeout_ms: 0,
            retry_after_frame: None,
            control_owner: None,
            control: None,
        }
    }

    /// Whether no endpoint is assigned
    pub fn is_free(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Start bookkeeping for a new transfer or control stage
    pub(crate) fn begin(&mut self, buffer: DmaBuffer, len: usize, pid: Option<Pid>, timeout_ms: u32) {
        self.active = true;
        self.buffer = buffer;
        self.transferred = 0;
        self.remaining = len;
        self.errors = 0;
        self.naks = 0;
        self.pid = pid;
        self.armed = 0;
        self.outcome = None;
        self.timeout_ms = timeout_ms;
        self.retry_after_frame = None;
    }

    pub(crate) fn advance(&mut self, count: usize) {
        let count = count.min(self.remaining);
        self.transferred += count;
        self.remaining -= count;
    }

    /// Return to the assigned-but-idle state
    pub(crate) fn finish(&mut self) {
        self.active = false;
        self.armed = 0;
        self.timer.cancel();
        self.retry_after_frame = None;
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .field("active", &self.active)
            .field("transferred", &self.transferred)
            .field("remaining", &self.remaining)
            .field("errors", &self.errors)
            .field("naks", &self.naks)
            .finish()
    }
}

/// Action after a channel halt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HaltAction {
    /// Transfer (or stage) is over
    Complete(TransferStatus),
    /// Restart from the current position now
    Retry,
    /// Restart from the current position once the frame changes
    RetryNextFrame,
}

/// Retry policy for a halted channel
///
/// NAK on an interrupt endpoint is the device saying "nothing yet": it is
/// polled again next frame and never counted. Other NAKs restart in place.
/// Transaction and toggle errors count against `max_retries`; an ACK in the
/// same halt proves the link works and clears the count.
pub fn classify_halt(flags: HcInt, transfer_type: TransferType, errors: &mut u8, max_retries: u8) -> HaltAction {
    if flags.contains(HcInt::ACK) {
        *errors = 0;
    }

    if flags.contains(HcInt::XFERCOMPL) {
        HaltAction::Complete(Ok(()))
    } else if flags.contains(HcInt::STALL) {
        HaltAction::Complete(Err(UsbError::EndpointStalled))
    } else if flags.intersects(HcInt::BBLERR | HcInt::AHBERR) {
        HaltAction::Complete(Err(UsbError::EndpointError))
    } else if flags.intersects(HcInt::XACTERR | HcInt::DATATGLERR | HcInt::FRMOVRUN) {
        *errors = errors.saturating_add(1);
        if *errors >= max_retries {
            HaltAction::Complete(Err(UsbError::EndpointError))
        } else {
            HaltAction::Retry
        }
    } else if flags.contains(HcInt::NAK) {
        match transfer_type {
            TransferType::Interrupt => HaltAction::RetryNextFrame,
            _ => HaltAction::Retry,
        }
    } else {
        // Halted with no reason given
        HaltAction::Complete(Err(UsbError::EndpointError))
    }
}
