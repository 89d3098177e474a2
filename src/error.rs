//! USB error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// Outcome delivered to a transfer completion callback
pub type TransferStatus = Result<()>;

/// USB error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// SETUP request was rejected by the request handler
    RequestError,
    /// Endpoint already has a transfer outstanding
    EndpointBusy,
    /// Nobody claimed the SETUP request
    RequestUnhandled,
    /// Call is out of contract (bad address, size, alignment, capacity)
    IllegalOperation,
    /// Endpoint is halted
    EndpointStalled,
    /// Transfer was aborted before completion
    EndpointAborted,
    /// Transfer failed on the wire
    EndpointError,
    /// Peer kept answering NAK until the transfer timed out
    EndpointNak,
    /// Device left (or never reached) the CONFIGURED state
    DeviceUnconfigured,
    /// Bus went into suspend
    DeviceSuspended,
    /// Bus reset by the host
    DeviceReset,
    /// Timeout waiting for completion
    Timeout,
    /// Device detached or VBUS lost
    DeviceRemoved,
    /// No free host channel, or channel already active
    HostChannelBusy,
    /// Device misbehaved beyond recovery
    DeviceMalfunction,
    /// Root port over-current condition
    PortOvercurrent,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestError => write!(f, "Request error"),
            Self::EndpointBusy => write!(f, "Endpoint busy"),
            Self::RequestUnhandled => write!(f, "Request unhandled"),
            Self::IllegalOperation => write!(f, "Illegal operation"),
            Self::EndpointStalled => write!(f, "Endpoint stalled"),
            Self::EndpointAborted => write!(f, "Transfer aborted"),
            Self::EndpointError => write!(f, "Endpoint error"),
            Self::EndpointNak => write!(f, "Endpoint NAK"),
            Self::DeviceUnconfigured => write!(f, "Device unconfigured"),
            Self::DeviceSuspended => write!(f, "Device suspended"),
            Self::DeviceReset => write!(f, "Device reset"),
            Self::Timeout => write!(f, "Timeout"),
            Self::DeviceRemoved => write!(f, "Device removed"),
            Self::HostChannelBusy => write!(f, "Host channel busy"),
            Self::DeviceMalfunction => write!(f, "Device malfunction"),
            Self::PortOvercurrent => write!(f, "Port over-current"),
        }
    }
}

impl UsbError {
    /// Errors that end an armed transfer because of a bus event rather than
    /// anything the transfer itself did
    pub const fn is_bus_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceReset | Self::DeviceSuspended | Self::DeviceRemoved | Self::DeviceUnconfigured
        )
    }
}
