#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB device and host driver for the EFM32 full-speed OTG controller
//!
//! The controller is a DWC OTG core behind the EFM32 USB wrapper, run in
//! buffer-DMA mode. This crate is the protocol engine on top of it: the EP0
//! control state machine, data endpoint transfers, FIFO partitioning,
//! suspend and power-down handling, and (with the `host` feature) the host
//! channel scheduler and root port state machine.
//!
//! # Core Components
//!
//! - [`device`] - device controller, EP0 control state machine, chapter 9
//! - [`host`] - host channels, control messages, root port (feature `host`)
//! - [`endpoint`] - endpoint registry
//! - [`fifo`] - FIFO RAM partitioning
//! - [`power`] - suspend, power-down and register retention
//! - [`otg`] - register map and the [`otg::RegisterBlock`] access trait
//! - [`critical`] - interrupt exclusion for call-context API functions
//! - [`error`] - error taxonomy shared by both roles
//!
//! All register access goes through [`otg::RegisterBlock`], so the engine
//! runs unchanged against [`otg::Mmio`] on target and against a simulated
//! register file in tests.

#[cfg(feature = "defmt")]
use defmt as _;

pub mod config;
pub mod critical;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod fifo;
// Register and field names follow the reference manual
#[allow(missing_docs)]
pub mod otg;
pub mod power;
pub mod stats;
pub mod timing;
pub mod transfer;

#[cfg(feature = "host")]
pub mod host;
#[cfg(feature = "host")]
pub mod vbus;

pub use config::{DeviceConfig, HardwareLimits, PowerSaveMode};
pub use critical::{CriticalSection, InterruptGate, NoGate};
pub use device::{ControlBuffer, ControlEndpoint, DeviceCallbacks, DeviceState, SetupResult, UsbDevice};
pub use error::{Result, TransferStatus, UsbError};
pub use otg::{Mmio, RegisterBlock};
pub use power::{PowerHooks, PowerState};
pub use transfer::{Direction, DmaBuffer, EndpointAddress, SetupPacket, TransferComplete, TransferType};

#[cfg(feature = "host")]
pub use config::HostConfig;
#[cfg(feature = "host")]
pub use host::{ChannelId, ChannelScratch, ControlPipe, DeviceSpeed, HostEndpoint, PortState, UsbHost};
#[cfg(feature = "host")]
pub use vbus::{VbusPowerControl, VbusState};
