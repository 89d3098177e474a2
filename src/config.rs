//! Driver configuration
//!
//! All configuration records are plain data built with const fns so they can
//! live in a `static`.

use crate::timing::DEFAULT_POLL_BUDGET;
use bitflags::bitflags;

/// Silicon limits of one controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HardwareLimits {
    /// IN endpoints besides EP0
    pub in_endpoints: u8,
    /// OUT endpoints besides EP0
    pub out_endpoints: u8,
    /// Dedicated TX FIFOs besides the EP0 FIFO
    pub tx_fifos: u8,
    /// Shared FIFO RAM in 32-bit words
    pub fifo_words: u16,
    /// Host channels
    pub host_channels: u8,
    /// Largest XFERSIZE the core accepts
    pub max_transfer_size: usize,
    /// Largest PKTCNT the core accepts
    pub max_packet_count: usize,
}

impl HardwareLimits {
    /// EFM32 Giant/Leopard/Wonder Gecko
    pub const EFM32GG: Self = Self {
        in_endpoints: 6,
        out_endpoints: 6,
        tx_fifos: 6,
        fifo_words: 512,
        host_channels: 14,
        max_transfer_size: 524_287,
        max_packet_count: 1023,
    };
}

impl Default for HardwareLimits {
    fn default() -> Self {
        Self::EFM32GG
    }
}

bitflags! {
    /// When the controller may drop into its powered-down state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PowerSaveMode: u8 {
        /// Power down when the bus suspends
        const ON_SUSPEND = 1 << 0;
        /// Power down when VBUS goes away
        const ON_VBUS_OFF = 1 << 1;
        /// Ask the system to enter deep sleep once powered down
        const ENTER_DEEP_SLEEP = 1 << 2;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PowerSaveMode {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "PowerSaveMode({=u8:#x})", self.bits())
    }
}

/// Device-mode configuration
///
/// Descriptor blobs are handed to the DMA engine as-is and must be
/// word-aligned (see [`crate::transfer::Aligned`]).
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Device descriptor
    pub device_descriptor: &'static [u8],
    /// Full configuration descriptor set
    pub config_descriptor: &'static [u8],
    /// String descriptors, index 0 is the language table
    pub strings: &'static [&'static [u8]],
    /// bConfigurationValue of the only configuration
    pub configuration_value: u8,
    /// EP0 max packet size (8, 16, 32 or 64)
    pub ep0_max_packet: u16,
    /// FIFO buffering multiplier for EP0
    pub ep0_buffering: u8,
    /// Answer for GET_STATUS when no callback reports power source
    pub self_powered: bool,
    /// Low-power policy
    pub power_save: PowerSaveMode,
    /// Iteration budget for hardware handshakes
    pub handshake_budget: u32,
    /// Silicon limits
    pub limits: HardwareLimits,
}

impl DeviceConfig {
    /// Configuration serving the given device and configuration descriptors
    pub const fn new(device_descriptor: &'static [u8], config_descriptor: &'static [u8]) -> Self {
        Self {
            device_descriptor,
            config_descriptor,
            strings: &[],
            configuration_value: 1,
            ep0_max_packet: 64,
            ep0_buffering: 1,
            self_powered: false,
            power_save: PowerSaveMode::empty(),
            handshake_budget: DEFAULT_POLL_BUDGET,
            limits: HardwareLimits::EFM32GG,
        }
    }

    /// String descriptors, indexed by string index
    pub const fn strings(mut self, strings: &'static [&'static [u8]]) -> Self {
        self.strings = strings;
        self
    }

    /// bConfigurationValue accepted by SET_CONFIGURATION
    pub const fn configuration_value(mut self, value: u8) -> Self {
        self.configuration_value = value;
        self
    }

    /// EP0 max packet size (8, 16, 32 or 64)
    pub const fn ep0_max_packet(mut self, size: u16) -> Self {
        self.ep0_max_packet = size;
        self
    }

    /// FIFO buffering multiplier for EP0
    pub const fn ep0_buffering(mut self, multiplier: u8) -> Self {
        self.ep0_buffering = multiplier;
        self
    }

    /// Self-powered answer used when the application gives none
    pub const fn self_powered(mut self, self_powered: bool) -> Self {
        self.self_powered = self_powered;
        self
    }

    /// Power-down policy
    pub const fn power_save(mut self, mode: PowerSaveMode) -> Self {
        self.power_save = mode;
        self
    }

    /// Iterations allowed for each hardware handshake
    pub const fn handshake_budget(mut self, iterations: u32) -> Self {
        self.handshake_budget = iterations;
        self
    }

    /// Override the hardware limits
    pub const fn limits(mut self, limits: HardwareLimits) -> Self {
        self.limits = limits;
        self
    }

    /// EP0 packet size code for DxEPCTL0.MPS, `None` for unsupported sizes
    pub const fn ep0_mps_code(&self) -> Option<u32> {
        use crate::otg::ep0_mps;
        match self.ep0_max_packet {
            8 => Some(ep0_mps::MPS_8),
            16 => Some(ep0_mps::MPS_16),
            32 => Some(ep0_mps::MPS_32),
            64 => Some(ep0_mps::MPS_64),
            _ => None,
        }
    }
}

/// Host-mode configuration
#[cfg(feature = "host")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostConfig {
    /// RX FIFO size in words
    pub rx_fifo_words: u16,
    /// Non-periodic TX FIFO size in words
    pub np_tx_fifo_words: u16,
    /// Periodic TX FIFO size in words
    pub p_tx_fifo_words: u16,
    /// Transaction errors tolerated before a transfer fails
    pub max_retries: u8,
    /// Attach debounce in ms
    pub debounce_ms: u32,
    /// Port reset signalling in ms
    pub reset_ms: u32,
    /// Resume signalling in ms
    pub resume_ms: u32,
    /// Iteration budget for hardware handshakes
    pub handshake_budget: u32,
    /// Silicon limits
    pub limits: HardwareLimits,
}

#[cfg(feature = "host")]
impl HostConfig {
    /// FIFO sizes in 32-bit words: RX, non-periodic TX, periodic TX
    pub const fn new(rx_fifo_words: u16, np_tx_fifo_words: u16, p_tx_fifo_words: u16) -> Self {
        Self {
            rx_fifo_words,
            np_tx_fifo_words,
            p_tx_fifo_words,
            max_retries: 3,
            debounce_ms: 100,
            reset_ms: 50,
            resume_ms: 20,
            handshake_budget: DEFAULT_POLL_BUDGET,
            limits: HardwareLimits::EFM32GG,
        }
    }

    /// Transaction errors tolerated before a transfer fails
    pub const fn max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Attach debounce time
    pub const fn debounce_ms(mut self, ms: u32) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Port reset signalling time
    pub const fn reset_ms(mut self, ms: u32) -> Self {
        self.reset_ms = ms;
        self
    }

    /// Resume signalling time
    pub const fn resume_ms(mut self, ms: u32) -> Self {
        self.resume_ms = ms;
        self
    }

    /// Iterations allowed for each hardware handshake
    pub const fn handshake_budget(mut self, iterations: u32) -> Self {
        self.handshake_budget = iterations;
        self
    }

    /// Override the hardware limits
    pub const fn limits(mut self, limits: HardwareLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Total FIFO demand in words
    pub const fn fifo_total(&self) -> u32 {
        self.rx_fifo_words as u32 + self.np_tx_fifo_words as u32 + self.p_tx_fifo_words as u32
    }
}

#[cfg(feature = "host")]
impl Default for HostConfig {
    fn default() -> Self {
        Self::new(256, 128, 128)
    }
}
