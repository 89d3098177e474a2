//! Root port state machine
//!
//! ```text
//!  DISCONNECTED ──attach──► DEBOUNCING ──debounce──► RESETTING ──enabled──► CONNECTED
//!       ▲                                                ▲                   │    ▲
//!       │                                                └──reset request────┘    │
//!       │                                                          suspend ▼      │ resume
//!       └──────────────── detach (from any state) ─────────────────  SUSPENDED ───┘
//!
//!  any ──over-current──► OVERCURRENT ──recover──► DISCONNECTED
//! ```
//!
//! Transitions are pure; the host controller performs the register work and
//! runs the debounce, reset and resume timers.

/// Root port state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortState {
    /// Nothing attached
    Disconnected,
    /// Device seen, waiting for the connection to settle
    Debouncing,
    /// Reset signalling in progress or waiting for the port to enable
    Resetting,
    /// Port enabled, device usable
    Connected,
    /// Port suspended
    Suspended,
    /// VBUS fault; nothing happens until recovery
    Overcurrent,
}

/// Speed of the attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceSpeed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
}

/// Inputs to the port state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortEvent {
    /// Connect status went high
    Attach,
    /// Connect status went low
    Detach,
    /// Connection stable for the debounce time
    DebounceElapsed,
    /// Reset asked for by the application
    ResetRequested,
    /// Port enable went high after reset
    Enabled,
    /// Suspend asked for by the application
    Suspend,
    /// Resume signalling finished
    ResumeElapsed,
    /// VBUS fault reported
    Overcurrent,
    /// Application cleared the fault
    Recover,
}

impl PortState {
    /// Next state for `event`; events that do not apply leave the state
    /// unchanged
    pub const fn next(self, event: PortEvent) -> Self {
        use PortEvent as E;
        use PortState as S;

        match (self, event) {
            (_, E::Overcurrent) => S::Overcurrent,
            (S::Overcurrent, E::Recover) => S::Disconnected,
            (S::Overcurrent, _) => S::Overcurrent,
            (_, E::Detach) => S::Disconnected,
            (S::Disconnected, E::Attach) => S::Debouncing,
            (S::Debouncing, E::DebounceElapsed) => S::Resetting,
            (S::Connected, E::ResetRequested) | (S::Suspended, E::ResetRequested) => S::Resetting,
            (S::Resetting, E::Enabled) => S::Connected,
            (S::Connected, E::Suspend) => S::Suspended,
            (S::Suspended, E::ResumeElapsed) => S::Connected,
            (state, _) => state,
        }
    }

    /// Whether traffic may be scheduled
    pub const fn is_connected(self) -> bool {
        matches!(self, PortState::Connected)
    }
}
