//! VBUS power switching for host mode
//!
//! The root port's 5 V supply is switched by a board-level load switch with
//! an over-current flag. [`GpioVbus`] drives that switch through
//! embedded-hal pins; [`NoVbusControl`] covers boards with VBUS hard-wired.

use crate::error::{Result, UsbError};
use embedded_hal::digital::{InputPin, OutputPin};

/// Consecutive asserted samples before over-current is believed
pub const OVERCURRENT_DEBOUNCE_SAMPLES: u8 = 5;

/// VBUS supply state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VbusState {
    /// Power off, ready to enable
    PowerOff,
    /// Power on, no fault
    PowerGood,
    /// Over-current fault latched; power is off until reset
    OverCurrentFault,
}

/// VBUS power control for the root port
pub trait VbusPowerControl {
    /// Switch VBUS on
    fn enable_vbus(&mut self) -> Result<()>;

    /// Switch VBUS off immediately
    fn disable_vbus(&mut self);

    /// Sample the over-current flag; latches the fault and removes power
    /// once it is confirmed
    fn is_overcurrent(&mut self) -> bool;

    /// Current supply state
    fn vbus_state(&self) -> VbusState;

    /// Clear a latched over-current fault, leaving power off
    fn reset_overcurrent(&mut self) -> Result<()>;
}

/// Load switch driven by GPIO
///
/// The enable pin is active high; the over-current flag is active low, as on
/// the usual USB power switches.
pub struct GpioVbus<EN, OC>
where
    EN: OutputPin,
    OC: InputPin,
{
    enable_pin: EN,
    oc_pin: OC,
    state: VbusState,
    debounce: u8,
    overcurrent_events: u16,
}

impl<EN, OC> GpioVbus<EN, OC>
where
    EN: OutputPin,
    OC: InputPin,
{
    /// Take the pins, starting with VBUS off
    pub fn new(mut enable_pin: EN, oc_pin: OC) -> Self {
        let _ = enable_pin.set_low();
        Self {
            enable_pin,
            oc_pin,
            state: VbusState::PowerOff,
            debounce: 0,
            overcurrent_events: 0,
        }
    }

    /// Over-current faults seen since creation
    pub fn overcurrent_events(&self) -> u16 {
        self.overcurrent_events
    }

    /// Release the pins
    pub fn release(self) -> (EN, OC) {
        (self.enable_pin, self.oc_pin)
    }

    fn sample_overcurrent(&mut self) -> bool {
        // Pin read errors count as over-current
        let asserted = self.oc_pin.is_low().unwrap_or(true);
        if asserted {
            self.debounce = self.debounce.saturating_add(1);
        } else {
            self.debounce = 0;
        }
        self.debounce >= OVERCURRENT_DEBOUNCE_SAMPLES
    }
}

impl<EN, OC> VbusPowerControl for GpioVbus<EN, OC>
where
    EN: OutputPin,
    OC: InputPin,
{
    fn enable_vbus(&mut self) -> Result<()> {
        match self.state {
            VbusState::PowerGood => Ok(()),
            VbusState::OverCurrentFault => Err(UsbError::PortOvercurrent),
            VbusState::PowerOff => {
                self.enable_pin.set_high().map_err(|_| UsbError::DeviceMalfunction)?;
                self.debounce = 0;
                self.state = VbusState::PowerGood;
                Ok(())
            }
        }
    }

    fn disable_vbus(&mut self) {
        let _ = self.enable_pin.set_low();
        self.debounce = 0;
        if self.state == VbusState::PowerGood {
            self.state = VbusState::PowerOff;
        }
    }

    fn is_overcurrent(&mut self) -> bool {
        match self.state {
            VbusState::OverCurrentFault => true,
            VbusState::PowerOff => false,
            VbusState::PowerGood => {
                if self.sample_overcurrent() {
                    let _ = self.enable_pin.set_low();
                    self.state = VbusState::OverCurrentFault;
                    self.overcurrent_events = self.overcurrent_events.saturating_add(1);

                    #[cfg(feature = "defmt")]
                    defmt::warn!("VBUS over-current");

                    true
                } else {
                    false
                }
            }
        }
    }

    fn vbus_state(&self) -> VbusState {
        self.state
    }

    fn reset_overcurrent(&mut self) -> Result<()> {
        if self.state == VbusState::OverCurrentFault {
            self.debounce = 0;
            self.state = VbusState::PowerOff;
        }
        Ok(())
    }
}

/// VBUS control for boards without VBUS switching
#[derive(Debug, Clone, Copy)]
pub struct NoVbusControl {
    state: VbusState,
}

impl Default for NoVbusControl {
    fn default() -> Self {
        Self { state: VbusState::PowerOff }
    }
}

impl VbusPowerControl for NoVbusControl {
    fn enable_vbus(&mut self) -> Result<()> {
        self.state = VbusState::PowerGood;
        Ok(())
    }

    fn disable_vbus(&mut self) {
        self.state = VbusState::PowerOff;
    }

    fn is_overcurrent(&mut self) -> bool {
        false
    }

    fn vbus_state(&self) -> VbusState {
        self.state
    }

    fn reset_overcurrent(&mut self) -> Result<()> {
        Ok(())
    }
}
