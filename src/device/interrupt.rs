//! Device-mode interrupt dispatch
//!
//! Events are taken in a fixed order: VBUS changes from the wrapper, then
//! wake events (which must restore a powered-down core before anything else
//! touches it), suspend, start of frame, enumeration done, bus reset and
//! finally per-endpoint events. Every handler clears only the flags it
//! consumed.

use super::transfer::EP0_DAINT_BITS;
use super::{DeviceCallbacks, DeviceState, Engine, UsbDevice, ENUMERATION_MASK};
use crate::config::PowerSaveMode;
use crate::critical::{CriticalSection, InterruptGate};
use crate::error::UsbError;
use crate::otg::{self, dcfg, dsts, Dctl, DepCtl, DiepInt, DoepInt, Gint, RegisterBlock, WrapperStatus};
use crate::power::{PowerHooks, PowerState};
use crate::transfer::{Direction, EndpointAddress};

impl<R: RegisterBlock> Engine<R> {
    pub(crate) fn dispatch(&mut self, callbacks: &mut dyn DeviceCallbacks, hooks: &mut dyn PowerHooks) {
        self.stats.record_interrupt();

        let wrapper = self.regs.read(otg::IF) & self.regs.read(otg::IEN);
        if wrapper != 0 {
            self.regs.write(otg::IFC, wrapper);
            self.on_vbus_change(callbacks, hooks);
        }

        let status = Gint::from_bits_retain(self.regs.read(otg::GINTSTS) & self.regs.read(otg::GINTMSK));

        if status.contains(Gint::RESETDET) {
            self.regs.write(otg::GINTSTS, Gint::RESETDET.bits());
            self.power.exit_power_down(&self.regs, hooks);
        }

        if status.contains(Gint::WKUPINT) {
            self.regs.write(otg::GINTSTS, Gint::WKUPINT.bits());
            self.on_wakeup(callbacks, hooks);
        }

        if status.contains(Gint::USBSUSP) {
            self.regs.write(otg::GINTSTS, Gint::USBSUSP.bits());
            if self.on_suspend(callbacks, hooks) {
                // Core is down; the remaining flags are lost with it
                return;
            }
        }

        if status.contains(Gint::SOF) {
            self.regs.write(otg::GINTSTS, Gint::SOF.bits());
            let frame = (self.regs.read(otg::DSTS) & dsts::SOFFN_MASK) >> dsts::SOFFN_SHIFT;
            callbacks.on_start_of_frame(frame as u16);
        }

        if status.contains(Gint::ENUMDONE) {
            self.regs.write(otg::GINTSTS, Gint::ENUMDONE.bits());
            self.on_enumeration_done();
        }

        if status.contains(Gint::USBRST) {
            self.regs.write(otg::GINTSTS, Gint::USBRST.bits());
            self.on_bus_reset(callbacks, !status.contains(Gint::ENUMDONE));
        }

        if status.contains(Gint::IEPINT) {
            self.on_in_endpoints();
        }

        if status.contains(Gint::OEPINT) {
            self.on_out_endpoints(callbacks);
        }
    }

    fn on_vbus_change(&mut self, callbacks: &mut dyn DeviceCallbacks, hooks: &mut dyn PowerHooks) {
        if self.regs.read(otg::STATUS) & WrapperStatus::VREGOS.bits() != 0 {
            #[cfg(feature = "defmt")]
            defmt::info!("VBUS present");

            self.power.exit_power_down(&self.regs, hooks);
            if self.state == DeviceState::None {
                self.set_state(DeviceState::Powered, callbacks);
            }
            self.regs.clear_bits(otg::DCTL, Dctl::SFTDISCON.bits());
            return;
        }

        #[cfg(feature = "defmt")]
        defmt::info!("VBUS removed");

        if self.state != DeviceState::None {
            self.abort_many(UsbError::DeviceRemoved, true);
            self.address = 0;
            self.configuration = 0;
            self.remote_wakeup_enabled = false;
            self.set_state(DeviceState::None, callbacks);
        }

        let power_save = self.config.power_save;
        if power_save.contains(PowerSaveMode::ON_VBUS_OFF) {
            let limits = self.config.limits;
            let deep_sleep = power_save.contains(PowerSaveMode::ENTER_DEEP_SLEEP);
            self.power.enter_power_down(&self.regs, &limits, hooks, deep_sleep);
        }
    }

    fn on_wakeup(&mut self, callbacks: &mut dyn DeviceCallbacks, hooks: &mut dyn PowerHooks) {
        self.power.exit_power_down(&self.regs, hooks);
        if self.state == DeviceState::Suspended {
            let resumed = self.saved_state;
            self.set_state(resumed, callbacks);
        }
        self.power.resume();

        #[cfg(feature = "defmt")]
        defmt::debug!("USB resume");
    }

    /// Returns `true` if the core was powered down
    fn on_suspend(&mut self, callbacks: &mut dyn DeviceCallbacks, hooks: &mut dyn PowerHooks) -> bool {
        if !matches!(
            self.state,
            DeviceState::Default | DeviceState::Addressed | DeviceState::Configured
        ) {
            return false;
        }

        self.stats.record_suspend();
        self.abort_many(UsbError::DeviceSuspended, true);
        self.set_state(DeviceState::Suspended, callbacks);
        self.power.suspend();

        #[cfg(feature = "defmt")]
        defmt::debug!("USB suspend");

        let power_save = self.config.power_save;
        if power_save.contains(PowerSaveMode::ON_SUSPEND) {
            let limits = self.config.limits;
            let deep_sleep = power_save.contains(PowerSaveMode::ENTER_DEEP_SLEEP);
            self.power.enter_power_down(&self.regs, &limits, hooks, deep_sleep);
        }
        self.power.state() == PowerState::PoweredDown
    }

    /// `reduce_mask` drops back to the enumeration interrupt set; it is
    /// skipped when enumeration already finished in the same pass
    fn on_bus_reset(&mut self, callbacks: &mut dyn DeviceCallbacks, reduce_mask: bool) {
        #[cfg(feature = "defmt")]
        defmt::info!("USB bus reset");

        self.stats.record_bus_reset();
        self.regs.clear_bits(otg::DCTL, Dctl::RMTWKUPSIG.bits());

        self.abort_many(UsbError::DeviceReset, true);
        self.deactivate_hardware();

        let limits = self.config.limits;
        for ep in 0..=limits.in_endpoints as usize {
            self.regs.write(otg::diepint(ep), 0xFFFF);
        }
        for ep in 0..=limits.out_endpoints as usize {
            self.regs.write(otg::doepint(ep), 0xFFFF);
        }
        let snak = |v: u32| (v & !DepCtl::ONE_SHOT.bits()) | DepCtl::SNAK.bits();
        self.regs.modify(otg::diepctl(0), snak);
        self.regs.modify(otg::doepctl(0), snak);

        self.regs.modify(otg::DCFG, |v| v & !dcfg::DAD_MASK);
        self.address = 0;
        self.configuration = 0;
        self.remote_wakeup_enabled = false;

        self.set_state(DeviceState::Default, callbacks);
        callbacks.on_reset();

        if reduce_mask {
            self.regs.write(otg::GINTMSK, ENUMERATION_MASK.bits());
        }
        self.power.resume();
    }

    fn on_enumeration_done(&mut self) {
        let mps_code = self.config.ep0_mps_code().unwrap_or(otg::ep0_mps::MPS_64);
        // EP0 encodes its packet size in the two low MPS bits
        let program = |v: u32| (v & !(DepCtl::ONE_SHOT.bits() | 0x3)) | mps_code;
        self.regs.modify(otg::diepctl(0), program);
        self.regs.modify(otg::doepctl(0), program);

        self.regs.set_bits(otg::DAINTMSK, EP0_DAINT_BITS);
        self.regs.write(otg::DIEPMSK, DiepInt::XFERCOMPL.bits());
        self.regs.write(otg::DOEPMSK, (DoepInt::XFERCOMPL | DoepInt::SETUP).bits());

        self.ep0_arm_setup();
        self.regs.write(otg::GINTMSK, self.standard_mask());

        #[cfg(feature = "defmt")]
        defmt::debug!("Enumeration done");
    }

    fn on_in_endpoints(&mut self) {
        let daint = self.regs.read(otg::DAINT) & self.regs.read(otg::DAINTMSK);
        let mask = self.regs.read(otg::DIEPMSK);

        for number in 0..16usize {
            if daint & (1 << number) == 0 {
                continue;
            }
            let flags = self.regs.read(otg::diepint(number)) & mask;
            self.regs.write(otg::diepint(number), flags);
            if flags & DiepInt::XFERCOMPL.bits() == 0 {
                continue;
            }

            if number == 0 {
                self.ep0_in_complete();
            } else if let Some(index) = self.endpoints.index_of(EndpointAddress::new(number as u8, Direction::In)) {
                self.data_in_complete(index);
            }
        }
    }

    fn on_out_endpoints(&mut self, callbacks: &mut dyn DeviceCallbacks) {
        let daint = (self.regs.read(otg::DAINT) & self.regs.read(otg::DAINTMSK)) >> 16;
        let mask = self.regs.read(otg::DOEPMSK);

        for number in 0..16usize {
            if daint & (1 << number) == 0 {
                continue;
            }

            if number == 0 {
                self.on_ep0_out(callbacks);
                continue;
            }

            let flags = self.regs.read(otg::doepint(number)) & mask;
            self.regs.write(otg::doepint(number), flags);
            if flags & DoepInt::XFERCOMPL.bits() != 0 {
                if let Some(index) = self.endpoints.index_of(EndpointAddress::new(number as u8, Direction::Out)) {
                    self.data_out_complete(index);
                }
            }
        }
    }

    /// OUT EP0: a SETUP lands as "packet received" plus transfer complete,
    /// and is consumed only when the SETUP phase is done
    fn on_ep0_out(&mut self, callbacks: &mut dyn DeviceCallbacks) {
        let flags = DoepInt::from_bits_retain(self.regs.read(otg::doepint(0)));

        if flags.contains(DoepInt::SETUP) {
            self.regs.write(
                otg::doepint(0),
                (DoepInt::SETUP | DoepInt::STUPPKTRCVD | DoepInt::XFERCOMPL).bits(),
            );
            self.handle_setup(callbacks);
        } else if flags.contains(DoepInt::XFERCOMPL) {
            self.regs.write(otg::doepint(0), DoepInt::XFERCOMPL.bits());
            if !flags.contains(DoepInt::STUPPKTRCVD) {
                self.ep0_out_complete();
            }
        }
    }
}

impl<R, C, P, G> UsbDevice<R, C, P, G>
where
    R: RegisterBlock,
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    /// USB interrupt handler
    ///
    /// Call from the USB interrupt vector. Completion and SETUP callbacks
    /// run from here.
    pub fn on_interrupt(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.dispatch(&mut self.callbacks, &mut self.hooks);
    }
}
