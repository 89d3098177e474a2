//! Host-mode interrupt service and software timers
//!
//! Port events come first so a detach fails channels before their halts are
//! looked at. Channel halts are classified by [`classify_halt`]; retries
//! re-arm the channel from its current position. Timers (debounce, reset,
//! resume and per-channel timeouts) are checked on every SOF and on every
//! [`UsbHost::poll`].

use super::{classify_halt, Channel, Controller, DeviceSpeed, HaltAction, Pid, PortEvent, PortState, UsbHost};
use crate::critical::{CriticalSection, InterruptGate};
use crate::error::UsbError;
use crate::otg::{self, hcfg, hctsiz, hfir, Gint, HcInt, Hprt, RegisterBlock};
use crate::timing::Clock;
use crate::transfer::packet_count;
use crate::vbus::VbusPowerControl;

impl<R: RegisterBlock, V: VbusPowerControl, K: Clock> Controller<R, V, K> {
    pub(crate) fn service(&mut self) {
        self.stats.record_interrupt();

        let status = Gint::from_bits_retain(self.regs.read(otg::GINTSTS) & self.regs.read(otg::GINTMSK));

        // PRTINT mirrors HPRT and clears with the port change bits
        if status.contains(Gint::PRTINT) {
            self.on_port_change();
        }

        if status.contains(Gint::DISCONNINT) {
            self.regs.write(otg::GINTSTS, Gint::DISCONNINT.bits());
            self.on_detach();
        }

        if status.contains(Gint::HCHINT) {
            let haint = self.regs.read(otg::HAINT) & self.regs.read(otg::HAINTMSK);
            for ch in 0..self.channels.len() {
                if haint & (1 << ch) != 0 {
                    self.on_channel_halt(ch);
                }
            }
        }

        if status.contains(Gint::SOF) {
            self.regs.write(otg::GINTSTS, Gint::SOF.bits());
            self.on_frame();
        }

        self.check_timers();
    }

    fn on_port_change(&mut self) {
        let hprt = Hprt::from_bits_retain(self.regs.read(otg::HPRT));
        self.ack_hprt(hprt.bits());

        if hprt.contains(Hprt::PRTOVRCURRCHNG) && hprt.contains(Hprt::PRTOVRCURRACT) {
            self.on_overcurrent();
            return;
        }

        if hprt.contains(Hprt::PRTCONNDET) && hprt.contains(Hprt::PRTCONNSTS) && self.port == PortState::Disconnected {
            let now = self.clock.now_ms();
            self.set_port(PortEvent::Attach);
            self.port_timer.start(now, self.config.debounce_ms);
        }

        if hprt.contains(Hprt::PRTENCHNG) {
            if hprt.contains(Hprt::PRTENA) {
                self.on_port_enabled(hprt);
            } else if self.port == PortState::Connected && hprt.contains(Hprt::PRTCONNSTS) {
                // Disabled by the core with the device still attached
                #[cfg(feature = "defmt")]
                defmt::warn!("Port disabled by hardware");

                self.fail_all(UsbError::DeviceMalfunction);
                self.speed = None;
                self.set_port(PortEvent::Detach);
            }
        }
    }

    fn on_port_enabled(&mut self, hprt: Hprt) {
        let code = (hprt.bits() & Hprt::PRTSPD_MASK.bits()) >> Hprt::PRTSPD_SHIFT;
        let (speed, clock, interval) = if code == Hprt::SPEED_LOW {
            (DeviceSpeed::Low, hcfg::FSLSPCLKSEL_6MHZ, hfir::FRINT_LS)
        } else {
            (DeviceSpeed::Full, hcfg::FSLSPCLKSEL_48MHZ, hfir::FRINT_FS)
        };
        self.regs.modify(otg::HCFG, |v| (v & !hcfg::FSLSPCLKSEL_MASK) | clock);
        self.regs.write(otg::HFIR, interval);
        self.speed = Some(speed);
        self.set_port(PortEvent::Enabled);

        #[cfg(feature = "defmt")]
        defmt::info!("Port enabled, {} speed", speed);
    }

    /// Device gone: every transfer fails and every channel is released
    fn on_detach(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::info!("Device detached");

        self.fail_all(UsbError::DeviceRemoved);
        for ch in 0..self.channels.len() {
            self.regs.write(otg::hcintmsk(ch), 0);
            let outcome = self.channels[ch].outcome.take();
            self.channels[ch] = Channel::new();
            // Blocking callers still collect their result
            self.channels[ch].outcome = outcome;
        }
        self.regs.write(otg::HAINTMSK, 0);
        self.port_timer.cancel();
        self.speed = None;
        self.set_port(PortEvent::Detach);
    }

    pub(crate) fn on_overcurrent(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::error!("Port over-current");

        self.vbus.disable_vbus();
        self.write_hprt(0, Hprt::PRTPWR.bits());
        self.fail_all(UsbError::PortOvercurrent);
        self.port_timer.cancel();
        self.speed = None;
        self.set_port(PortEvent::Overcurrent);
    }

    fn on_channel_halt(&mut self, ch: usize) {
        let flags = HcInt::from_bits_retain(self.regs.read(otg::hcint(ch)));
        self.regs.write(otg::hcint(ch), flags.bits());

        if !self.channels[ch].active {
            return;
        }

        let Some(endpoint) = self.channels[ch].endpoint else {
            return;
        };
        let hctsiz = self.regs.read(otg::hctsiz(ch));
        let residual = (hctsiz & hctsiz::XFERSIZE_MASK) as usize;
        let max_retries = self.config.max_retries;

        let c = &mut self.channels[ch];
        let moved = if endpoint.address.is_in() {
            c.armed.saturating_sub(residual)
        } else {
            // OUT progress is counted in whole acknowledged packets
            let packets_left = ((hctsiz & hctsiz::PKTCNT_MASK) >> hctsiz::PKTCNT_SHIFT) as usize;
            let mps = endpoint.max_packet_size as usize;
            let sent_packets = packet_count(c.armed, mps).saturating_sub(packets_left);
            (sent_packets * mps).min(c.armed)
        };
        let action = classify_halt(flags, endpoint.transfer_type, &mut c.errors, max_retries);
        c.advance(moved);
        let next = Pid::from_hctsiz(hctsiz);
        if c.control_owner.is_none() {
            if let Some(e) = c.endpoint.as_mut() {
                e.toggle = next;
            }
        } else {
            // Later packets of a control stage follow the core's toggle
            c.pid = Some(next);
        }

        match action {
            HaltAction::Complete(status) => self.finish_channel(ch, status),
            HaltAction::Retry => {
                if flags.intersects(HcInt::XACTERR | HcInt::DATATGLERR | HcInt::FRMOVRUN) {
                    self.stats.record_retry();

                    #[cfg(feature = "defmt")]
                    defmt::debug!("Channel {} retry {}", ch, self.channels[ch].errors);
                } else {
                    self.stats.record_nak();
                    self.channels[ch].naks = self.channels[ch].naks.saturating_add(1);
                }
                self.start_channel(ch);
            }
            HaltAction::RetryNextFrame => {
                // Polling NAKs are not failures; they only steer the timeout
                let frame = self.frame_number();
                let c = &mut self.channels[ch];
                c.naks = c.naks.saturating_add(1);
                c.retry_after_frame = Some(frame);
            }
        }
    }

    /// Route a finished channel to its transfer or its control message
    fn finish_channel(&mut self, ch: usize, status: crate::error::TransferStatus) {
        match self.channels[ch].control_owner {
            Some(owner) => self.control_stage_done(owner, ch, status),
            None => self.complete(ch, status),
        }
    }

    fn on_frame(&mut self) {
        let frame = self.frame_number();
        if frame == self.last_frame {
            return;
        }
        self.last_frame = frame;

        for ch in 0..self.channels.len() {
            let due = matches!(self.channels[ch].retry_after_frame, Some(parked) if parked != frame);
            if due && self.channels[ch].active {
                self.start_channel(ch);
            }
        }
    }

    pub(crate) fn check_timers(&mut self) {
        let now = self.clock.now_ms();

        if self.port != PortState::Overcurrent && self.vbus.is_overcurrent() {
            self.on_overcurrent();
            return;
        }

        if self.port_timer.poll(now) {
            self.on_port_timer();
        }

        for ch in 0..self.channels.len() {
            if self.channels[ch].active && self.channels[ch].timer.poll(now) {
                self.on_channel_timeout(ch);
            }
        }
    }

    fn on_port_timer(&mut self) {
        let hprt = Hprt::from_bits_retain(self.regs.read(otg::HPRT));
        match self.port {
            PortState::Debouncing => {
                if hprt.contains(Hprt::PRTCONNSTS) {
                    self.begin_reset();
                } else {
                    self.set_port(PortEvent::Detach);
                }
            }
            PortState::Resetting if hprt.contains(Hprt::PRTRST) => {
                self.write_hprt(0, Hprt::PRTRST.bits());
            }
            PortState::Suspended if hprt.contains(Hprt::PRTRES) => {
                self.write_hprt(0, (Hprt::PRTRES | Hprt::PRTSUSP).bits());
                self.set_port(PortEvent::ResumeElapsed);
            }
            _ => {}
        }
    }

    fn on_channel_timeout(&mut self, ch: usize) {
        let reason = if self.channels[ch].naks > 0 {
            UsbError::EndpointNak
        } else {
            UsbError::Timeout
        };

        #[cfg(feature = "defmt")]
        defmt::warn!("Channel {} timed out: {}", ch, reason);

        self.halt_hardware(ch);
        self.finish_channel(ch, Err(reason));
    }
}

impl<R, V, K, G> UsbHost<R, V, K, G>
where
    R: RegisterBlock,
    V: VbusPowerControl,
    K: Clock,
    G: InterruptGate,
{
    /// USB interrupt handler
    ///
    /// Call from the USB interrupt vector. Completion callbacks run from
    /// here.
    pub fn on_interrupt(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.service();
    }

    /// Run the software timers
    ///
    /// SOF interrupts already do this while a device is attached; call
    /// periodically so debounce and over-current sensing work without one.
    pub fn poll(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.check_timers();
    }
}
