//! EP0 control transfer state machine
//!
//! ```text
//!            SETUP
//!   IDLE ──────────────┬───────────────┬──────────────┐
//!    ▲                 ▼               ▼              ▼
//!    │           TRANSMITTING      RECEIVING      STATUS_IN
//!    │            (IN data)        (OUT data)     (no data)
//!    │                 │               │              │
//!    │                 ▼               ▼              │
//!    │            STATUS_OUT       STATUS_IN          │
//!    └─────────────────┴───────────────┴──────────────┘
//! ```
//!
//! EP0 moves one packet per arm. Every return to IDLE re-arms OUT EP0 for
//! SETUP reception; the SETUP ring is three packets deep so back-to-back
//! SETUPs are never dropped. The core reports SETUP with a distinct
//! "SETUP packet received" event followed by "SETUP phase done"; the packet
//! is consumed on the latter.

use super::{ch9, ControlEndpoint, DeviceCallbacks, DeviceState, Engine, SetupResult, SETUP_RING_SLOTS};
use crate::endpoint::{EndpointState, Zlp};
use crate::error::{Result, TransferStatus, UsbError};
use crate::otg::{self, deptsiz, DepCtl, RegisterBlock};
use crate::transfer::{packet_count, Completion, DmaBuffer, EndpointAddress, RequestType, SetupPacket};

/// Ring slot holding the newest SETUP packet, given the SUPCNT left in
/// DOEPTSIZ0
///
/// SUPCNT starts at 3 and counts down per packet; a value of 3 can only be
/// seen if the event raced the counter update, and is treated as one packet.
pub(crate) const fn setup_slot(supcnt: u32) -> usize {
    let remaining = if supcnt > 2 { 2 } else { supcnt };
    2 - remaining as usize
}

/// Whether an IN data stage of `len` bytes against a request for
/// `requested` bytes must end with a zero-length packet
pub(crate) const fn needs_zlp(len: usize, requested: usize, max_packet_size: usize) -> bool {
    len != 0 && len < requested && max_packet_size != 0 && len % max_packet_size == 0
}

impl<R: RegisterBlock> Engine<R> {
    fn ep0_mps(&self) -> usize {
        self.endpoints.ep0().max_packet_size as usize
    }

    /// Arm OUT EP0 for SETUP reception (also accepts a status ZLP)
    pub(crate) fn ep0_arm_setup(&mut self) {
        let ring = self.setup_ring_address();
        self.regs.write(
            otg::doeptsiz(0),
            ((SETUP_RING_SLOTS as u32) << deptsiz::SUPCNT_SHIFT)
                | (1 << deptsiz::PKTCNT_SHIFT)
                | (SETUP_RING_SLOTS * SetupPacket::SIZE) as u32,
        );
        self.regs.write_dma_address(otg::doepdma(0), ring);
        self.regs.modify(otg::doepctl(0), |v| {
            (v & !DepCtl::ONE_SHOT.bits()) | (DepCtl::CNAK | DepCtl::EPENA).bits()
        });
    }

    /// Back to IDLE, ready for the next SETUP
    pub(crate) fn ep0_to_idle(&mut self) {
        self.endpoints.ep0_mut().state = EndpointState::Idle;
        self.ep0_arm_setup();
    }

    /// Queue one IN packet of `len` bytes from the current position
    fn ep0_start_in(&mut self, len: usize) {
        let address = {
            let ep0 = self.endpoints.ep0_mut();
            ep0.armed = len;
            if len == 0 {
                None
            } else {
                Some(ep0.buffer.address_at(ep0.transferred))
            }
        };
        let address = address.unwrap_or_else(|| self.setup_ring_address());

        self.regs.write(otg::dieptsiz(0), (1 << deptsiz::PKTCNT_SHIFT) | len as u32);
        self.regs.write_dma_address(otg::diepdma(0), address);
        self.regs.modify(otg::diepctl(0), |v| {
            (v & !DepCtl::ONE_SHOT.bits()) | (DepCtl::CNAK | DepCtl::EPENA).bits()
        });
    }

    /// Queue reception of one OUT packet
    fn ep0_start_out(&mut self) {
        let mps = self.ep0_mps();
        let address = {
            let ep0 = self.endpoints.ep0_mut();
            ep0.armed = mps;
            ep0.buffer.address_at(ep0.transferred)
        };

        self.regs.write(
            otg::doeptsiz(0),
            ((SETUP_RING_SLOTS as u32) << deptsiz::SUPCNT_SHIFT) | (1 << deptsiz::PKTCNT_SHIFT) | mps as u32,
        );
        self.regs.write_dma_address(otg::doepdma(0), address);
        self.regs.modify(otg::doepctl(0), |v| {
            (v & !DepCtl::ONE_SHOT.bits()) | (DepCtl::CNAK | DepCtl::EPENA).bits()
        });
    }

    /// Send the zero-length IN status packet
    fn ep0_status_in(&mut self) {
        self.endpoints.ep0_mut().state = EndpointState::StatusIn;
        self.ep0_start_in(0);
    }

    /// IN data stage
    pub(crate) fn ep0_write(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()> {
        buffer.check_source(len)?;
        if !self.endpoints.ep0().is_idle() {
            return Err(UsbError::EndpointBusy);
        }

        let requested = self.setup.length as usize;
        let len = len.min(requested);
        let mps = self.ep0_mps();

        let ep0 = self.endpoints.ep0_mut();
        ep0.address = EndpointAddress::EP0_IN;
        if len == 0 {
            ep0.begin(EndpointState::StatusIn, buffer, 0, callback);
            self.ep0_start_in(0);
            return Ok(());
        }

        ep0.begin(EndpointState::Transmitting, buffer, len, callback);
        if needs_zlp(len, requested, mps) {
            ep0.zlp = Zlp::Pending;
        }
        self.ep0_start_in(len.min(mps));
        Ok(())
    }

    /// OUT data stage
    pub(crate) fn ep0_read(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()> {
        let mps = self.ep0_mps();
        let len = len.min(self.setup.length as usize);
        if len > 0 {
            buffer.check_sink(packet_count(len, mps) * mps)?;
        }
        if !self.endpoints.ep0().is_idle() {
            return Err(UsbError::EndpointBusy);
        }

        let ep0 = self.endpoints.ep0_mut();
        ep0.address = EndpointAddress::EP0_OUT;
        if len == 0 {
            ep0.begin(EndpointState::StatusIn, buffer, 0, callback);
            self.ep0_start_in(0);
            return Ok(());
        }

        ep0.begin(EndpointState::Receiving, buffer, len, callback);
        self.ep0_start_out();
        Ok(())
    }

    /// End the control transfer: back to IDLE, then report
    ///
    /// A callback returning an error stalls EP0.
    fn ep0_finish(&mut self, status: TransferStatus) {
        let (callback, transferred, remaining) = {
            let ep0 = self.endpoints.ep0_mut();
            let callback = ep0.finish();
            (callback, ep0.transferred, ep0.remaining)
        };
        self.stats.record_outcome(&status, transferred);
        self.ep0_to_idle();

        if let Some(callback) = callback {
            if callback.complete(status, transferred, remaining).is_err() && status.is_ok() {
                #[cfg(feature = "defmt")]
                defmt::debug!("EP0 callback requested stall");

                self.stall_ep0();
            }
        }
    }

    /// IN transfer complete on EP0
    pub(crate) fn ep0_in_complete(&mut self) {
        let residual = (self.regs.read(otg::dieptsiz(0)) & deptsiz::EP0_XFERSIZE_MASK) as usize;
        let mps = self.ep0_mps();

        match self.endpoints.ep0().state {
            EndpointState::Transmitting => {
                let ep0 = self.endpoints.ep0_mut();
                let sent = ep0.armed.saturating_sub(residual);
                ep0.advance(sent);

                if ep0.remaining > 0 {
                    let next = ep0.remaining.min(mps);
                    self.ep0_start_in(next);
                } else if ep0.zlp == Zlp::Pending {
                    ep0.zlp = Zlp::Sent;
                    self.ep0_start_in(0);
                } else {
                    ep0.state = EndpointState::StatusOut;
                    self.ep0_arm_setup();
                }
            }
            EndpointState::StatusIn => self.ep0_finish(Ok(())),
            _ => {}
        }
    }

    /// OUT transfer complete on EP0 (not a SETUP)
    pub(crate) fn ep0_out_complete(&mut self) {
        let residual = (self.regs.read(otg::doeptsiz(0)) & deptsiz::EP0_XFERSIZE_MASK) as usize;

        match self.endpoints.ep0().state {
            EndpointState::Receiving => {
                let ep0 = self.endpoints.ep0_mut();
                let received = ep0.armed.saturating_sub(residual);
                let full_packet = received == ep0.armed;
                ep0.advance(received);

                if ep0.remaining > 0 && full_packet {
                    self.ep0_start_out();
                } else {
                    self.ep0_status_in();
                }
            }
            EndpointState::StatusOut => self.ep0_finish(Ok(())),
            // Status ZLP after a zero-length IN response, or a stray packet
            _ => self.ep0_arm_setup(),
        }
    }

    /// Cancel a pending control transfer because a new SETUP arrived
    fn ep0_cancel(&mut self) {
        if self.endpoints.ep0().is_idle() {
            return;
        }
        if self.occupies_in(0) {
            self.disable_in(0);
            self.flush_tx(0);
        }

        let (callback, transferred, remaining) = {
            let ep0 = self.endpoints.ep0_mut();
            let callback = ep0.finish();
            (callback, ep0.transferred, ep0.remaining)
        };
        let status = Err(UsbError::EndpointAborted);
        self.stats.record_outcome(&status, transferred);
        if let Some(callback) = callback {
            let _ = callback.complete(status, transferred, remaining);
        }
    }

    /// SETUP phase done on EP0
    pub(crate) fn handle_setup(&mut self, callbacks: &mut dyn DeviceCallbacks) {
        let supcnt = (self.regs.read(otg::doeptsiz(0)) & deptsiz::SUPCNT_MASK) >> deptsiz::SUPCNT_SHIFT;
        let setup = self.read_setup_slot(setup_slot(supcnt));
        self.stats.record_setup();

        #[cfg(feature = "defmt")]
        defmt::debug!("SETUP {}", setup);

        self.ep0_cancel();

        // A SETUP clears any protocol stall
        let clear = !(DepCtl::ONE_SHOT | DepCtl::STALL).bits();
        self.regs.modify(otg::diepctl(0), |v| v & clear);
        self.regs.modify(otg::doepctl(0), |v| v & clear);

        self.setup = setup;

        let mut result = callbacks.on_setup(&setup, self);
        if result == SetupResult::Unhandled && setup.kind() == RequestType::Standard {
            result = ch9::handle(self, &setup, callbacks);
        }

        match result {
            SetupResult::Accepted => {
                if self.endpoints.ep0().is_idle() {
                    if setup.length == 0 {
                        self.endpoints.ep0_mut().begin(EndpointState::StatusIn, DmaBuffer::empty(), 0, None);
                        self.ep0_start_in(0);
                    } else {
                        self.ep0_arm_setup();
                    }
                }
            }
            SetupResult::Unhandled | SetupResult::Rejected => {
                #[cfg(feature = "defmt")]
                defmt::debug!("SETUP stalled ({})", result);

                self.stall_ep0();
                self.ep0_to_idle();
            }
        }
    }
}

impl<R: RegisterBlock> ControlEndpoint for Engine<R> {
    fn setup(&self) -> SetupPacket {
        self.setup
    }

    fn device_state(&self) -> DeviceState {
        self.state
    }

    fn write(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()> {
        self.ep0_write(buffer, len, callback)
    }

    fn read(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()> {
        self.ep0_read(buffer, len, callback)
    }

    fn stall(&mut self, address: EndpointAddress) -> Result<()> {
        Engine::stall(self, address)
    }

    fn unstall(&mut self, address: EndpointAddress) -> Result<()> {
        Engine::unstall(self, address)
    }
}
