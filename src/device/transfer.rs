//! Data endpoint transfers, aborts and halts
//!
//! A data endpoint moves a whole transfer per arm: the core splits it into
//! packets, and the DMA engine walks the buffer. Aborts follow the core's
//! disable sequence: NAK the endpoint, wait for the NAK to take effect,
//! disable it, wait for the disable, then flush its FIFO.

use super::Engine;
use crate::endpoint::{EndpointState, MAX_ENDPOINTS};
use crate::error::{Result, TransferStatus, UsbError};
use crate::fifo::{flush_rx_fifo, flush_tx_fifo};
use crate::otg::{self, deptsiz, dsts, Dctl, DepCtl, DiepInt, DoepInt, Gint, GrstCtl, RegisterBlock};
use crate::transfer::{packet_count, Completion, DmaBuffer, EndpointAddress, TransferType};
use heapless::Vec;

/// DAINT/DAINTMSK bits always owned by EP0
pub(crate) const EP0_DAINT_BITS: u32 = 1 | (1 << 16);

impl<R: RegisterBlock> Engine<R> {
    pub(crate) fn write(
        &mut self,
        address: EndpointAddress,
        buffer: DmaBuffer,
        len: usize,
        callback: Option<Completion>,
    ) -> Result<()> {
        let index = self.endpoints.index_of(address).ok_or(UsbError::IllegalOperation)?;
        if index == 0 {
            return self.ep0_write(buffer, len, callback);
        }
        if !self.endpoints.by_index(index).is_in() {
            return Err(UsbError::IllegalOperation);
        }
        self.start_data(index, buffer, len, callback)
    }

    pub(crate) fn read(
        &mut self,
        address: EndpointAddress,
        buffer: DmaBuffer,
        len: usize,
        callback: Option<Completion>,
    ) -> Result<()> {
        let index = self.endpoints.index_of(address).ok_or(UsbError::IllegalOperation)?;
        if index == 0 {
            return self.ep0_read(buffer, len, callback);
        }
        if self.endpoints.by_index(index).is_in() {
            return Err(UsbError::IllegalOperation);
        }
        self.start_data(index, buffer, len, callback)
    }

    /// Validate and arm a transfer on a data endpoint
    fn start_data(&mut self, index: usize, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()> {
        let limits = self.config.limits;
        let ep = self.endpoints.by_index(index);
        let number = ep.number() as usize;
        let is_in = ep.is_in();
        let transfer_type = ep.transfer_type;
        let mps = ep.max_packet_size as usize;

        if len > limits.max_transfer_size {
            return Err(UsbError::IllegalOperation);
        }
        let packets = packet_count(len, mps);
        if packets > limits.max_packet_count {
            return Err(UsbError::IllegalOperation);
        }
        let size = if is_in {
            buffer.check_source(len)?;
            len
        } else if len == 0 {
            0
        } else {
            // The core may write up to a whole packet past a short tail
            buffer.check_sink(packets * mps)?;
            packets * mps
        };

        let ctl = if is_in { otg::diepctl(number) } else { otg::doepctl(number) };
        if self.regs.read(ctl) & DepCtl::STALL.bits() != 0 {
            return Err(UsbError::EndpointStalled);
        }
        if !ep.is_idle() {
            return Err(UsbError::EndpointBusy);
        }
        if self.state != super::DeviceState::Configured {
            return Err(UsbError::DeviceUnconfigured);
        }
        if self.regs.read(ctl) & DepCtl::USBACTEP.bits() == 0 {
            return Err(UsbError::IllegalOperation);
        }

        let mut tsiz = ((packets as u32) << deptsiz::PKTCNT_SHIFT) | size as u32;
        let mut enable = DepCtl::CNAK | DepCtl::EPENA;
        if transfer_type == TransferType::Isochronous {
            if is_in {
                tsiz |= 1 << deptsiz::MC_SHIFT;
            }
            // Target the frame after the current one
            let frame = (self.regs.read(otg::DSTS) & dsts::SOFFN_MASK) >> dsts::SOFFN_SHIFT;
            enable |= if frame & 1 == 0 { DepCtl::SETD1PID } else { DepCtl::SETD0PID };
        }

        let address = if size == 0 { self.setup_ring_address() } else { buffer.as_ptr() };
        {
            let ep = self.endpoints.by_index_mut(index);
            let state = if is_in { EndpointState::Transmitting } else { EndpointState::Receiving };
            ep.begin(state, buffer, len, callback);
            ep.armed = size;
        }

        if is_in {
            self.regs.write(otg::dieptsiz(number), tsiz);
            self.regs.write_dma_address(otg::diepdma(number), address);
        } else {
            self.regs.write(otg::doeptsiz(number), tsiz);
            self.regs.write_dma_address(otg::doepdma(number), address);
        }
        self.regs.modify(ctl, |v| (v & !DepCtl::ONE_SHOT.bits()) | enable.bits());

        #[cfg(feature = "defmt")]
        defmt::trace!("EP{} {} armed {} bytes", number, if is_in { "IN" } else { "OUT" }, len);

        Ok(())
    }

    /// Transfer complete on a data IN endpoint
    pub(crate) fn data_in_complete(&mut self, index: usize) {
        let ep = self.endpoints.by_index(index);
        if ep.state != EndpointState::Transmitting {
            return;
        }
        let residual = (self.regs.read(otg::dieptsiz(ep.number() as usize)) & deptsiz::XFERSIZE_MASK) as usize;
        let ep = self.endpoints.by_index_mut(index);
        let sent = ep.armed.saturating_sub(residual);
        ep.advance(sent);
        self.complete(index, Ok(()));
    }

    /// Transfer complete on a data OUT endpoint
    pub(crate) fn data_out_complete(&mut self, index: usize) {
        let ep = self.endpoints.by_index(index);
        if ep.state != EndpointState::Receiving {
            return;
        }
        let residual = (self.regs.read(otg::doeptsiz(ep.number() as usize)) & deptsiz::XFERSIZE_MASK) as usize;
        let ep = self.endpoints.by_index_mut(index);
        let received = ep.armed.saturating_sub(residual);
        ep.advance(received);
        self.complete(index, Ok(()));
    }

    fn complete(&mut self, index: usize, status: TransferStatus) {
        let ep = self.endpoints.by_index_mut(index);
        let callback = ep.finish();
        let (transferred, remaining) = (ep.transferred, ep.remaining);
        self.stats.record_outcome(&status, transferred);
        if let Some(callback) = callback {
            let _ = callback.complete(status, transferred, remaining);
        }
    }

    /// Which side of the core an endpoint's current transfer occupies
    pub(crate) fn occupies_in(&self, index: usize) -> bool {
        let ep = self.endpoints.by_index(index);
        if index == 0 {
            matches!(ep.state, EndpointState::Transmitting | EndpointState::StatusIn)
        } else {
            ep.is_in()
        }
    }

    /// NAK an IN endpoint, then disable it
    pub(crate) fn disable_in(&self, index: usize) {
        let number = self.endpoints.by_index(index).number() as usize;
        let ctl = otg::diepctl(number);
        if self.regs.read(ctl) & DepCtl::EPENA.bits() == 0 {
            return;
        }
        self.regs.modify(ctl, |v| (v & !DepCtl::ONE_SHOT.bits()) | DepCtl::SNAK.bits());
        self.handshake(|r| r.read(otg::diepint(number)) & DiepInt::INEPNAKEFF.bits() != 0);
        self.regs.write(otg::diepint(number), DiepInt::INEPNAKEFF.bits());
        self.disable_endpoints(true, &[index]);
    }

    /// Disable a set of endpoints in one direction under global NAK
    ///
    /// EPDIS goes to every enabled endpoint first; a single handshake then
    /// waits for all of them to report disabled.
    fn disable_endpoints(&self, is_in: bool, indices: &[usize]) {
        let mut pending: Vec<usize, MAX_ENDPOINTS> = Vec::new();
        for &index in indices {
            let number = self.endpoints.by_index(index).number() as usize;
            let ctl = if is_in { otg::diepctl(number) } else { otg::doepctl(number) };
            let skip = (!is_in && number == 0) || self.regs.read(ctl) & DepCtl::EPENA.bits() == 0;
            if skip || pending.contains(&number) {
                continue;
            }
            self.regs.modify(ctl, |v| (v & !DepCtl::ONE_SHOT.bits()) | (DepCtl::EPDIS | DepCtl::SNAK).bits());
            // Capacity equals the table size
            let _ = pending.push(number);
        }
        if pending.is_empty() {
            return;
        }

        let int = |number: usize| if is_in { otg::diepint(number) } else { otg::doepint(number) };
        let disabled = if is_in { DiepInt::EPDISBLD.bits() } else { DoepInt::EPDISBLD.bits() };
        self.handshake(|r| pending.iter().all(|&n| r.read(int(n)) & disabled != 0));
        for &number in &pending {
            self.regs.write(int(number), disabled);
        }
    }

    pub(crate) fn flush_tx(&self, fifo: u32) {
        if !flush_tx_fifo(&self.regs, fifo, self.config.handshake_budget) {
            self.stats.record_handshake_timeout();
        }
    }

    fn flush_rx(&self) {
        if !flush_rx_fifo(&self.regs, self.config.handshake_budget) {
            self.stats.record_handshake_timeout();
        }
    }

    /// Cancel the transfer on one endpoint
    pub(crate) fn abort(&mut self, address: EndpointAddress) -> Result<()> {
        let index = self.endpoints.index_of(address).ok_or(UsbError::IllegalOperation)?;
        let ep = self.endpoints.by_index(index);
        if ep.is_idle() {
            return Ok(());
        }
        let fifo = ep.fifo as u32;

        if self.occupies_in(index) {
            self.disable_in(index);
            self.flush_tx(fifo);
        } else {
            self.regs.set_bits(otg::DCTL, Dctl::SGOUTNAK.bits());
            self.handshake(|r| r.read(otg::GINTSTS) & Gint::GOUTNAKEFF.bits() != 0);
            self.disable_endpoints(false, &[index]);
            self.flush_rx();
            self.regs.set_bits(otg::DCTL, Dctl::CGOUTNAK.bits());
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Aborted transfer on {=u8:#x}", address.raw());

        let ep = self.endpoints.by_index_mut(index);
        let callback = ep.finish();
        let (transferred, remaining) = (ep.transferred, ep.remaining);
        let status = Err(UsbError::EndpointAborted);
        self.stats.record_outcome(&status, transferred);
        if index == 0 {
            self.ep0_arm_setup();
        }
        if let Some(callback) = callback {
            let _ = callback.complete(status, transferred, remaining);
        }
        Ok(())
    }

    /// Cancel every busy endpoint with `reason`, batching the NAK
    /// handshakes per direction
    ///
    /// Callbacks run after all endpoints are idle, in table order.
    pub(crate) fn abort_many(&mut self, reason: UsbError, include_ep0: bool) {
        let first = if include_ep0 { 0 } else { 1 };
        let mut busy_in: Vec<usize, MAX_ENDPOINTS> = Vec::new();
        let mut busy_out: Vec<usize, MAX_ENDPOINTS> = Vec::new();
        for index in first..self.endpoints.len() {
            if self.endpoints.by_index(index).is_idle() {
                continue;
            }
            // Capacity equals the table size
            let _ = if self.occupies_in(index) {
                busy_in.push(index)
            } else {
                busy_out.push(index)
            };
        }
        if busy_in.is_empty() && busy_out.is_empty() {
            return;
        }

        if !busy_in.is_empty() {
            self.regs.set_bits(otg::DCTL, Dctl::SGNPINNAK.bits());
            self.handshake(|r| r.read(otg::GINTSTS) & Gint::GINNAKEFF.bits() != 0);
            self.disable_endpoints(true, &busy_in);
            self.flush_tx(GrstCtl::TXFNUM_ALL.bits() >> 6);
            self.regs.set_bits(otg::DCTL, Dctl::CGNPINNAK.bits());
        }

        if !busy_out.is_empty() {
            self.regs.set_bits(otg::DCTL, Dctl::SGOUTNAK.bits());
            self.handshake(|r| r.read(otg::GINTSTS) & Gint::GOUTNAKEFF.bits() != 0);
            self.disable_endpoints(false, &busy_out);
            self.flush_rx();
            self.regs.set_bits(otg::DCTL, Dctl::CGOUTNAK.bits());
        }

        let mut pending: Vec<(Completion, usize, usize), MAX_ENDPOINTS> = Vec::new();
        let mut ep0_was_busy = false;
        let status: TransferStatus = Err(reason);
        for index in first..self.endpoints.len() {
            let ep = self.endpoints.by_index_mut(index);
            if ep.is_idle() {
                continue;
            }
            ep0_was_busy |= index == 0;
            let callback = ep.finish();
            let (transferred, remaining) = (ep.transferred, ep.remaining);
            self.stats.record_outcome(&status, transferred);
            if let Some(callback) = callback {
                let _ = pending.push((callback, transferred, remaining));
            }
        }
        if ep0_was_busy {
            self.ep0_arm_setup();
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Aborted {} transfers ({})", pending.len(), reason);

        for (callback, transferred, remaining) in pending {
            let _ = callback.complete(status, transferred, remaining);
        }
    }

    /// Program one data endpoint's control register and unmask its
    /// interrupt
    pub(crate) fn activate(&mut self, index: usize) {
        let ep = self.endpoints.by_index(index);
        let number = ep.number() as usize;
        let mut value = ep.max_packet_size as u32
            | DepCtl::eptype(ep.transfer_type.eptype())
            | (DepCtl::USBACTEP | DepCtl::SETD0PID | DepCtl::SNAK).bits();

        if ep.is_in() {
            value |= DepCtl::txfnum(ep.fifo as u32);
            self.regs.write(otg::diepctl(number), value);
            self.regs.set_bits(otg::DAINTMSK, 1 << number);
        } else {
            self.regs.write(otg::doepctl(number), value);
            self.regs.set_bits(otg::DAINTMSK, 1 << (16 + number));
        }
    }

    pub(crate) fn activate_all(&mut self) {
        for index in 1..self.endpoints.len() {
            self.activate(index);
        }
    }

    /// Mark one data endpoint inactive and mask its interrupt
    fn deactivate(&mut self, index: usize) {
        let ep = self.endpoints.by_index(index);
        let number = ep.number() as usize;
        let (ctl, daint) = if ep.is_in() {
            (otg::diepctl(number), 1 << number)
        } else {
            (otg::doepctl(number), 1 << (16 + number))
        };
        self.regs.modify(ctl, |v| v & !(DepCtl::ONE_SHOT | DepCtl::USBACTEP).bits());
        self.regs.clear_bits(otg::DAINTMSK, daint);
    }

    /// Mark data endpoints inactive and mask their interrupts
    pub(crate) fn deactivate_hardware(&mut self) {
        for index in 1..self.endpoints.len() {
            self.deactivate(index);
        }
        self.regs.modify(otg::DAINTMSK, |v| v & EP0_DAINT_BITS);
    }

    /// Activate a single registered data endpoint
    pub(crate) fn activate_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        match self.endpoints.index_of(address) {
            Some(index) if index > 0 => {
                self.activate(index);
                Ok(())
            }
            _ => Err(UsbError::IllegalOperation),
        }
    }

    /// Deactivate a single data endpoint, aborting its transfer first
    pub(crate) fn deactivate_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let index = match self.endpoints.index_of(address) {
            Some(index) if index > 0 => index,
            _ => return Err(UsbError::IllegalOperation),
        };
        self.abort(address)?;
        self.deactivate(index);

        #[cfg(feature = "defmt")]
        defmt::debug!("Deactivated {=u8:#x}", address.raw());

        Ok(())
    }

    /// Leave the configured state: abort data transfers with `reason` and
    /// deactivate the endpoints
    pub(crate) fn deactivate_all(&mut self, reason: UsbError) {
        self.abort_many(reason, false);
        self.deactivate_hardware();
    }

    pub(crate) fn stall(&mut self, address: EndpointAddress) -> Result<()> {
        let index = self.endpoints.index_of(address).ok_or(UsbError::IllegalOperation)?;
        if index == 0 {
            self.stall_ep0();
            return Ok(());
        }
        let ep = self.endpoints.by_index(index);
        if !ep.is_idle() {
            return Err(UsbError::EndpointBusy);
        }

        let number = ep.number() as usize;
        if ep.is_in() {
            self.regs.modify(otg::diepctl(number), |v| {
                let mut set = DepCtl::STALL.bits();
                if v & DepCtl::EPENA.bits() != 0 {
                    set |= DepCtl::EPDIS.bits();
                }
                (v & !DepCtl::ONE_SHOT.bits()) | set
            });
        } else {
            self.regs
                .modify(otg::doepctl(number), |v| (v & !DepCtl::ONE_SHOT.bits()) | DepCtl::STALL.bits());
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Stalled {=u8:#x}", address.raw());

        Ok(())
    }

    pub(crate) fn unstall(&mut self, address: EndpointAddress) -> Result<()> {
        let index = self.endpoints.index_of(address).ok_or(UsbError::IllegalOperation)?;
        let clear = !(DepCtl::ONE_SHOT | DepCtl::STALL).bits();
        if index == 0 {
            self.regs.modify(otg::diepctl(0), |v| v & clear);
            self.regs.modify(otg::doepctl(0), |v| v & clear);
            return Ok(());
        }

        let ep = self.endpoints.by_index(index);
        let number = ep.number() as usize;
        let ctl = if ep.is_in() { otg::diepctl(number) } else { otg::doepctl(number) };
        let reset_toggle = match ep.transfer_type {
            TransferType::Bulk | TransferType::Interrupt => DepCtl::SETD0PID.bits(),
            _ => 0,
        };
        self.regs.modify(ctl, |v| (v & clear) | reset_toggle);
        Ok(())
    }

    /// Whether an endpoint is halted
    pub(crate) fn is_stalled(&self, address: EndpointAddress) -> Option<bool> {
        let ep = self.endpoints.get(address)?;
        let number = ep.number() as usize;
        let ctl = if address.is_in() { otg::diepctl(number) } else { otg::doepctl(number) };
        Some(self.regs.read(ctl) & DepCtl::STALL.bits() != 0)
    }
}
