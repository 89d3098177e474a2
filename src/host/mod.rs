//! Host-mode controller
//!
//! [`UsbHost`] drives the single root port and a bounded pool of hardware
//! channels. Each logical endpoint is assigned a channel (control endpoints
//! two, see [`ControlPipe`]); transfers are armed on the channel and
//! reported through a completion callback, or run to completion by the
//! blocking variants which service the interrupt handler in call context.

mod channel;
mod interrupt;
mod port;

pub use channel::{
    classify_halt, Channel, ChannelId, ControlPipe, ControlStage, HaltAction, HostEndpoint, Outcome, Pid,
    MAX_CHANNELS,
};
pub use port::{DeviceSpeed, PortEvent, PortState};

use crate::config::HostConfig;
use crate::critical::{CriticalSection, InterruptGate, NoGate};
use crate::error::{Result, TransferStatus, UsbError};
use crate::fifo::{flush_rx_fifo, flush_tx_fifo, MIN_TX_FIFO_WORDS};
use crate::otg::{self, hcfg, hctsiz, GahbCfg, Gint, GrstCtl, GusbCfg, HcChar, HcInt, Hprt, RegisterBlock, Route};
use crate::stats::UsbStats;
use crate::timing::{Clock, PollBudget, SoftTimer};
use crate::transfer::{packet_count, Completion, Direction, DmaBuffer, EndpointAddress, SetupPacket, TransferType};
use crate::vbus::VbusPowerControl;
use channel::ControlTransfer;
use core::ptr::NonNull;
use heapless::Vec;

/// DMA memory for SETUP packets, one slot per channel
///
/// Must outlive the driver, so it is handed over as `&'static mut`.
#[repr(C, align(4))]
pub struct ChannelScratch {
    setup: [[u8; 8]; MAX_CHANNELS],
}

impl ChannelScratch {
    /// Zeroed scratch area
    pub const fn new() -> Self {
        Self { setup: [[0; 8]; MAX_CHANNELS] }
    }
}

impl Default for ChannelScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupts serviced in host mode
pub(crate) const HOST_INTERRUPTS: Gint = Gint::PRTINT
    .union(Gint::HCHINT)
    .union(Gint::DISCONNINT)
    .union(Gint::SOF);

/// Register-level host state; every entry point runs with the USB
/// interrupt excluded by the owning [`UsbHost`]
pub(crate) struct Controller<R: RegisterBlock, V: VbusPowerControl, K: Clock> {
    pub(crate) regs: R,
    pub(crate) config: HostConfig,
    pub(crate) vbus: V,
    pub(crate) clock: K,
    pub(crate) channels: Vec<Channel, MAX_CHANNELS>,
    scratch: NonNull<ChannelScratch>,
    pub(crate) port: PortState,
    pub(crate) port_timer: SoftTimer,
    pub(crate) speed: Option<DeviceSpeed>,
    pub(crate) last_frame: u16,
    pub(crate) stats: UsbStats,
}

impl<R: RegisterBlock, V: VbusPowerControl, K: Clock> Controller<R, V, K> {
    pub(crate) fn handshake<F: FnMut(&R) -> bool>(&self, mut done: F) -> bool {
        let regs = &self.regs;
        let ok = PollBudget::new(self.config.handshake_budget).wait(|| done(regs));
        if !ok {
            self.stats.record_handshake_timeout();

            #[cfg(feature = "defmt")]
            defmt::warn!("USB handshake budget exhausted");
        }
        ok
    }

    fn init(&mut self) -> Result<()> {
        let config = self.config;
        let limits = config.limits;

        if config.fifo_total() > limits.fifo_words as u32
            || config.rx_fifo_words == 0
            || config.np_tx_fifo_words < MIN_TX_FIFO_WORDS
            || config.p_tx_fifo_words < MIN_TX_FIFO_WORDS
        {
            return Err(UsbError::IllegalOperation);
        }

        self.regs.write(otg::ROUTE, (Route::PHYPEN | Route::VBUSENPEN).bits());

        if !otg::core_soft_reset(&self.regs, config.handshake_budget) {
            self.stats.record_handshake_timeout();

            #[cfg(feature = "defmt")]
            defmt::error!("USB core did not leave soft reset");

            return Err(UsbError::DeviceMalfunction);
        }

        self.regs.modify(otg::GUSBCFG, |v| {
            (v & !(GusbCfg::FORCEDEVMODE | GusbCfg::USBTRDTIM_MASK | GusbCfg::TOUTCAL_MASK).bits())
                | (GusbCfg::FORCEHSTMODE | GusbCfg::USBTRDTIM_FS).bits()
                | 5
        });
        self.regs.write(otg::GAHBCFG, (GahbCfg::DMAEN | GahbCfg::HBSTLEN_INCR).bits());
        self.regs.write(otg::HCFG, hcfg::FSLSPCLKSEL_48MHZ);

        let rx = config.rx_fifo_words as u32;
        let np_tx = config.np_tx_fifo_words as u32;
        let p_tx = config.p_tx_fifo_words as u32;
        self.regs.write(otg::GRXFSIZ, rx);
        self.regs.write(otg::GNPTXFSIZ, (np_tx << 16) | rx);
        self.regs.write(otg::HPTXFSIZ, (p_tx << 16) | (rx + np_tx));
        let budget = config.handshake_budget;
        if !flush_tx_fifo(&self.regs, GrstCtl::TXFNUM_ALL.bits() >> 6, budget) || !flush_rx_fifo(&self.regs, budget) {
            self.stats.record_handshake_timeout();
        }

        let count = (limits.host_channels as usize).min(MAX_CHANNELS);
        self.channels.clear();
        for ch in 0..count {
            self.halt_hardware(ch);
            self.regs.write(otg::hcint(ch), 0xFFFF_FFFF);
            self.regs.write(otg::hcintmsk(ch), 0);
            // count is clamped to the capacity
            let _ = self.channels.push(Channel::new());
        }
        self.regs.write(otg::HAINTMSK, 0);

        self.regs.write(otg::GINTSTS, 0xFFFF_FFFF);
        self.regs.write(otg::GINTMSK, HOST_INTERRUPTS.bits());
        self.regs.set_bits(otg::GAHBCFG, GahbCfg::GLBLINTRMSK.bits());

        self.port = PortState::Disconnected;
        self.port_timer.cancel();
        self.speed = None;

        self.vbus.enable_vbus()?;
        self.write_hprt(Hprt::PRTPWR.bits(), 0);

        #[cfg(feature = "defmt")]
        defmt::info!("USB host initialized, {} channels", count);

        Ok(())
    }

    /// Read-modify-write HPRT without touching its write-1-to-clear bits
    pub(crate) fn write_hprt(&self, set: u32, clear: u32) {
        let value = self.regs.read(otg::HPRT) & !Hprt::W1C.bits();
        self.regs.write(otg::HPRT, (value & !clear) | set);
    }

    /// Acknowledge HPRT change bits; never disables the port
    pub(crate) fn ack_hprt(&self, changes: u32) {
        let value = self.regs.read(otg::HPRT) & !Hprt::W1C.bits();
        let changes = changes & (Hprt::W1C.bits() & !Hprt::PRTENA.bits());
        self.regs.write(otg::HPRT, value | changes);
    }

    /// Disable a channel in hardware and wait for the halt
    pub(crate) fn halt_hardware(&self, ch: usize) {
        if self.regs.read(otg::hcchar(ch)) & HcChar::CHENA.bits() == 0 {
            return;
        }
        self.regs.modify(otg::hcchar(ch), |v| v | (HcChar::CHDIS | HcChar::CHENA).bits());
        self.handshake(|r| r.read(otg::hcint(ch)) & HcInt::CHHLTD.bits() != 0);
        self.regs.write(otg::hcint(ch), 0xFFFF_FFFF);
    }

    fn allocate_channel(&self, skip: Option<usize>) -> Option<usize> {
        self.channels
            .iter()
            .enumerate()
            .position(|(i, ch)| ch.is_free() && Some(i) != skip)
    }

    fn assign_endpoint(&mut self, endpoint: HostEndpoint) -> Result<ChannelId> {
        if endpoint.transfer_type == TransferType::Control
            || !endpoint.address.is_valid()
            || endpoint.max_packet_size == 0
            || endpoint.max_packet_size > 1023
            || endpoint.device_address > 127
        {
            return Err(UsbError::IllegalOperation);
        }
        let ch = self.allocate_channel(None).ok_or(UsbError::HostChannelBusy)?;
        self.channels[ch].endpoint = Some(endpoint);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Channel {} -> dev {} ep {=u8:#x}",
            ch,
            endpoint.device_address,
            endpoint.address.raw()
        );

        Ok(ChannelId(ch as u8))
    }

    fn assign_control(&mut self, device_address: u8, max_packet_size: u16, low_speed: bool) -> Result<ControlPipe> {
        if !matches!(max_packet_size, 8 | 16 | 32 | 64) || device_address > 127 {
            return Err(UsbError::IllegalOperation);
        }
        let out = self.allocate_channel(None).ok_or(UsbError::HostChannelBusy)?;
        let in_ = self.allocate_channel(Some(out)).ok_or(UsbError::HostChannelBusy)?;

        let endpoint = |address| {
            HostEndpoint::new(device_address, address, TransferType::Control, max_packet_size).low_speed(low_speed)
        };
        self.channels[out].endpoint = Some(endpoint(EndpointAddress::EP0_OUT));
        self.channels[in_].endpoint = Some(endpoint(EndpointAddress::EP0_IN));

        Ok(ControlPipe {
            out: ChannelId(out as u8),
            in_: ChannelId(in_ as u8),
        })
    }

    fn release(&mut self, channel: ChannelId) -> Result<()> {
        let ch = self.checked(channel)?;
        self.fail_channel(ch, UsbError::EndpointAborted);
        self.regs.clear_bits(otg::HAINTMSK, 1 << ch);
        self.channels[ch] = Channel::new();
        Ok(())
    }

    fn checked(&self, channel: ChannelId) -> Result<usize> {
        let ch = channel.index();
        match self.channels.get(ch) {
            Some(c) if !c.is_free() => Ok(ch),
            _ => Err(UsbError::IllegalOperation),
        }
    }

    fn check_port(&self) -> Result<()> {
        match self.port {
            PortState::Connected => Ok(()),
            PortState::Suspended => Err(UsbError::DeviceSuspended),
            PortState::Overcurrent => Err(UsbError::PortOvercurrent),
            _ => Err(UsbError::DeviceRemoved),
        }
    }

    fn submit(
        &mut self,
        channel: ChannelId,
        direction: Direction,
        buffer: DmaBuffer,
        len: usize,
        timeout_ms: u32,
        callback: Option<Completion>,
    ) -> Result<()> {
        let ch = self.checked(channel)?;
        let limits = self.config.limits;
        let (endpoint, active) = {
            let c = &self.channels[ch];
            (c.endpoint.ok_or(UsbError::IllegalOperation)?, c.active)
        };
        if endpoint.transfer_type == TransferType::Control || endpoint.address.direction() != direction {
            return Err(UsbError::IllegalOperation);
        }

        let mps = endpoint.max_packet_size as usize;
        if len > limits.max_transfer_size {
            return Err(UsbError::IllegalOperation);
        }
        let packets = packet_count(len, mps);
        if packets > limits.max_packet_count {
            return Err(UsbError::IllegalOperation);
        }
        match direction {
            Direction::In if len > 0 => buffer.check_sink(packets * mps)?,
            Direction::In => {}
            Direction::Out => buffer.check_source(len)?,
        }
        if active {
            return Err(UsbError::EndpointBusy);
        }
        self.check_port()?;

        let c = &mut self.channels[ch];
        c.begin(buffer, len, None, timeout_ms);
        c.callback = callback;
        c.control_owner = None;
        self.arm_timer(ch);
        self.start_channel(ch);
        Ok(())
    }

    fn control_message(
        &mut self,
        pipe: ControlPipe,
        setup: SetupPacket,
        buffer: DmaBuffer,
        timeout_ms: u32,
        callback: Option<Completion>,
    ) -> Result<()> {
        let out = self.checked(pipe.out)?;
        let in_ = self.checked(pipe.in_)?;
        let len = setup.length as usize;

        let mps = match self.channels[in_].endpoint {
            Some(e) if e.transfer_type == TransferType::Control => e.max_packet_size as usize,
            _ => return Err(UsbError::IllegalOperation),
        };
        if setup.is_in() {
            if len > 0 {
                buffer.check_sink(packet_count(len, mps) * mps)?;
            }
        } else {
            buffer.check_source(len)?;
        }
        if self.channels[out].active || self.channels[in_].active {
            return Err(UsbError::EndpointBusy);
        }
        self.check_port()?;

        // SAFETY: the scratch area came from a &'static mut handed to this
        // driver; slot `out` is only read by DMA while channel `out` runs
        // a SETUP stage, and it is idle here
        let slot = unsafe {
            let base = core::ptr::addr_of_mut!((*self.scratch.as_ptr()).setup[out]) as *mut u8;
            for (i, byte) in setup.to_bytes().iter().enumerate() {
                core::ptr::write_volatile(base.add(i), *byte);
            }
            DmaBuffer::from_raw_parts(NonNull::new_unchecked(base), SetupPacket::SIZE)
        };

        self.channels[out].control = Some(ControlTransfer {
            setup,
            buffer,
            len,
            stage: ControlStage::Setup,
            transferred: 0,
            in_channel: in_,
            timeout_ms,
            callback,
        });
        self.channels[out].outcome = None;

        #[cfg(feature = "defmt")]
        defmt::debug!("Control request {=u8:#x} len {}", setup.request, len);

        self.start_stage(out, out, slot, SetupPacket::SIZE, Pid::Setup);
        Ok(())
    }

    /// Run one control stage on `ch` on behalf of the pipe owned by `owner`
    fn start_stage(&mut self, owner: usize, ch: usize, buffer: DmaBuffer, len: usize, pid: Pid) {
        let timeout_ms = self.channels[owner].control.map(|c| c.timeout_ms).unwrap_or(0);
        let c = &mut self.channels[ch];
        c.begin(buffer, len, Some(pid), timeout_ms);
        c.callback = None;
        c.control_owner = Some(owner);
        self.arm_timer(ch);
        self.start_channel(ch);
    }

    fn arm_timer(&mut self, ch: usize) {
        let now = self.clock.now_ms();
        let c = &mut self.channels[ch];
        if c.timeout_ms == 0 {
            c.timer.cancel();
        } else {
            c.timer.start(now, c.timeout_ms);
        }
    }

    /// Program the channel registers from its bookkeeping and enable it
    ///
    /// Used for the first arm and for every retry; a retry continues from
    /// the current position with the toggle the core left behind.
    pub(crate) fn start_channel(&mut self, ch: usize) {
        let frame = self.frame_number();
        // Zero-length stages still need a valid, aligned DMA address
        let scratch = self.scratch.as_ptr() as *const u8;

        let c = &mut self.channels[ch];
        let Some(endpoint) = c.endpoint else {
            return;
        };
        let address = if c.remaining == 0 { scratch } else { c.buffer.address_at(c.transferred) };
        let mps = endpoint.max_packet_size as usize;
        let packets = packet_count(c.remaining, mps);
        let is_in = endpoint.address.is_in();
        let size = if is_in && c.remaining > 0 { packets * mps } else { c.remaining };
        let pid = c.pid.unwrap_or(endpoint.toggle);
        c.armed = size;
        c.retry_after_frame = None;

        let mut characteristics = endpoint.max_packet_size as u32
            | HcChar::epnum(endpoint.address.number() as u32)
            | HcChar::eptype(endpoint.transfer_type.eptype())
            | HcChar::mc(1)
            | HcChar::devaddr(endpoint.device_address as u32)
            | HcChar::CHENA.bits();
        if is_in {
            characteristics |= HcChar::EPDIR.bits();
        }
        if endpoint.low_speed {
            characteristics |= HcChar::LSPDDEV.bits();
        }
        if endpoint.transfer_type == TransferType::Interrupt && frame & 1 == 0 {
            // Next frame is odd
            characteristics |= HcChar::ODDFRM.bits();
        }

        self.regs.write(otg::hcint(ch), 0xFFFF_FFFF);
        self.regs.write(otg::hcintmsk(ch), HcInt::CHHLTD.bits());
        self.regs.set_bits(otg::HAINTMSK, 1 << ch);
        self.regs.write(
            otg::hctsiz(ch),
            pid.bits() | ((packets as u32) << hctsiz::PKTCNT_SHIFT) | (size as u32 & hctsiz::XFERSIZE_MASK),
        );
        self.regs.write_dma_address(otg::hcdma(ch), address);
        self.regs.write(otg::hcchar(ch), characteristics);

        #[cfg(feature = "defmt")]
        defmt::trace!("Channel {} armed {} bytes {}", ch, size, pid);
    }

    pub(crate) fn frame_number(&self) -> u16 {
        (self.regs.read(otg::HFNUM) & otg::HFNUM_FRNUM_MASK) as u16
    }

    /// Halt an active channel and report `reason`
    ///
    /// A control stage, or a pipe whose stage is running on its IN channel,
    /// fails the whole message.
    pub(crate) fn fail_channel(&mut self, ch: usize, reason: UsbError) {
        if let Some(owner) = self.channels[ch].control_owner {
            if self.channels[ch].active {
                self.halt_hardware(ch);
                self.channels[ch].finish();
                self.finish_control(owner, Err(reason));
            }
            return;
        }
        if let Some(control) = self.channels[ch].control {
            let in_ = control.in_channel;
            if self.channels[in_].active {
                self.halt_hardware(in_);
                self.channels[in_].finish();
            }
            self.finish_control(ch, Err(reason));
            return;
        }
        if self.channels[ch].active {
            self.halt_hardware(ch);
            self.complete(ch, Err(reason));
        }
    }

    /// Fail every active channel with `reason`
    pub(crate) fn fail_all(&mut self, reason: UsbError) {
        for ch in 0..self.channels.len() {
            self.fail_channel(ch, reason);
        }
    }

    /// Report a finished plain transfer
    pub(crate) fn complete(&mut self, ch: usize, status: TransferStatus) {
        let c = &mut self.channels[ch];
        c.finish();
        let (transferred, remaining) = (c.transferred, c.remaining);
        self.stats.record_outcome(&status, transferred);

        match c.callback.take() {
            Some(callback) => {
                let _ = callback.complete(status, transferred, remaining);
            }
            None => c.outcome = Some((status, transferred, remaining)),
        }
    }

    /// A control stage finished on `ch`; move the pipe owned by `owner` on
    pub(crate) fn control_stage_done(&mut self, owner: usize, ch: usize, status: TransferStatus) {
        let transferred = self.channels[ch].transferred;
        self.channels[ch].finish();
        if status.is_err() {
            self.finish_control(owner, status);
            return;
        }

        let Some(mut control) = self.channels[owner].control else {
            return;
        };
        let data_in = control.setup.is_in();
        let in_ = control.in_channel;

        match control.stage {
            ControlStage::Setup if control.len > 0 => {
                control.stage = ControlStage::Data;
                self.channels[owner].control = Some(control);
                let ch = if data_in { in_ } else { owner };
                self.start_stage(owner, ch, control.buffer, control.len, Pid::Data1);
            }
            ControlStage::Setup | ControlStage::Data => {
                if control.stage == ControlStage::Data {
                    control.transferred = transferred;
                }
                control.stage = ControlStage::Status;
                self.channels[owner].control = Some(control);
                // Status runs opposite to the data stage; IN when there was none
                let status_in = !(data_in && control.len > 0);
                let ch = if status_in { in_ } else { owner };
                self.start_stage(owner, ch, DmaBuffer::empty(), 0, Pid::Data1);
            }
            ControlStage::Status => self.finish_control(owner, Ok(())),
        }
    }

    /// Report a finished control message
    fn finish_control(&mut self, owner: usize, status: TransferStatus) {
        let Some(control) = self.channels[owner].control.take() else {
            return;
        };
        let transferred = control.transferred;
        let remaining = control.len.saturating_sub(transferred);
        self.stats.record_outcome(&status, transferred);

        #[cfg(feature = "defmt")]
        if let Err(e) = status {
            defmt::debug!("Control request failed in {} stage: {}", control.stage, e);
        }

        match control.callback {
            Some(callback) => {
                let _ = callback.complete(status, transferred, remaining);
            }
            None => self.channels[owner].outcome = Some((status, transferred, remaining)),
        }
    }

    pub(crate) fn begin_reset(&mut self) {
        let now = self.clock.now_ms();
        self.write_hprt(Hprt::PRTRST.bits(), (Hprt::PRTSUSP | Hprt::PRTRES).bits());
        self.port_timer.start(now, self.config.reset_ms);
        self.set_port(match self.port {
            PortState::Debouncing => PortEvent::DebounceElapsed,
            _ => PortEvent::ResetRequested,
        });
    }

    fn port_reset(&mut self) -> Result<()> {
        if !matches!(self.port, PortState::Connected | PortState::Suspended) {
            return Err(UsbError::IllegalOperation);
        }
        self.fail_all(UsbError::DeviceReset);
        self.speed = None;
        self.begin_reset();
        Ok(())
    }

    fn port_suspend(&mut self) -> Result<()> {
        if self.port != PortState::Connected {
            return Err(UsbError::IllegalOperation);
        }
        self.fail_all(UsbError::DeviceSuspended);
        self.write_hprt(Hprt::PRTSUSP.bits(), 0);
        self.set_port(PortEvent::Suspend);
        Ok(())
    }

    fn port_resume(&mut self) -> Result<()> {
        if self.port != PortState::Suspended {
            return Err(UsbError::IllegalOperation);
        }
        let now = self.clock.now_ms();
        self.write_hprt(Hprt::PRTRES.bits(), 0);
        self.port_timer.start(now, self.config.resume_ms);
        Ok(())
    }

    fn recover_overcurrent(&mut self) -> Result<()> {
        if self.port != PortState::Overcurrent {
            return Err(UsbError::IllegalOperation);
        }
        if self.regs.read(otg::HPRT) & Hprt::PRTOVRCURRACT.bits() != 0 {
            return Err(UsbError::PortOvercurrent);
        }
        self.vbus.reset_overcurrent()?;
        self.vbus.enable_vbus()?;
        self.write_hprt(Hprt::PRTPWR.bits(), 0);
        self.set_port(PortEvent::Recover);
        Ok(())
    }

    pub(crate) fn set_port(&mut self, event: PortEvent) {
        let next = self.port.next(event);
        if next != self.port {
            #[cfg(feature = "defmt")]
            defmt::info!("Port {} -> {} ({})", self.port, next, event);

            self.port = next;
        }
    }
}

/// USB host controller
pub struct UsbHost<R, V, K, G = NoGate>
where
    R: RegisterBlock,
    V: VbusPowerControl,
    K: Clock,
    G: InterruptGate,
{
    host: Controller<R, V, K>,
    gate: G,
}

impl<R, V, K> UsbHost<R, V, K, NoGate>
where
    R: RegisterBlock,
    V: VbusPowerControl,
    K: Clock,
{
    /// Create a controller; call [`UsbHost::init`] before use
    pub fn new(regs: R, config: HostConfig, vbus: V, clock: K, scratch: &'static mut ChannelScratch) -> Self {
        Self {
            host: Controller {
                regs,
                config,
                vbus,
                clock,
                channels: Vec::new(),
                scratch: NonNull::from(scratch),
                port: PortState::Disconnected,
                port_timer: SoftTimer::new(),
                speed: None,
                last_frame: 0,
                stats: UsbStats::new(),
            },
            gate: NoGate,
        }
    }
}

impl<R, V, K, G> UsbHost<R, V, K, G>
where
    R: RegisterBlock,
    V: VbusPowerControl,
    K: Clock,
    G: InterruptGate,
{
    /// Replace the interrupt gate used for call-context exclusion
    pub fn with_gate<G2: InterruptGate>(self, gate: G2) -> UsbHost<R, V, K, G2> {
        UsbHost { host: self.host, gate }
    }

    /// Reset the core into host mode and power the port
    ///
    /// Fails with `IllegalOperation` if the FIFO sizes do not fit the FIFO
    /// RAM, `DeviceMalfunction` if the core never leaves soft reset and
    /// with the VBUS switch's error if power cannot be applied.
    pub fn init(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.init()
    }

    /// Assign a channel to a bulk, interrupt or isochronous endpoint
    ///
    /// Fails with `HostChannelBusy` when no channel is free.
    pub fn assign_endpoint(&mut self, endpoint: HostEndpoint) -> Result<ChannelId> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.assign_endpoint(endpoint)
    }

    /// Assign the OUT and IN channels for a device's control endpoint
    ///
    /// Takes both channels or neither.
    pub fn assign_control(&mut self, device_address: u8, max_packet_size: u16, low_speed: bool) -> Result<ControlPipe> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.assign_control(device_address, max_packet_size, low_speed)
    }

    /// Free a channel, aborting any transfer on it with `EndpointAborted`
    pub fn release_endpoint(&mut self, channel: ChannelId) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.release(channel)
    }

    /// Free both channels of a control pipe
    pub fn release_control(&mut self, pipe: ControlPipe) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.release(pipe.out)?;
        self.host.release(pipe.in_)
    }

    /// Point an idle channel at a new bus address (after SET_ADDRESS)
    pub fn set_device_address(&mut self, channel: ChannelId, device_address: u8) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        let ch = self.host.checked(channel)?;
        let c = &mut self.host.channels[ch];
        if device_address > 127 || c.active {
            return Err(UsbError::IllegalOperation);
        }
        if let Some(endpoint) = c.endpoint.as_mut() {
            endpoint.device_address = device_address;
        }
        Ok(())
    }

    /// Start reading `len` bytes from an IN endpoint
    ///
    /// `timeout_ms` of zero waits forever. With no callback the outcome is
    /// kept for [`UsbHost::take_outcome`].
    pub fn read(
        &mut self,
        channel: ChannelId,
        buffer: DmaBuffer,
        len: usize,
        timeout_ms: u32,
        callback: Option<Completion>,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.submit(channel, Direction::In, buffer, len, timeout_ms, callback)
    }

    /// Start writing `len` bytes to an OUT endpoint
    pub fn write(
        &mut self,
        channel: ChannelId,
        buffer: DmaBuffer,
        len: usize,
        timeout_ms: u32,
        callback: Option<Completion>,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.submit(channel, Direction::Out, buffer, len, timeout_ms, callback)
    }

    /// Read and wait; returns the byte count
    pub fn read_blocking(&mut self, channel: ChannelId, buffer: DmaBuffer, len: usize, timeout_ms: u32) -> Result<usize> {
        self.read(channel, buffer, len, timeout_ms, None)?;
        self.wait(channel)
    }

    /// Write and wait; returns the byte count
    pub fn write_blocking(&mut self, channel: ChannelId, buffer: DmaBuffer, len: usize, timeout_ms: u32) -> Result<usize> {
        self.write(channel, buffer, len, timeout_ms, None)?;
        self.wait(channel)
    }

    /// Start a control message on `pipe`
    ///
    /// The data stage direction and length come from `setup`; `buffer` must
    /// cover wLength bytes. The callback reports the data stage byte count.
    pub fn control_message(
        &mut self,
        pipe: ControlPipe,
        setup: SetupPacket,
        buffer: DmaBuffer,
        timeout_ms: u32,
        callback: Option<Completion>,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.control_message(pipe, setup, buffer, timeout_ms, callback)
    }

    /// Run a control message and wait; returns the data stage byte count
    pub fn control_message_blocking(
        &mut self,
        pipe: ControlPipe,
        setup: SetupPacket,
        buffer: DmaBuffer,
        timeout_ms: u32,
    ) -> Result<usize> {
        self.control_message(pipe, setup, buffer, timeout_ms, None)?;
        self.wait(pipe.out)
    }

    /// Service the controller until the transfer on `channel` reports
    fn wait(&mut self, channel: ChannelId) -> Result<usize> {
        loop {
            self.on_interrupt();
            self.poll();
            if let Some((status, transferred, _)) = self.take_outcome(channel) {
                return status.map(|()| transferred);
            }
        }
    }

    /// Final result of a transfer started without a callback
    pub fn take_outcome(&mut self, channel: ChannelId) -> Option<Outcome> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.channels.get_mut(channel.index()).and_then(|c| c.outcome.take())
    }

    /// Cancel the transfer on a channel, reporting `EndpointAborted`
    pub fn abort(&mut self, channel: ChannelId) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        let ch = self.host.checked(channel)?;
        self.host.fail_channel(ch, UsbError::EndpointAborted);
        Ok(())
    }

    /// Re-run reset signalling on the port
    ///
    /// Outstanding transfers fail with `DeviceReset`.
    pub fn port_reset(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.port_reset()
    }

    /// Suspend the port; outstanding transfers fail with `DeviceSuspended`
    pub fn port_suspend(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.port_suspend()
    }

    /// Drive resume signalling; the port is usable again once it ends
    pub fn port_resume(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.port_resume()
    }

    /// Leave the over-current state once the fault is gone
    ///
    /// Power comes back and the port waits for a fresh attach.
    pub fn recover_overcurrent(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.host.recover_overcurrent()
    }

    /// Root port state
    pub fn port_state(&self) -> PortState {
        self.host.port
    }

    /// Speed of the attached device once the port is enabled
    pub fn device_speed(&self) -> Option<DeviceSpeed> {
        self.host.speed
    }

    /// Channel bookkeeping
    pub fn channel(&self, channel: ChannelId) -> Option<&Channel> {
        self.host.channels.get(channel.index())
    }

    /// Hardware channels available
    pub fn channel_count(&self) -> usize {
        self.host.channels.len()
    }

    /// Transfer and event counters
    pub fn stats(&self) -> &UsbStats {
        &self.host.stats
    }

    /// Configuration the host was built with
    pub fn config(&self) -> &HostConfig {
        &self.host.config
    }

    /// Register interface
    pub fn registers(&self) -> &R {
        &self.host.regs
    }

    /// VBUS switch
    pub fn vbus(&self) -> &V {
        &self.host.vbus
    }

    /// VBUS switch, mutably
    pub fn vbus_mut(&mut self) -> &mut V {
        &mut self.host.vbus
    }
}
