//! Simulated EFM32 USB peripheral for testing without hardware
//!
//! [`MockUsb`] stands in for the register window behind [`RegisterBlock`].
//! It behaves like the core where the driver depends on it:
//!
//! - interrupt status registers clear on write-1
//! - CNAK/SNAK/SETDxPID/EPDIS act on write and read back as zero; DPID and
//!   NAKSTS reflect them
//! - DAINT, HAINT and the summary bits of GINTSTS are derived from the
//!   per-endpoint and per-channel flags
//! - FIFO flushes and soft reset complete at once; global NAKs take effect
//!   at once; disabling an endpoint or channel raises its disabled/halted
//!   flag
//!
//! DMA addresses are kept at full host width, so the simulation helpers can
//! move SETUP packets, OUT data and IN data through the memory the driver
//! actually programmed.

use efm32_usb::otg::{
    self, deptsiz, hctsiz, Dctl, DepCtl, DiepInt, DoepInt, Gint, GrstCtl, HcChar, HcInt, Hprt, WrapperIf,
    WrapperStatus,
};
use efm32_usb::transfer::{Aligned, Completion, TransferComplete};
use efm32_usb::vbus::{VbusPowerControl, VbusState};
use efm32_usb::{
    ChannelScratch, ControlBuffer, ControlEndpoint, DeviceCallbacks, DeviceState, DmaBuffer, PowerHooks,
    RegisterBlock, Result, SetupPacket, SetupResult, TransferStatus, UsbError,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;

/// Endpoint and channel register blocks the map provides for
const BLOCKS: usize = 16;
const STRIDE: usize = 0x20;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ctl,
    Int,
    Tsiz,
    Dma,
    Other,
}

fn slot(relative: usize) -> Slot {
    match relative % STRIDE {
        0x00 => Slot::Ctl,
        0x08 => Slot::Int,
        0x10 => Slot::Tsiz,
        0x14 => Slot::Dma,
        _ => Slot::Other,
    }
}

/// `(is_in, endpoint, register)` for a device endpoint register
fn endpoint_register(offset: usize) -> Option<(bool, usize, Slot)> {
    for (is_in, base) in [(true, otg::diepctl(0)), (false, otg::doepctl(0))] {
        if (base..base + BLOCKS * STRIDE).contains(&offset) {
            let relative = offset - base;
            return Some((is_in, relative / STRIDE, slot(relative)));
        }
    }
    None
}

/// `(channel, register)` for a host channel register
fn channel_register(offset: usize) -> Option<(usize, Slot)> {
    let base = otg::hcchar(0);
    if (base..base + BLOCKS * STRIDE).contains(&offset) {
        let relative = offset - base;
        return Some((relative / STRIDE, slot(relative)));
    }
    None
}

/// How the simulated device answers one channel enable
#[derive(Debug, Clone)]
pub struct HostReply {
    /// HCINT flags raised with the halt; CHHLTD is always added
    pub flags: HcInt,
    /// Bytes an IN channel receives
    pub data: Vec<u8>,
    /// Bytes an OUT channel gets acknowledged; `None` means every byte on
    /// completion and none otherwise
    pub accepted: Option<usize>,
}

impl HostReply {
    /// IN transfer finishes with `data`
    pub fn data_in(data: &[u8]) -> Self {
        Self { flags: HcInt::XFERCOMPL | HcInt::ACK, data: data.to_vec(), accepted: None }
    }

    /// OUT transfer (or SETUP) acknowledged in full
    pub fn ack() -> Self {
        Self { flags: HcInt::XFERCOMPL | HcInt::ACK, data: Vec::new(), accepted: None }
    }

    pub fn nak() -> Self {
        Self { flags: HcInt::NAK, data: Vec::new(), accepted: None }
    }

    pub fn stall() -> Self {
        Self { flags: HcInt::STALL, data: Vec::new(), accepted: None }
    }

    pub fn transaction_error() -> Self {
        Self { flags: HcInt::XACTERR, data: Vec::new(), accepted: None }
    }

    pub fn babble() -> Self {
        Self { flags: HcInt::BBLERR, data: Vec::new(), accepted: None }
    }

    /// OUT transfer NAKed after `bytes` went through
    pub fn nak_after(bytes: usize) -> Self {
        Self { flags: HcInt::NAK | HcInt::ACK, data: Vec::new(), accepted: Some(bytes) }
    }
}

/// Simulated register window
#[derive(Default)]
pub struct MockUsb {
    regs: RefCell<HashMap<usize, u32>>,
    dma: RefCell<HashMap<usize, usize>>,
    writes: RefCell<Vec<(usize, u32)>>,
    replies: RefCell<HashMap<usize, VecDeque<HostReply>>>,
    sent: RefCell<Vec<(usize, Vec<u8>)>>,
    in_nak: Cell<bool>,
    out_nak: Cell<bool>,
    frozen: Cell<bool>,
    tx_flushes: Cell<u32>,
    rx_flushes: Cell<u32>,
}

impl RegisterBlock for MockUsb {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            otg::GRSTCTL => {
                let value = self.peek(offset);
                if self.frozen.get() {
                    value & !GrstCtl::AHBIDLE.bits()
                } else {
                    value | GrstCtl::AHBIDLE.bits()
                }
            }
            otg::GINTSTS => self.peek(offset) | self.derived_gintsts(),
            otg::DAINT => self.daint(),
            otg::HAINT => self.haint(),
            otg::DCTL => {
                let mut value = self.peek(offset);
                if self.in_nak.get() {
                    value |= Dctl::GNPINNAKSTS.bits();
                }
                if self.out_nak.get() {
                    value |= Dctl::GOUTNAKSTS.bits();
                }
                value
            }
            _ => self.peek(offset),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.borrow_mut().push((offset, value));

        if let Some((is_in, ep, register)) = endpoint_register(offset) {
            match register {
                Slot::Ctl => self.write_depctl(is_in, ep, value),
                Slot::Int => self.write_1_to_clear_raw(offset, value),
                Slot::Dma => self.write_dma_register(offset, value),
                Slot::Tsiz | Slot::Other => self.poke(offset, value),
            }
            return;
        }

        if let Some((ch, register)) = channel_register(offset) {
            match register {
                Slot::Ctl => self.write_hcchar(ch, value),
                Slot::Int => self.write_1_to_clear_raw(offset, value),
                Slot::Dma => self.write_dma_register(offset, value),
                Slot::Tsiz | Slot::Other => self.poke(offset, value),
            }
            return;
        }

        match offset {
            otg::GRSTCTL => self.write_grstctl(value),
            otg::GINTSTS => self.write_1_to_clear_raw(offset, value),
            otg::DCTL => self.write_dctl(value),
            otg::IFC => self.poke(otg::IF, self.peek(otg::IF) & !value),
            otg::IFS => self.poke(otg::IF, self.peek(otg::IF) | value),
            otg::HPRT => self.write_hprt(value),
            otg::DAINT | otg::HAINT => {}
            _ => self.poke(offset, value),
        }
    }

    fn write_dma_address(&self, offset: usize, address: *const u8) {
        self.writes.borrow_mut().push((offset, address as usize as u32));
        self.poke(offset, address as usize as u32);
        self.dma.borrow_mut().insert(offset, address as usize);
    }
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    // === Raw access ===

    /// Stored register value, without derived bits
    pub fn peek(&self, offset: usize) -> u32 {
        self.regs.borrow().get(&offset).copied().unwrap_or(0)
    }

    /// Store a register value, bypassing write semantics
    pub fn poke(&self, offset: usize, value: u32) {
        self.regs.borrow_mut().insert(offset, value);
    }

    /// OR bits into a register, bypassing write semantics
    pub fn raise_bits(&self, offset: usize, bits: u32) {
        self.poke(offset, self.peek(offset) | bits);
    }

    fn drop_bits(&self, offset: usize, bits: u32) {
        self.poke(offset, self.peek(offset) & !bits);
    }

    fn write_1_to_clear_raw(&self, offset: usize, value: u32) {
        self.drop_bits(offset, value);
    }

    /// Every value the driver wrote to `offset`, oldest first
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .borrow()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_write_log(&self) {
        self.writes.borrow_mut().clear();
    }

    pub fn tx_flushes(&self) -> u32 {
        self.tx_flushes.get()
    }

    pub fn rx_flushes(&self) -> u32 {
        self.rx_flushes.get()
    }

    /// Stop completing handshakes: no soft reset or flush finishes, no NAK
    /// takes effect and nothing disables
    pub fn freeze(&self, frozen: bool) {
        self.frozen.set(frozen);
    }

    /// Full-width address last programmed into a DMA register
    pub fn dma_address(&self, offset: usize) -> usize {
        self.dma
            .borrow()
            .get(&offset)
            .copied()
            .unwrap_or_else(|| self.peek(offset) as usize)
    }

    pub fn read_memory(&self, address: usize, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        // SAFETY: DMA addresses come from leaked test buffers and driver
        // scratch areas that live for the whole test
        unsafe { std::slice::from_raw_parts(address as *const u8, len).to_vec() }
    }

    pub fn write_memory(&self, address: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        // SAFETY: as for read_memory
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
    }

    // === Derived registers ===

    fn daint(&self) -> u32 {
        let diepmsk = self.peek(otg::DIEPMSK);
        // SETUP reception is reported whether or not it is masked
        let doepmsk = self.peek(otg::DOEPMSK) | DoepInt::STUPPKTRCVD.bits();
        let mut bits = 0;
        for ep in 0..BLOCKS {
            if self.peek(otg::diepint(ep)) & diepmsk != 0 {
                bits |= 1 << ep;
            }
            if self.peek(otg::doepint(ep)) & doepmsk != 0 {
                bits |= 1 << (16 + ep);
            }
        }
        bits
    }

    fn haint(&self) -> u32 {
        let mut bits = 0;
        for ch in 0..BLOCKS {
            if self.peek(otg::hcint(ch)) & self.peek(otg::hcintmsk(ch)) != 0 {
                bits |= 1 << ch;
            }
        }
        bits
    }

    fn derived_gintsts(&self) -> u32 {
        let mut bits = Gint::empty();
        if self.in_nak.get() {
            bits |= Gint::GINNAKEFF;
        }
        if self.out_nak.get() {
            bits |= Gint::GOUTNAKEFF;
        }
        let daint = self.daint();
        if daint & 0xFFFF != 0 {
            bits |= Gint::IEPINT;
        }
        if daint >> 16 != 0 {
            bits |= Gint::OEPINT;
        }
        if self.haint() != 0 {
            bits |= Gint::HCHINT;
        }
        let changes = (Hprt::PRTCONNDET | Hprt::PRTENCHNG | Hprt::PRTOVRCURRCHNG).bits();
        if self.peek(otg::HPRT) & changes != 0 {
            bits |= Gint::PRTINT;
        }
        bits.bits()
    }

    // === Write semantics ===

    fn write_grstctl(&self, value: u32) {
        if value & GrstCtl::TXFFLSH.bits() != 0 {
            self.tx_flushes.set(self.tx_flushes.get() + 1);
        }
        if value & GrstCtl::RXFFLSH.bits() != 0 {
            self.rx_flushes.set(self.rx_flushes.get() + 1);
        }
        let self_clearing = (GrstCtl::CSFTRST | GrstCtl::RXFFLSH | GrstCtl::TXFFLSH).bits();
        if self.frozen.get() {
            self.poke(otg::GRSTCTL, value);
        } else {
            self.poke(otg::GRSTCTL, value & !self_clearing);
        }
    }

    fn write_dctl(&self, value: u32) {
        let dctl = Dctl::from_bits_retain(value);
        if !self.frozen.get() {
            if dctl.contains(Dctl::SGNPINNAK) {
                self.in_nak.set(true);
            }
            if dctl.contains(Dctl::SGOUTNAK) {
                self.out_nak.set(true);
            }
        }
        if dctl.contains(Dctl::CGNPINNAK) {
            self.in_nak.set(false);
        }
        if dctl.contains(Dctl::CGOUTNAK) {
            self.out_nak.set(false);
        }
        let actions = Dctl::SGNPINNAK
            | Dctl::CGNPINNAK
            | Dctl::SGOUTNAK
            | Dctl::CGOUTNAK
            | Dctl::GNPINNAKSTS
            | Dctl::GOUTNAKSTS;
        self.poke(otg::DCTL, value & !actions.bits());
    }

    fn write_depctl(&self, is_in: bool, ep: usize, value: u32) {
        let (ctl, int) = if is_in {
            (otg::diepctl(ep), otg::diepint(ep))
        } else {
            (otg::doepctl(ep), otg::doepint(ep))
        };
        let old = self.peek(ctl);
        let written = DepCtl::from_bits_retain(value);
        let mut dpid = old & DepCtl::DPID.bits();
        let mut naksts = old & DepCtl::NAKSTS.bits();

        if written.contains(DepCtl::SNAK) {
            naksts = DepCtl::NAKSTS.bits();
            if is_in && !self.frozen.get() {
                self.raise_bits(int, DiepInt::INEPNAKEFF.bits());
            }
        }
        if written.contains(DepCtl::CNAK) {
            naksts = 0;
        }
        if written.contains(DepCtl::SETD0PID) {
            dpid = 0;
        }
        if written.contains(DepCtl::SETD1PID) {
            dpid = DepCtl::DPID.bits();
        }

        let mut value = value & !(DepCtl::ONE_SHOT | DepCtl::DPID | DepCtl::NAKSTS).bits();
        let enabled = written.contains(DepCtl::EPENA) || old & DepCtl::EPENA.bits() != 0;
        if written.contains(DepCtl::EPDIS) && enabled && !self.frozen.get() {
            value &= !DepCtl::EPENA.bits();
            // EPDISBLD is bit 1 in both directions
            self.raise_bits(int, DiepInt::EPDISBLD.bits());
        }
        self.poke(ctl, value | dpid | naksts);
    }

    fn write_hcchar(&self, ch: usize, value: u32) {
        let old = self.peek(otg::hcchar(ch));
        let written = HcChar::from_bits_retain(value);

        if written.contains(HcChar::CHDIS) {
            if self.frozen.get() {
                self.poke(otg::hcchar(ch), value & !HcChar::CHDIS.bits());
            } else {
                self.poke(otg::hcchar(ch), value & !(HcChar::CHDIS | HcChar::CHENA).bits());
                if old & HcChar::CHENA.bits() != 0 {
                    self.raise_bits(otg::hcint(ch), HcInt::CHHLTD.bits());
                }
            }
            return;
        }

        self.poke(otg::hcchar(ch), value);
        if written.contains(HcChar::CHENA) {
            let reply = self.replies.borrow_mut().get_mut(&ch).and_then(|q| q.pop_front());
            if let Some(reply) = reply {
                self.halt_channel(ch, reply);
            }
        }
    }

    fn write_hprt(&self, value: u32) {
        let w1c = Hprt::W1C.bits();
        let read_only = (Hprt::PRTCONNSTS | Hprt::PRTOVRCURRACT | Hprt::PRTSPD_MASK | Hprt::PRTLNSTS_MASK).bits();
        let old = self.peek(otg::HPRT);
        let kept = old & (w1c | read_only) & !(value & w1c);
        self.poke(otg::HPRT, kept | (value & !(w1c | read_only)));
    }

    fn write_dma_register(&self, offset: usize, value: u32) {
        self.poke(offset, value);
        let mut dma = self.dma.borrow_mut();
        // A snapshot restore writes back the truncated address
        match dma.get(&offset) {
            Some(&full) if full as u32 == value => {}
            _ => {
                dma.insert(offset, value as usize);
            }
        }
    }

    // === Device-mode events ===

    /// VBUS rises
    pub fn vbus_on(&self) {
        self.raise_bits(otg::STATUS, WrapperStatus::VREGOS.bits());
        self.raise_bits(otg::IF, WrapperIf::VREGOSH.bits());
    }

    /// VBUS falls
    pub fn vbus_off(&self) {
        self.drop_bits(otg::STATUS, WrapperStatus::VREGOS.bits());
        self.raise_bits(otg::IF, WrapperIf::VREGOSL.bits());
    }

    /// Raise core interrupt flags
    pub fn raise(&self, flags: Gint) {
        self.raise_bits(otg::GINTSTS, flags.bits());
    }

    /// Current frame number in both roles
    pub fn set_frame(&self, frame: u16) {
        let dsts = self.peek(otg::DSTS) & !otg::dsts::SOFFN_MASK;
        self.poke(otg::DSTS, dsts | ((frame as u32) << otg::dsts::SOFFN_SHIFT));
        self.poke(otg::HFNUM, frame as u32);
    }

    /// Host sends a SETUP packet to EP0
    ///
    /// The packet lands in the ring slot SUPCNT points at, SUPCNT counts
    /// down and both SETUP events are raised.
    pub fn deliver_setup(&self, setup: &SetupPacket) {
        let tsiz_offset = otg::doeptsiz(0);
        let tsiz = self.peek(tsiz_offset);
        let supcnt = (tsiz & deptsiz::SUPCNT_MASK) >> deptsiz::SUPCNT_SHIFT;
        let slot = 3 - supcnt.clamp(1, 3) as usize;
        let ring = self.dma_address(otg::doepdma(0));
        self.write_memory(ring + slot * SetupPacket::SIZE, &setup.to_bytes());

        let supcnt = supcnt.saturating_sub(1);
        self.poke(tsiz_offset, (tsiz & !deptsiz::SUPCNT_MASK) | (supcnt << deptsiz::SUPCNT_SHIFT));
        self.raise_bits(otg::doepint(0), (DoepInt::STUPPKTRCVD | DoepInt::SETUP).bits());
    }

    fn xfersize_mask(ep: usize) -> u32 {
        if ep == 0 {
            deptsiz::EP0_XFERSIZE_MASK
        } else {
            deptsiz::XFERSIZE_MASK
        }
    }

    /// Bytes armed on an IN endpoint
    pub fn armed_in(&self, ep: usize) -> usize {
        (self.peek(otg::dieptsiz(ep)) & Self::xfersize_mask(ep)) as usize
    }

    /// Bytes armed on an OUT endpoint
    pub fn armed_out(&self, ep: usize) -> usize {
        (self.peek(otg::doeptsiz(ep)) & Self::xfersize_mask(ep)) as usize
    }

    pub fn in_enabled(&self, ep: usize) -> bool {
        self.peek(otg::diepctl(ep)) & DepCtl::EPENA.bits() != 0
    }

    pub fn out_enabled(&self, ep: usize) -> bool {
        self.peek(otg::doepctl(ep)) & DepCtl::EPENA.bits() != 0
    }

    pub fn in_stalled(&self, ep: usize) -> bool {
        self.peek(otg::diepctl(ep)) & DepCtl::STALL.bits() != 0
    }

    pub fn out_stalled(&self, ep: usize) -> bool {
        self.peek(otg::doepctl(ep)) & DepCtl::STALL.bits() != 0
    }

    /// Host takes everything armed on an IN endpoint; returns the bytes
    pub fn complete_in(&self, ep: usize) -> Vec<u8> {
        self.complete_in_partial(ep, usize::MAX)
    }

    /// Host takes up to `sent` bytes, then the transfer completes short
    pub fn complete_in_partial(&self, ep: usize, sent: usize) -> Vec<u8> {
        let mask = Self::xfersize_mask(ep);
        let tsiz_offset = otg::dieptsiz(ep);
        let tsiz = self.peek(tsiz_offset);
        let size = (tsiz & mask) as usize;
        let sent = sent.min(size);
        let data = self.read_memory(self.dma_address(otg::diepdma(ep)), sent);

        self.poke(tsiz_offset, (tsiz & !(mask | deptsiz::PKTCNT_MASK)) | (size - sent) as u32);
        self.drop_bits(otg::diepctl(ep), DepCtl::EPENA.bits());
        self.raise_bits(otg::diepint(ep), DiepInt::XFERCOMPL.bits());
        data
    }

    /// Host sends `data` to an OUT endpoint and the transfer completes
    pub fn complete_out(&self, ep: usize, data: &[u8]) {
        let mask = Self::xfersize_mask(ep);
        let tsiz_offset = otg::doeptsiz(ep);
        let tsiz = self.peek(tsiz_offset);
        let size = (tsiz & mask) as usize;
        let len = data.len().min(size);
        self.write_memory(self.dma_address(otg::doepdma(ep)), &data[..len]);

        self.poke(tsiz_offset, (tsiz & !(mask | deptsiz::PKTCNT_MASK)) | (size - len) as u32);
        self.drop_bits(otg::doepctl(ep), DepCtl::EPENA.bits());
        self.raise_bits(otg::doepint(ep), DoepInt::XFERCOMPL.bits());
    }

    /// Core power removed: every core register except the wake path reads
    /// zero until written again
    pub fn power_loss(&self) {
        let keep = [otg::GINTMSK, otg::PCGCCTL, otg::GRSTCTL];
        let mut regs = self.regs.borrow_mut();
        for (offset, value) in regs.iter_mut() {
            if *offset >= otg::CORE && !keep.contains(offset) {
                *value = 0;
            }
        }
    }

    // === Host-mode events ===

    /// Device plugged into the root port
    pub fn attach(&self) {
        self.raise_bits(otg::HPRT, (Hprt::PRTCONNSTS | Hprt::PRTCONNDET).bits());
    }

    /// Reset finished and the core enabled the port
    pub fn enable_port(&self, low_speed: bool) {
        let speed = if low_speed { Hprt::SPEED_LOW } else { Hprt::SPEED_FULL };
        let hprt = self.peek(otg::HPRT) & !Hprt::PRTSPD_MASK.bits();
        self.poke(
            otg::HPRT,
            hprt | (Hprt::PRTENA | Hprt::PRTENCHNG).bits() | (speed << Hprt::PRTSPD_SHIFT),
        );
    }

    /// Device unplugged
    pub fn detach(&self) {
        self.drop_bits(otg::HPRT, (Hprt::PRTCONNSTS | Hprt::PRTENA).bits());
        self.raise(Gint::DISCONNINT);
    }

    /// Core reports over-current on the port
    pub fn port_overcurrent(&self, active: bool) {
        if active {
            self.raise_bits(otg::HPRT, (Hprt::PRTOVRCURRACT | Hprt::PRTOVRCURRCHNG).bits());
        } else {
            self.drop_bits(otg::HPRT, Hprt::PRTOVRCURRACT.bits());
            self.raise_bits(otg::HPRT, Hprt::PRTOVRCURRCHNG.bits());
        }
    }

    pub fn hprt(&self) -> Hprt {
        Hprt::from_bits_retain(self.peek(otg::HPRT))
    }

    /// Answer the next enable of `ch` with `reply`
    pub fn queue_reply(&self, ch: usize, reply: HostReply) {
        self.replies.borrow_mut().entry(ch).or_default().push_back(reply);
    }

    pub fn channel_enabled(&self, ch: usize) -> bool {
        self.peek(otg::hcchar(ch)) & HcChar::CHENA.bits() != 0
    }

    /// Bytes each OUT enable of `ch` carried, oldest first
    pub fn sent_on(&self, ch: usize) -> Vec<Vec<u8>> {
        self.sent
            .borrow()
            .iter()
            .filter(|(c, _)| *c == ch)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Halt an enabled channel the way the core does after `reply`
    pub fn halt_channel(&self, ch: usize, reply: HostReply) {
        let characteristics = self.peek(otg::hcchar(ch));
        let tsiz = self.peek(otg::hctsiz(ch));
        let mps = ((characteristics & HcChar::MPS_MASK.bits()) as usize).max(1);
        let size = (tsiz & hctsiz::XFERSIZE_MASK) as usize;
        let packets = ((tsiz & hctsiz::PKTCNT_MASK) >> hctsiz::PKTCNT_SHIFT) as usize;
        let pid = (tsiz & hctsiz::PID_MASK) >> hctsiz::PID_SHIFT;
        let address = self.dma_address(otg::hcdma(ch));
        let is_in = characteristics & HcChar::EPDIR.bits() != 0;
        let complete = reply.flags.contains(HcInt::XFERCOMPL);

        let moved = if is_in {
            let len = reply.data.len().min(size);
            self.write_memory(address, &reply.data[..len]);
            len
        } else {
            self.sent.borrow_mut().push((ch, self.read_memory(address, size)));
            reply.accepted.unwrap_or(if complete { size } else { 0 }).min(size)
        };

        let used = if moved == 0 {
            usize::from(complete)
        } else {
            (moved + mps - 1) / mps
        };
        let next_pid = match pid {
            hctsiz::PID_DATA0 | hctsiz::PID_DATA1 if used % 2 == 1 => pid ^ (hctsiz::PID_DATA1 ^ hctsiz::PID_DATA0),
            hctsiz::PID_SETUP if used > 0 => hctsiz::PID_DATA1,
            other => other,
        };

        self.poke(
            otg::hctsiz(ch),
            (next_pid << hctsiz::PID_SHIFT)
                | ((packets.saturating_sub(used) as u32) << hctsiz::PKTCNT_SHIFT)
                | (size - moved) as u32,
        );
        self.drop_bits(otg::hcchar(ch), HcChar::CHENA.bits());
        self.raise_bits(otg::hcint(ch), (reply.flags | HcInt::CHHLTD).bits());
    }
}

// === Time, power and VBUS collaborators ===

/// Millisecond clock moved by the test
///
/// A ticking clock advances by `step` on every read, so blocking calls
/// eventually reach their timeout.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u32>,
    step: Cell<u32>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticking(step: u32) -> Self {
        Self { now: Cell::new(0), step: Cell::new(step) }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }
}

impl efm32_usb::timing::Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step.get()));
        now
    }
}

/// Load switch with a test-controlled over-current input
#[derive(Debug, Default)]
pub struct MockVbus {
    pub powered: bool,
    pub fault: bool,
    /// Over-current input level
    pub overcurrent: bool,
    /// Refuse to switch on
    pub broken: bool,
    pub enables: u32,
}

impl VbusPowerControl for MockVbus {
    fn enable_vbus(&mut self) -> Result<()> {
        if self.broken {
            return Err(UsbError::DeviceMalfunction);
        }
        if self.fault {
            return Err(UsbError::PortOvercurrent);
        }
        self.powered = true;
        self.enables += 1;
        Ok(())
    }

    fn disable_vbus(&mut self) {
        self.powered = false;
    }

    fn is_overcurrent(&mut self) -> bool {
        if self.powered && self.overcurrent {
            self.powered = false;
            self.fault = true;
        }
        self.fault
    }

    fn vbus_state(&self) -> VbusState {
        if self.fault {
            VbusState::OverCurrentFault
        } else if self.powered {
            VbusState::PowerGood
        } else {
            VbusState::PowerOff
        }
    }

    fn reset_overcurrent(&mut self) -> Result<()> {
        if self.overcurrent {
            return Err(UsbError::PortOvercurrent);
        }
        self.fault = false;
        Ok(())
    }
}

/// Power hooks that count what the driver asked for
#[derive(Debug, Default)]
pub struct HookLog {
    pub retention_clock: Cell<u32>,
    pub core_clock: Cell<u32>,
    pub deep_sleep: Cell<u32>,
    pub delays: RefCell<Vec<u32>>,
}

impl PowerHooks for &HookLog {
    fn select_retention_clock(&mut self) {
        self.retention_clock.set(self.retention_clock.get() + 1);
    }

    fn select_core_clock(&mut self) {
        self.core_clock.set(self.core_clock.get() + 1);
    }

    fn request_deep_sleep(&mut self) {
        self.deep_sleep.set(self.deep_sleep.get() + 1);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.borrow_mut().push(ms);
    }
}

// === Transfers ===

/// One completion callback invocation
pub type Call = (TransferStatus, usize, usize);

/// Completion handler that records every call
pub struct Recorder {
    calls: RefCell<Vec<Call>>,
    answer: Cell<Result<()>>,
}

impl Recorder {
    /// Leaked so it can be handed to the driver as a [`Completion`]
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self { calls: RefCell::new(Vec::new()), answer: Cell::new(Ok(())) }))
    }

    /// Recorder whose callback reports failure (stalls a control data stage)
    pub fn refusing() -> &'static Self {
        let recorder = Self::new();
        recorder.answer.set(Err(UsbError::RequestError));
        recorder
    }

    pub fn callback(&'static self) -> Option<Completion> {
        Some(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn last(&self) -> Option<Call> {
        self.calls.borrow().last().copied()
    }
}

impl TransferComplete for Recorder {
    fn complete(&self, status: TransferStatus, transferred: usize, remaining: usize) -> Result<()> {
        self.calls.borrow_mut().push((status, transferred, remaining));
        self.answer.get()
    }
}

/// Word-aligned memory that outlives the test
#[derive(Debug, Clone, Copy)]
pub struct TestBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl TestBuffer {
    pub fn new(len: usize) -> Self {
        let words: &'static mut [u32] = Box::leak(vec![0u32; len.div_ceil(4).max(1)].into_boxed_slice());
        let ptr = NonNull::new(words.as_mut_ptr() as *mut u8).expect("leaked allocation is non-null");
        Self { ptr, len }
    }

    pub fn with_data(data: &[u8]) -> Self {
        let buffer = Self::new(data.len());
        buffer.fill(data);
        buffer
    }

    /// Writable DMA handle over the whole buffer
    pub fn dma(&self) -> DmaBuffer {
        // SAFETY: the memory is leaked and lives for the rest of the test
        unsafe { DmaBuffer::from_raw_parts(self.ptr, self.len) }
    }

    /// Read-only DMA handle
    pub fn read_only(&self) -> DmaBuffer {
        // SAFETY: as for dma
        let bytes: &'static [u8] = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        DmaBuffer::from_static_ref(bytes)
    }

    /// Handle starting one byte in, so it is not word-aligned
    pub fn misaligned(&self) -> DmaBuffer {
        // SAFETY: as for dma; the handle stays inside the allocation
        unsafe { DmaBuffer::from_raw_parts(NonNull::new_unchecked(self.ptr.as_ptr().add(1)), self.len - 1) }
    }

    pub fn fill(&self, data: &[u8]) {
        let len = data.len().min(self.len);
        // SAFETY: as for dma
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), len) };
    }

    pub fn bytes(&self) -> Vec<u8> {
        // SAFETY: as for dma
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len).to_vec() }
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// EP0 DMA memory for one device
pub fn control_buffer() -> &'static mut ControlBuffer {
    Box::leak(Box::new(ControlBuffer::new()))
}

/// SETUP scratch memory for one host
pub fn channel_scratch() -> &'static mut ChannelScratch {
    Box::leak(Box::new(ChannelScratch::new()))
}

/// Bytes from 0 counting up, wrapping at 256
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

// === Device-side application ===

/// SETUP handler plugged into [`TestApp`]
pub type SetupHandler = fn(&SetupPacket, &mut dyn ControlEndpoint) -> SetupResult;

/// Application that records every callback
#[derive(Default)]
pub struct TestApp {
    pub transitions: Vec<(DeviceState, DeviceState)>,
    pub resets: u32,
    pub setups: Vec<SetupPacket>,
    pub frames: Vec<u16>,
    pub self_powered: Option<bool>,
    pub start_of_frame: bool,
    pub handler: Option<SetupHandler>,
}

impl TestApp {
    pub fn with_handler(handler: SetupHandler) -> Self {
        Self { handler: Some(handler), ..Self::default() }
    }
}

impl DeviceCallbacks for TestApp {
    fn on_reset(&mut self) {
        self.resets += 1;
    }

    fn on_state_change(&mut self, old: DeviceState, new: DeviceState) {
        self.transitions.push((old, new));
    }

    fn on_setup(&mut self, setup: &SetupPacket, ep0: &mut dyn ControlEndpoint) -> SetupResult {
        self.setups.push(*setup);
        match self.handler {
            Some(handler) => handler(setup, ep0),
            None => SetupResult::Unhandled,
        }
    }

    fn is_self_powered(&mut self) -> Option<bool> {
        self.self_powered
    }

    fn wants_start_of_frame(&self) -> bool {
        self.start_of_frame
    }

    fn on_start_of_frame(&mut self, frame: u16) {
        self.frames.push(frame);
    }
}

// === Descriptors ===

/// Standard USB 2.0 full-speed device descriptor
pub static DEVICE_DESCRIPTOR: Aligned<18> = Aligned::new([
    0x12,       // bLength
    0x01,       // bDescriptorType (DEVICE)
    0x00, 0x02, // bcdUSB (2.0)
    0x00,       // bDeviceClass (defined at interface level)
    0x00,       // bDeviceSubClass
    0x00,       // bDeviceProtocol
    0x40,       // bMaxPacketSize0 (64 bytes)
    0x34, 0x12, // idVendor (0x1234)
    0x78, 0x56, // idProduct (0x5678)
    0x00, 0x01, // bcdDevice (1.0)
    0x01,       // iManufacturer
    0x02,       // iProduct
    0x00,       // iSerialNumber
    0x01,       // bNumConfigurations
]);

/// Configuration with one vendor interface and a bulk endpoint pair
pub static CONFIG_DESCRIPTOR: Aligned<32> = Aligned::new([
    0x09,       // bLength
    0x02,       // bDescriptorType (CONFIGURATION)
    0x20, 0x00, // wTotalLength (32 bytes)
    0x01,       // bNumInterfaces
    0x01,       // bConfigurationValue
    0x00,       // iConfiguration
    0x80,       // bmAttributes (bus powered)
    0x32,       // bMaxPower (100mA)
    // Interface
    0x09,       // bLength
    0x04,       // bDescriptorType (INTERFACE)
    0x00,       // bInterfaceNumber
    0x00,       // bAlternateSetting
    0x02,       // bNumEndpoints
    0xFF,       // bInterfaceClass (vendor)
    0x00,       // bInterfaceSubClass
    0x00,       // bInterfaceProtocol
    0x00,       // iInterface
    // Endpoint 0x81
    0x07,       // bLength
    0x05,       // bDescriptorType (ENDPOINT)
    0x81,       // bEndpointAddress (EP1 IN)
    0x02,       // bmAttributes (bulk)
    0x40, 0x00, // wMaxPacketSize (64)
    0x00,       // bInterval
    // Endpoint 0x01
    0x07,       // bLength
    0x05,       // bDescriptorType (ENDPOINT)
    0x01,       // bEndpointAddress (EP1 OUT)
    0x02,       // bmAttributes (bulk)
    0x40, 0x00, // wMaxPacketSize (64)
    0x00,       // bInterval
]);

/// String descriptor 0: supported languages
pub static LANGUAGES: Aligned<4> = Aligned::new([
    0x04,       // bLength
    0x03,       // bDescriptorType (STRING)
    0x09, 0x04, // wLANGID[0] (0x0409 English US)
]);

/// String descriptor 1: "EFM"
pub static MANUFACTURER: Aligned<8> = Aligned::new([
    0x08,       // bLength
    0x03,       // bDescriptorType (STRING)
    b'E', 0x00, b'F', 0x00, b'M', 0x00,
]);

pub static STRINGS: [&[u8]; 2] = [&LANGUAGES.0, &MANUFACTURER.0];
