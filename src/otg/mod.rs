//! Register map of the EFM32 USB peripheral
//!
//! The peripheral is a thin EFM32 wrapper (VBUS sensing, low-energy mode
//! control, pin routing) around an embedded full-speed OTG core running in
//! buffer-DMA mode. Offsets below are byte offsets from the peripheral base.
//!
//! # Register Memory Layout
//!
//! - Wrapper registers (offset 0x000-0x01F)
//! - OTG core global registers (`CORE` + 0x000)
//! - Host-mode registers (`CORE` + 0x400), one 0x20 stride block per channel
//!   at `CORE` + 0x500
//! - Device-mode registers (`CORE` + 0x800), IN endpoints at `CORE` + 0x900,
//!   OUT endpoints at `CORE` + 0xB00
//! - Power and clock gating (`CORE` + 0xE00)

pub mod register;

pub use register::{Mmio, RegisterBlock};

use bitflags::bitflags;

/// Offset of the OTG core inside the peripheral
pub const CORE: usize = 0x3_C000;

// === Wrapper registers ===

/// Control register
pub const CTRL: usize = 0x000;
/// Status register
pub const STATUS: usize = 0x004;
/// Interrupt flags
pub const IF: usize = 0x008;
/// Interrupt flag set
pub const IFS: usize = 0x00C;
/// Interrupt flag clear
pub const IFC: usize = 0x010;
/// Interrupt enable
pub const IEN: usize = 0x014;
/// Pin routing
pub const ROUTE: usize = 0x018;

// === Core global registers ===

pub const GOTGCTL: usize = CORE + 0x000;
pub const GOTGINT: usize = CORE + 0x004;
pub const GAHBCFG: usize = CORE + 0x008;
pub const GUSBCFG: usize = CORE + 0x00C;
pub const GRSTCTL: usize = CORE + 0x010;
pub const GINTSTS: usize = CORE + 0x014;
pub const GINTMSK: usize = CORE + 0x018;
pub const GRXSTSR: usize = CORE + 0x01C;
pub const GRXSTSP: usize = CORE + 0x020;
pub const GRXFSIZ: usize = CORE + 0x024;
/// Non-periodic TX FIFO size in host mode, EP0 TX FIFO size in device mode
pub const GNPTXFSIZ: usize = CORE + 0x028;
pub const GNPTXSTS: usize = CORE + 0x02C;
pub const GSNPSID: usize = CORE + 0x040;
pub const GDFIFOCFG: usize = CORE + 0x05C;
pub const HPTXFSIZ: usize = CORE + 0x100;

/// Device IN endpoint TX FIFO size register, `fifo` in `1..`
#[inline(always)]
pub const fn dieptxf(fifo: usize) -> usize {
    CORE + 0x104 + (fifo - 1) * 4
}

// === Host-mode registers ===

pub const HCFG: usize = CORE + 0x400;
pub const HFIR: usize = CORE + 0x404;
pub const HFNUM: usize = CORE + 0x408;
pub const HPTXSTS: usize = CORE + 0x410;
pub const HAINT: usize = CORE + 0x414;
pub const HAINTMSK: usize = CORE + 0x418;
pub const HPRT: usize = CORE + 0x440;

#[inline(always)]
pub const fn hcchar(ch: usize) -> usize {
    CORE + 0x500 + ch * 0x20
}

#[inline(always)]
pub const fn hcint(ch: usize) -> usize {
    CORE + 0x508 + ch * 0x20
}

#[inline(always)]
pub const fn hcintmsk(ch: usize) -> usize {
    CORE + 0x50C + ch * 0x20
}

#[inline(always)]
pub const fn hctsiz(ch: usize) -> usize {
    CORE + 0x510 + ch * 0x20
}

#[inline(always)]
pub const fn hcdma(ch: usize) -> usize {
    CORE + 0x514 + ch * 0x20
}

// === Device-mode registers ===

pub const DCFG: usize = CORE + 0x800;
pub const DCTL: usize = CORE + 0x804;
pub const DSTS: usize = CORE + 0x808;
pub const DIEPMSK: usize = CORE + 0x810;
pub const DOEPMSK: usize = CORE + 0x814;
pub const DAINT: usize = CORE + 0x818;
pub const DAINTMSK: usize = CORE + 0x81C;
pub const DIEPEMPMSK: usize = CORE + 0x834;

#[inline(always)]
pub const fn diepctl(ep: usize) -> usize {
    CORE + 0x900 + ep * 0x20
}

#[inline(always)]
pub const fn diepint(ep: usize) -> usize {
    CORE + 0x908 + ep * 0x20
}

#[inline(always)]
pub const fn dieptsiz(ep: usize) -> usize {
    CORE + 0x910 + ep * 0x20
}

#[inline(always)]
pub const fn diepdma(ep: usize) -> usize {
    CORE + 0x914 + ep * 0x20
}

#[inline(always)]
pub const fn dtxfsts(ep: usize) -> usize {
    CORE + 0x918 + ep * 0x20
}

#[inline(always)]
pub const fn doepctl(ep: usize) -> usize {
    CORE + 0xB00 + ep * 0x20
}

#[inline(always)]
pub const fn doepint(ep: usize) -> usize {
    CORE + 0xB08 + ep * 0x20
}

#[inline(always)]
pub const fn doeptsiz(ep: usize) -> usize {
    CORE + 0xB10 + ep * 0x20
}

#[inline(always)]
pub const fn doepdma(ep: usize) -> usize {
    CORE + 0xB14 + ep * 0x20
}

/// Power and clock gating control
pub const PCGCCTL: usize = CORE + 0xE00;

/// Wait for the AHB master to go idle, then soft-reset the core
///
/// Returns `false` if either step outlasts `budget` polls.
pub fn core_soft_reset<R: RegisterBlock>(regs: &R, budget: u32) -> bool {
    let idle = crate::timing::PollBudget::new(budget).wait(|| regs.read(GRSTCTL) & GrstCtl::AHBIDLE.bits() != 0);
    if !idle {
        return false;
    }
    regs.set_bits(GRSTCTL, GrstCtl::CSFTRST.bits());
    crate::timing::PollBudget::new(budget).wait(|| regs.read(GRSTCTL) & GrstCtl::CSFTRST.bits() == 0)
}

bitflags! {
    /// Wrapper control register (CTRL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctrl: u32 {
        /// VBUSEN pin active polarity
        const VBUSENAP = 1 << 0;
        /// D- pull-up pin active polarity
        const DMPUAP = 1 << 1;
        /// Low-energy mode: gate the USB core clock when idle
        const LEMOSCCTRL_GATE = 1 << 4;
        /// Low-energy mode: suspend the USB core clock when idle
        const LEMOSCCTRL_SUSPEND = 2 << 4;
        const LEMOSCCTRL_MASK = 3 << 4;
        /// Low-energy mode PHY control
        const LEMPHYCTRL = 1 << 7;
        /// Low-energy mode on NAK
        const LEMNAKEN = 1 << 8;
        /// Low-energy mode on bus idle
        const LEMIDLEEN = 1 << 9;
        /// Voltage regulator output sense enable
        const VREGOSEN = 1 << 17;
    }
}

bitflags! {
    /// Wrapper status register (STATUS)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WrapperStatus: u32 {
        /// Regulator output (VBUS) present
        const VREGOS = 1 << 0;
        /// Core is in low-energy mode
        const LEMACTIVE = 1 << 1;
    }
}

bitflags! {
    /// Wrapper interrupt flags (IF/IFS/IFC/IEN)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WrapperIf: u32 {
        /// VBUS went high
        const VREGOSH = 1 << 0;
        /// VBUS went low
        const VREGOSL = 1 << 1;
    }
}

bitflags! {
    /// Pin routing (ROUTE)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Route: u32 {
        const PHYPEN = 1 << 0;
        const VBUSENPEN = 1 << 1;
        const DMPUPEN = 1 << 2;
    }
}

bitflags! {
    /// AHB configuration (GAHBCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GahbCfg: u32 {
        /// Global interrupt mask
        const GLBLINTRMSK = 1 << 0;
        /// AHB burst length INCR
        const HBSTLEN_INCR = 1 << 1;
        const HBSTLEN_INCR4 = 3 << 1;
        const HBSTLEN_MASK = 0xF << 1;
        /// Buffer DMA enable
        const DMAEN = 1 << 5;
        const NPTXFEMPLVL = 1 << 7;
        const PTXFEMPLVL = 1 << 8;
    }
}

bitflags! {
    /// USB configuration (GUSBCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GusbCfg: u32 {
        const TOUTCAL_MASK = 0x7;
        const USBTRDTIM_MASK = 0xF << 10;
        /// Turnaround time for a 48 MHz core clock
        const USBTRDTIM_FS = 5 << 10;
        const FORCEHSTMODE = 1 << 29;
        const FORCEDEVMODE = 1 << 30;
        const CORRUPTTXPKT = 1 << 31;
    }
}

bitflags! {
    /// Reset control (GRSTCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrstCtl: u32 {
        /// Core soft reset
        const CSFTRST = 1 << 0;
        const FRMCNTRRST = 1 << 2;
        /// RX FIFO flush
        const RXFFLSH = 1 << 4;
        /// TX FIFO flush
        const TXFFLSH = 1 << 5;
        const TXFNUM_MASK = 0x1F << 6;
        /// TXFNUM value selecting every TX FIFO
        const TXFNUM_ALL = 0x10 << 6;
        const DMAREQ = 1 << 30;
        /// AHB master idle
        const AHBIDLE = 1 << 31;
    }
}

impl GrstCtl {
    /// TXFNUM field selecting a single TX FIFO
    #[inline(always)]
    pub const fn txfnum(fifo: u32) -> u32 {
        (fifo & 0x1F) << 6
    }
}

bitflags! {
    /// Core interrupt status and mask (GINTSTS/GINTMSK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gint: u32 {
        const CURMOD = 1 << 0;
        const MODEMIS = 1 << 1;
        const OTGINT = 1 << 2;
        /// Start of frame
        const SOF = 1 << 3;
        const RXFLVL = 1 << 4;
        const NPTXFEMP = 1 << 5;
        /// Global IN NAK effective
        const GINNAKEFF = 1 << 6;
        /// Global OUT NAK effective
        const GOUTNAKEFF = 1 << 7;
        const ERLYSUSP = 1 << 10;
        /// Suspend detected
        const USBSUSP = 1 << 11;
        /// Bus reset
        const USBRST = 1 << 12;
        /// Enumeration done
        const ENUMDONE = 1 << 13;
        const ISOOUTDROP = 1 << 14;
        const EOPF = 1 << 15;
        /// IN endpoint interrupt
        const IEPINT = 1 << 18;
        /// OUT endpoint interrupt
        const OEPINT = 1 << 19;
        const INCOMPISOIN = 1 << 20;
        const INCOMPLP = 1 << 21;
        const FETSUSP = 1 << 22;
        /// Reset detected while suspended
        const RESETDET = 1 << 23;
        /// Host port interrupt
        const PRTINT = 1 << 24;
        /// Host channel interrupt
        const HCHINT = 1 << 25;
        const PTXFEMP = 1 << 26;
        const CONIDSTSCHNG = 1 << 28;
        /// Device disconnected (host mode)
        const DISCONNINT = 1 << 29;
        const SESSREQINT = 1 << 30;
        /// Resume/remote wakeup detected
        const WKUPINT = 1 << 31;
    }
}

bitflags! {
    /// Device control (DCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dctl: u32 {
        /// Remote wakeup signalling
        const RMTWKUPSIG = 1 << 0;
        /// Soft disconnect
        const SFTDISCON = 1 << 1;
        const GNPINNAKSTS = 1 << 2;
        const GOUTNAKSTS = 1 << 3;
        const SGNPINNAK = 1 << 7;
        const CGNPINNAK = 1 << 8;
        /// Set global OUT NAK
        const SGOUTNAK = 1 << 9;
        /// Clear global OUT NAK
        const CGOUTNAK = 1 << 10;
        const PWRONPRGDONE = 1 << 11;
        const IGNRFRMNUM = 1 << 15;
    }
}

/// DCFG fields
pub mod dcfg {
    /// Full speed on the internal PHY
    pub const DEVSPD_FS: u32 = 3;
    pub const DEVSPD_MASK: u32 = 0x3;
    /// Non-zero-length status OUT handshake
    pub const NZSTSOUTHSHK: u32 = 1 << 2;
    pub const DAD_SHIFT: u32 = 4;
    pub const DAD_MASK: u32 = 0x7F << DAD_SHIFT;
    /// Periodic frame interval 80%
    pub const PERFRINT_80: u32 = 0 << 11;
}

/// DSTS fields
pub mod dsts {
    pub const SUSPSTS: u32 = 1 << 0;
    pub const ENUMSPD_SHIFT: u32 = 1;
    pub const ENUMSPD_MASK: u32 = 0x3 << ENUMSPD_SHIFT;
    pub const SOFFN_SHIFT: u32 = 8;
    pub const SOFFN_MASK: u32 = 0x3FFF << SOFFN_SHIFT;
}

bitflags! {
    /// Device endpoint control (DIEPCTLn/DOEPCTLn)
    ///
    /// CNAK, SNAK, SETD0PID, SETD1PID and EPDIS are one-shot: they act on
    /// write and always read back as zero. DPID and NAKSTS are read-only
    /// reflections of the state those bits manipulate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DepCtl: u32 {
        const MPS_MASK = 0x7FF;
        /// Endpoint is active in the current configuration
        const USBACTEP = 1 << 15;
        /// Data PID (bulk/interrupt) or even/odd frame (isochronous)
        const DPID = 1 << 16;
        const NAKSTS = 1 << 17;
        const EPTYPE_MASK = 0x3 << 18;
        const SNP = 1 << 20;
        const STALL = 1 << 21;
        const TXFNUM_MASK = 0xF << 22;
        const CNAK = 1 << 26;
        const SNAK = 1 << 27;
        /// Set DATA0 PID / even frame
        const SETD0PID = 1 << 28;
        /// Set DATA1 PID / odd frame
        const SETD1PID = 1 << 29;
        const EPDIS = 1 << 30;
        const EPENA = 1 << 31;
    }
}

impl DepCtl {
    /// Bits that act on write and read back as zero
    pub const ONE_SHOT: Self = Self::CNAK
        .union(Self::SNAK)
        .union(Self::SETD0PID)
        .union(Self::SETD1PID)
        .union(Self::EPDIS);

    /// EPTYPE field
    #[inline(always)]
    pub const fn eptype(ty: u32) -> u32 {
        (ty & 0x3) << 18
    }

    /// TXFNUM field
    #[inline(always)]
    pub const fn txfnum(fifo: u32) -> u32 {
        (fifo & 0xF) << 22
    }
}

/// EP0 MPS codes in DxEPCTL0
pub mod ep0_mps {
    pub const MPS_64: u32 = 0;
    pub const MPS_32: u32 = 1;
    pub const MPS_16: u32 = 2;
    pub const MPS_8: u32 = 3;
}

bitflags! {
    /// Device IN endpoint interrupt (DIEPINTn, DIEPMSK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiepInt: u32 {
        const XFERCOMPL = 1 << 0;
        const EPDISBLD = 1 << 1;
        const AHBERR = 1 << 2;
        const TIMEOUT = 1 << 3;
        const INTKNTXFEMP = 1 << 4;
        const INEPNAKEFF = 1 << 6;
        const TXFEMP = 1 << 7;
        const BBLEERR = 1 << 12;
        const NAKINTRPT = 1 << 13;
    }
}

bitflags! {
    /// Device OUT endpoint interrupt (DOEPINTn, DOEPMSK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoepInt: u32 {
        const XFERCOMPL = 1 << 0;
        const EPDISBLD = 1 << 1;
        const AHBERR = 1 << 2;
        /// SETUP phase done
        const SETUP = 1 << 3;
        const OUTTKNEPDIS = 1 << 4;
        const STSPHSERCVD = 1 << 5;
        const BACK2BACKSETUP = 1 << 6;
        const BBLEERR = 1 << 12;
        const NAKINTRPT = 1 << 13;
        /// SETUP packet received
        const STUPPKTRCVD = 1 << 15;
    }
}

/// Endpoint transfer size fields (DIEPTSIZn/DOEPTSIZn)
pub mod deptsiz {
    pub const XFERSIZE_MASK: u32 = 0x7_FFFF;
    pub const PKTCNT_SHIFT: u32 = 19;
    pub const PKTCNT_MASK: u32 = 0x3FF << PKTCNT_SHIFT;
    /// Multi count (isochronous IN)
    pub const MC_SHIFT: u32 = 29;
    /// EP0 OUT SETUP packet count
    pub const SUPCNT_SHIFT: u32 = 29;
    pub const SUPCNT_MASK: u32 = 0x3 << SUPCNT_SHIFT;
    pub const EP0_XFERSIZE_MASK: u32 = 0x7F;
    pub const EP0_IN_PKTCNT_MASK: u32 = 0x3 << PKTCNT_SHIFT;
    pub const EP0_OUT_PKTCNT_MASK: u32 = 0x1 << PKTCNT_SHIFT;
}

bitflags! {
    /// Power and clock gating (PCGCCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pcgcctl: u32 {
        const STOPPCLK = 1 << 0;
        const GATEHCLK = 1 << 1;
        const PWRCLMP = 1 << 2;
        const RSTPDWNMODULE = 1 << 3;
        const PHYSLEEP = 1 << 6;
    }
}

bitflags! {
    /// Host port control and status (HPRT)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hprt: u32 {
        const PRTCONNSTS = 1 << 0;
        /// Connect detected (W1C)
        const PRTCONNDET = 1 << 1;
        /// Port enabled (W1C: writing one disables the port)
        const PRTENA = 1 << 2;
        /// Port enable changed (W1C)
        const PRTENCHNG = 1 << 3;
        const PRTOVRCURRACT = 1 << 4;
        /// Over-current changed (W1C)
        const PRTOVRCURRCHNG = 1 << 5;
        const PRTRES = 1 << 6;
        const PRTSUSP = 1 << 7;
        const PRTRST = 1 << 8;
        const PRTLNSTS_MASK = 0x3 << 10;
        const PRTPWR = 1 << 12;
        const PRTTSTCTL_MASK = 0xF << 13;
        const PRTSPD_MASK = 0x3 << 17;
    }
}

impl Hprt {
    /// Bits cleared by writing one; must be masked out of read-modify-write
    pub const W1C: Self = Self::PRTCONNDET
        .union(Self::PRTENA)
        .union(Self::PRTENCHNG)
        .union(Self::PRTOVRCURRCHNG);

    pub const PRTSPD_SHIFT: u32 = 17;
    pub const SPEED_FULL: u32 = 1;
    pub const SPEED_LOW: u32 = 2;
}

/// HCFG fields
pub mod hcfg {
    /// PHY clock 48 MHz (full-speed device)
    pub const FSLSPCLKSEL_48MHZ: u32 = 1;
    /// PHY clock 6 MHz (low-speed device)
    pub const FSLSPCLKSEL_6MHZ: u32 = 2;
    pub const FSLSPCLKSEL_MASK: u32 = 0x3;
    pub const FSLSSUPP: u32 = 1 << 2;
}

/// HFIR frame interval values
pub mod hfir {
    /// 1 ms at 48 MHz
    pub const FRINT_FS: u32 = 48_000;
    /// 1 ms at 6 MHz
    pub const FRINT_LS: u32 = 6_000;
}

pub const HFNUM_FRNUM_MASK: u32 = 0xFFFF;

bitflags! {
    /// Host channel characteristics (HCCHARn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcChar: u32 {
        const MPS_MASK = 0x7FF;
        const EPNUM_MASK = 0xF << 11;
        /// IN direction
        const EPDIR = 1 << 15;
        const LSPDDEV = 1 << 17;
        const EPTYPE_MASK = 0x3 << 18;
        const MC_MASK = 0x3 << 20;
        const DEVADDR_MASK = 0x7F << 22;
        /// Transact in odd frame
        const ODDFRM = 1 << 29;
        const CHDIS = 1 << 30;
        const CHENA = 1 << 31;
    }
}

impl HcChar {
    #[inline(always)]
    pub const fn epnum(ep: u32) -> u32 {
        (ep & 0xF) << 11
    }

    #[inline(always)]
    pub const fn eptype(ty: u32) -> u32 {
        (ty & 0x3) << 18
    }

    #[inline(always)]
    pub const fn mc(count: u32) -> u32 {
        (count & 0x3) << 20
    }

    #[inline(always)]
    pub const fn devaddr(addr: u32) -> u32 {
        (addr & 0x7F) << 22
    }
}

bitflags! {
    /// Host channel interrupt (HCINTn, HCINTMSKn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcInt: u32 {
        const XFERCOMPL = 1 << 0;
        const CHHLTD = 1 << 1;
        const AHBERR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const XACTERR = 1 << 7;
        const BBLERR = 1 << 8;
        const FRMOVRUN = 1 << 9;
        const DATATGLERR = 1 << 10;
    }
}

/// Host channel transfer size fields (HCTSIZn)
pub mod hctsiz {
    pub const XFERSIZE_MASK: u32 = 0x7_FFFF;
    pub const PKTCNT_SHIFT: u32 = 19;
    pub const PKTCNT_MASK: u32 = 0x3FF << PKTCNT_SHIFT;
    pub const PID_SHIFT: u32 = 29;
    pub const PID_MASK: u32 = 0x3 << PID_SHIFT;
    pub const PID_DATA0: u32 = 0;
    pub const PID_DATA2: u32 = 1;
    pub const PID_DATA1: u32 = 2;
    pub const PID_SETUP: u32 = 3;
}

/// Hardware transfer type encoding (EPTYPE fields)
pub mod eptype {
    pub const CONTROL: u32 = 0;
    pub const ISOCHRONOUS: u32 = 1;
    pub const BULK: u32 = 2;
    pub const INTERRUPT: u32 = 3;
}
