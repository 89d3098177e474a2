//! Controller power management
//!
//! Suspend leaves the core registers intact. Powering the core down (the
//! EM2 path on EFM32) loses them, so they are captured in a
//! [`RegisterSnapshot`] first and written back on the way out. Endpoint
//! control registers cannot be written back verbatim: data toggle and NAK
//! state read back through status bits and are set through one-shot bits,
//! so both are reconstructed on restore.

use crate::config::HardwareLimits;
use crate::otg::{self, Ctrl, DepCtl, Dctl, Gint, Pcgcctl, RegisterBlock};

/// Endpoint slots captured per direction (EP0 plus 15)
pub const MAX_HW_ENDPOINTS: usize = 16;

/// Controller power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Running normally
    Active,
    /// Bus suspended, registers intact
    Suspended,
    /// Core clock stopped and power removed, registers saved
    PoweredDown,
}

/// Board collaborator for clock switching and sleep
///
/// All methods default to no-ops.
pub trait PowerHooks {
    /// Run the USB core from the 32 kHz retention clock
    fn select_retention_clock(&mut self) {}

    /// Run the USB core from its normal 48 MHz clock
    fn select_core_clock(&mut self) {}

    /// Ask the system to enter deep sleep once the handler returns
    fn request_deep_sleep(&mut self) {}

    /// Busy-wait `ms` milliseconds
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Power hooks for boards that never power the core down
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerHooks;

impl PowerHooks for NoPowerHooks {}

/// Saved endpoint registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct EndpointRegs {
    pub ctl: u32,
    pub tsiz: u32,
    pub dma: u32,
}

/// Registers lost when the core is powered down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct RegisterSnapshot {
    pub gahbcfg: u32,
    pub gusbcfg: u32,
    pub grxfsiz: u32,
    pub gnptxfsiz: u32,
    pub gintmsk: u32,
    pub dcfg: u32,
    pub dctl: u32,
    pub diepmsk: u32,
    pub doepmsk: u32,
    pub daintmsk: u32,
    /// DIEPTXF1..DIEPTXFn
    pub dieptxf: [u32; MAX_HW_ENDPOINTS - 1],
    pub in_eps: [EndpointRegs; MAX_HW_ENDPOINTS],
    pub out_eps: [EndpointRegs; MAX_HW_ENDPOINTS],
    tx_fifos: u8,
    in_count: u8,
    out_count: u8,
}

/// DCTL bits that act on write only
const DCTL_WRITE_ONLY: u32 = Dctl::SGNPINNAK.bits()
    | Dctl::CGNPINNAK.bits()
    | Dctl::SGOUTNAK.bits()
    | Dctl::CGOUTNAK.bits()
    | Dctl::RMTWKUPSIG.bits();

impl RegisterSnapshot {
    /// Capture the registers present on hardware with `limits`
    pub fn save<R: RegisterBlock>(regs: &R, limits: &HardwareLimits) -> Self {
        let tx_fifos = (limits.tx_fifos as usize).min(MAX_HW_ENDPOINTS - 1);
        let in_count = (limits.in_endpoints as usize + 1).min(MAX_HW_ENDPOINTS);
        let out_count = (limits.out_endpoints as usize + 1).min(MAX_HW_ENDPOINTS);

        let mut dieptxf = [0; MAX_HW_ENDPOINTS - 1];
        for (i, slot) in dieptxf.iter_mut().enumerate().take(tx_fifos) {
            *slot = regs.read(otg::dieptxf(i + 1));
        }

        let mut in_eps = [EndpointRegs::default(); MAX_HW_ENDPOINTS];
        for (ep, slot) in in_eps.iter_mut().enumerate().take(in_count) {
            *slot = EndpointRegs {
                ctl: regs.read(otg::diepctl(ep)),
                tsiz: regs.read(otg::dieptsiz(ep)),
                dma: regs.read(otg::diepdma(ep)),
            };
        }

        let mut out_eps = [EndpointRegs::default(); MAX_HW_ENDPOINTS];
        for (ep, slot) in out_eps.iter_mut().enumerate().take(out_count) {
            *slot = EndpointRegs {
                ctl: regs.read(otg::doepctl(ep)),
                tsiz: regs.read(otg::doeptsiz(ep)),
                dma: regs.read(otg::doepdma(ep)),
            };
        }

        Self {
            gahbcfg: regs.read(otg::GAHBCFG),
            gusbcfg: regs.read(otg::GUSBCFG),
            grxfsiz: regs.read(otg::GRXFSIZ),
            gnptxfsiz: regs.read(otg::GNPTXFSIZ),
            gintmsk: regs.read(otg::GINTMSK),
            dcfg: regs.read(otg::DCFG),
            dctl: regs.read(otg::DCTL),
            diepmsk: regs.read(otg::DIEPMSK),
            doepmsk: regs.read(otg::DOEPMSK),
            daintmsk: regs.read(otg::DAINTMSK),
            dieptxf,
            in_eps,
            out_eps,
            tx_fifos: tx_fifos as u8,
            in_count: in_count as u8,
            out_count: out_count as u8,
        }
    }

    /// Write the snapshot back
    ///
    /// The interrupt mask is left untouched; the caller restores it last so
    /// that nothing fires against a half-restored core.
    pub fn restore<R: RegisterBlock>(&self, regs: &R) {
        regs.write(otg::GUSBCFG, self.gusbcfg);
        regs.write(otg::GAHBCFG, self.gahbcfg);
        regs.write(otg::GRXFSIZ, self.grxfsiz);
        regs.write(otg::GNPTXFSIZ, self.gnptxfsiz);
        for (i, value) in self.dieptxf.iter().enumerate().take(self.tx_fifos as usize) {
            regs.write(otg::dieptxf(i + 1), *value);
        }

        regs.write(otg::DCFG, self.dcfg);
        regs.write(otg::DCTL, self.dctl & !DCTL_WRITE_ONLY);
        regs.write(otg::DIEPMSK, self.diepmsk);
        regs.write(otg::DOEPMSK, self.doepmsk);
        regs.write(otg::DAINTMSK, self.daintmsk);

        for (ep, saved) in self.in_eps.iter().enumerate().take(self.in_count as usize) {
            regs.write(otg::dieptsiz(ep), saved.tsiz);
            regs.write(otg::diepdma(ep), saved.dma);
            regs.write(otg::diepctl(ep), reconstruct_ctl(saved.ctl, ep == 0));
        }
        for (ep, saved) in self.out_eps.iter().enumerate().take(self.out_count as usize) {
            regs.write(otg::doeptsiz(ep), saved.tsiz);
            regs.write(otg::doepdma(ep), saved.dma);
            regs.write(otg::doepctl(ep), reconstruct_ctl(saved.ctl, ep == 0));
        }
    }
}

/// Turn a saved DxEPCTL value into the value to write back
///
/// DPID and NAKSTS are read-only mirrors; they are re-established through
/// SETD0PID/SETD1PID and CNAK/SNAK. EP0 has no data toggle to restore.
pub fn reconstruct_ctl(saved: u32, is_ep0: bool) -> u32 {
    let saved = DepCtl::from_bits_retain(saved);
    let mut value = saved.difference(DepCtl::ONE_SHOT | DepCtl::DPID | DepCtl::NAKSTS);

    if !is_ep0 && saved.contains(DepCtl::USBACTEP) {
        if saved.contains(DepCtl::DPID) {
            value |= DepCtl::SETD1PID;
        } else {
            value |= DepCtl::SETD0PID;
        }
    }

    if saved.contains(DepCtl::NAKSTS) {
        value |= DepCtl::SNAK;
    } else {
        value |= DepCtl::CNAK;
    }

    value.bits()
}

/// Interrupts that may wake a powered-down core
pub const WAKE_INTERRUPTS: Gint = Gint::WKUPINT.union(Gint::RESETDET);

/// Power state plus the snapshot taken on power-down
#[derive(Debug)]
pub struct PowerController {
    state: PowerState,
    snapshot: Option<RegisterSnapshot>,
}

impl PowerController {
    /// Controller in the active state
    pub const fn new() -> Self {
        Self { state: PowerState::Active, snapshot: None }
    }

    /// Current power state
    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Bus suspended with registers intact
    pub fn suspend(&mut self) {
        if self.state == PowerState::Active {
            self.state = PowerState::Suspended;
        }
    }

    /// Bus resumed without a power-down in between
    pub fn resume(&mut self) {
        if self.state == PowerState::Suspended {
            self.state = PowerState::Active;
        }
    }

    /// Save registers, stop the core and arm only the wake interrupts
    ///
    /// A second call while already powered down is ignored.
    pub fn enter_power_down<R, P>(&mut self, regs: &R, limits: &HardwareLimits, hooks: &mut P, deep_sleep: bool)
    where
        R: RegisterBlock,
        P: PowerHooks + ?Sized,
    {
        if self.state == PowerState::PoweredDown {
            return;
        }

        self.snapshot = Some(RegisterSnapshot::save(regs, limits));

        // Only wake events may reach the handler while the core is down
        regs.write(otg::GINTMSK, WAKE_INTERRUPTS.bits());
        regs.modify(otg::CTRL, |v| {
            (v & !Ctrl::LEMOSCCTRL_MASK.bits()) | Ctrl::LEMOSCCTRL_GATE.bits() | Ctrl::LEMIDLEEN.bits()
        });
        regs.set_bits(otg::PCGCCTL, Pcgcctl::STOPPCLK.bits());
        regs.set_bits(otg::PCGCCTL, Pcgcctl::PWRCLMP.bits());
        regs.set_bits(otg::PCGCCTL, Pcgcctl::RSTPDWNMODULE.bits());
        hooks.select_retention_clock();

        self.state = PowerState::PoweredDown;

        #[cfg(feature = "defmt")]
        defmt::info!("USB core powered down");

        if deep_sleep {
            hooks.request_deep_sleep();
        }
    }

    /// Restart the core and restore the saved registers
    ///
    /// Returns `false` (and does nothing) unless the core was powered down,
    /// so that a reset-detect and a wakeup raised for the same event only
    /// restore once.
    pub fn exit_power_down<R, P>(&mut self, regs: &R, hooks: &mut P) -> bool
    where
        R: RegisterBlock,
        P: PowerHooks + ?Sized,
    {
        if self.state != PowerState::PoweredDown {
            return false;
        }

        hooks.select_core_clock();
        regs.clear_bits(otg::PCGCCTL, Pcgcctl::RSTPDWNMODULE.bits());
        regs.clear_bits(otg::PCGCCTL, Pcgcctl::PWRCLMP.bits());
        regs.clear_bits(otg::PCGCCTL, Pcgcctl::STOPPCLK.bits());
        regs.modify(otg::CTRL, |v| v & !(Ctrl::LEMOSCCTRL_MASK.bits() | Ctrl::LEMIDLEEN.bits()));

        if let Some(snapshot) = self.snapshot.take() {
            snapshot.restore(regs);
            regs.write(otg::GINTMSK, snapshot.gintmsk);
        }

        self.state = PowerState::Active;

        #[cfg(feature = "defmt")]
        defmt::info!("USB core powered up");

        true
    }

    /// Forget any saved state (controller re-initialised)
    pub fn reset(&mut self) {
        self.state = PowerState::Active;
        self.snapshot = None;
    }
}

impl Default for PowerController {
    fn default() -> Self {
        Self::new()
    }
}
