//! Scoped exclusion against the USB interrupt
//!
//! The controller has exactly one interrupt line. Call-context API functions
//! keep the interrupt handler out by masking that line for the duration of a
//! register sequence or state change. [`CriticalSection`] ties the unmask to
//! scope exit so early returns cannot leave the line masked.

/// Mask control for the USB interrupt line
pub trait InterruptGate {
    /// Mask the line, returning whether it was unmasked before
    fn mask(&self) -> bool;

    /// Unmask the line
    fn unmask(&self);
}

impl<T: InterruptGate + ?Sized> InterruptGate for &T {
    fn mask(&self) -> bool {
        (**self).mask()
    }

    fn unmask(&self) {
        (**self).unmask()
    }
}

/// RAII guard holding the USB interrupt line masked
///
/// Nesting is safe: an inner guard sees the line already masked and leaves
/// it masked on drop.
#[must_use = "the interrupt is unmasked again as soon as the guard is dropped"]
pub struct CriticalSection<'a, G: InterruptGate + ?Sized> {
    gate: &'a G,
    was_unmasked: bool,
}

impl<'a, G: InterruptGate + ?Sized> CriticalSection<'a, G> {
    /// Mask the line until the returned guard is dropped
    #[inline]
    pub fn enter(gate: &'a G) -> Self {
        let was_unmasked = gate.mask();
        Self { gate, was_unmasked }
    }
}

impl<G: InterruptGate + ?Sized> Drop for CriticalSection<'_, G> {
    #[inline]
    fn drop(&mut self) {
        if self.was_unmasked {
            self.gate.unmask();
        }
    }
}

/// Gate for contexts that are already exclusive (interrupt handler, tests
/// without a simulated interrupt line)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGate;

impl InterruptGate for NoGate {
    fn mask(&self) -> bool {
        false
    }

    fn unmask(&self) {}
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use nvic::NvicGate;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod nvic {
    use super::InterruptGate;
    use cortex_m::interrupt::InterruptNumber;
    use cortex_m::peripheral::NVIC;

    #[derive(Debug, Clone, Copy)]
    struct Irq(u16);

    // SAFETY: the number is supplied by the board crate and names a valid
    // device interrupt
    unsafe impl InterruptNumber for Irq {
        fn number(self) -> u16 {
            self.0
        }
    }

    /// NVIC-backed gate for the USB interrupt
    #[derive(Debug, Clone, Copy)]
    pub struct NvicGate {
        irq: Irq,
    }

    impl NvicGate {
        /// USB interrupt number on EFM32 Giant/Leopard/Wonder Gecko
        pub const EFM32GG_USB_IRQ: u16 = 5;

        /// Gate for interrupt `irq`
        pub const fn new(irq: u16) -> Self {
            Self { irq: Irq(irq) }
        }
    }

    impl InterruptGate for NvicGate {
        fn mask(&self) -> bool {
            let was_unmasked = NVIC::is_enabled(self.irq);
            NVIC::mask(self.irq);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            was_unmasked
        }

        fn unmask(&self) {
            // SAFETY: the driver handler is the only user of this line and
            // every shared access goes through a CriticalSection
            unsafe { NVIC::unmask(self.irq) };
        }
    }
}
