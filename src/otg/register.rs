//! Register access for the USB peripheral
//!
//! The protocol engine never touches memory directly: every register access
//! goes through [`RegisterBlock`], so the same state machines run against the
//! real peripheral ([`Mmio`]) or a simulated register file in tests.

use core::ptr::{read_volatile, write_volatile};

/// Word-addressed access to the USB peripheral
///
/// Offsets are byte offsets from the peripheral base (see [`crate::otg`]).
/// Implementations take `&self` because register access has no Rust-level
/// aliasing meaning; exclusion is provided by [`crate::critical`].
pub trait RegisterBlock {
    /// Read a 32-bit register
    fn read(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write
    #[inline(always)]
    fn modify<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let current = self.read(offset);
        self.write(offset, f(current));
    }

    /// Set bits in a register
    #[inline(always)]
    fn set_bits(&self, offset: usize, mask: u32) {
        self.modify(offset, |v| v | mask);
    }

    /// Clear bits in a register
    #[inline(always)]
    fn clear_bits(&self, offset: usize, mask: u32) {
        self.modify(offset, |v| v & !mask);
    }

    /// Write-1-to-clear operation for status registers
    #[inline(always)]
    fn write_1_to_clear(&self, offset: usize, mask: u32) {
        self.write(offset, mask);
    }

    /// Program a DMA address register
    #[inline(always)]
    fn write_dma_address(&self, offset: usize, address: *const u8) {
        self.write(offset, address as usize as u32);
    }
}

impl<T: RegisterBlock + ?Sized> RegisterBlock for &T {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }

    #[inline(always)]
    fn write_dma_address(&self, offset: usize, address: *const u8) {
        (**self).write_dma_address(offset, address)
    }
}

/// Memory-mapped USB peripheral
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Base address of the USB peripheral on EFM32 Giant/Leopard/Wonder Gecko
    pub const EFM32_USB_BASE: usize = 0x400C_4000;

    /// Wrap the peripheral at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the address of the USB peripheral and the caller must
    /// ensure this is the only owner of it.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn ptr(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }
}

#[inline(always)]
fn barrier() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();
}

impl RegisterBlock for Mmio {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset & 0x3 == 0, "Unaligned register offset: {:#x}", offset);
        barrier();
        // SAFETY: offset lies inside the peripheral window owned by self
        let value = unsafe { read_volatile(self.ptr(offset)) };
        barrier();
        value
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset & 0x3 == 0, "Unaligned register offset: {:#x}", offset);
        barrier();
        // SAFETY: offset lies inside the peripheral window owned by self
        unsafe { write_volatile(self.ptr(offset), value) };
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::dsb();
    }
}
