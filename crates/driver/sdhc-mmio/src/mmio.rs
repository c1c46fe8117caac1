//! Volatile MMIO backend.

use core::ptr;

use crate::RegisterIo;

/// A mapped controller register window accessed with volatile loads and
/// stores.
pub struct MmioRegion {
    base: *mut u8,
    len: usize,
    delay: fn(u32),
}

// SAFETY: The region is device memory; every access is a single volatile
// 32-bit load or store, which the controller serializes.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wraps a mapped register window.
    ///
    /// `delay` is the platform's microsecond busy-wait.
    ///
    /// # Safety
    ///
    /// `base` must point to a valid, uncached mapping of at least `len` bytes
    /// of controller registers that stays mapped for the lifetime of the
    /// region.
    pub const unsafe fn new(base: *mut u8, len: usize, delay: fn(u32)) -> Self {
        Self { base, len, delay }
    }

    /// Returns the window size in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-sized window.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reg_ptr(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(offset + 4 <= self.len, "register offset {offset:#x} outside MMIO window");
        // SAFETY: Bounds checked above; `new` guarantees the mapping.
        unsafe { self.base.add(offset).cast::<u32>() }
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: `reg_ptr` returns an in-bounds, aligned register address.
        unsafe { ptr::read_volatile(self.reg_ptr(offset)) }
    }

    fn write32(&self, offset: u32, value: u32) {
        // SAFETY: `reg_ptr` returns an in-bounds, aligned register address.
        unsafe { ptr::write_volatile(self.reg_ptr(offset), value) }
    }

    fn delay_us(&self, us: u32) {
        (self.delay)(us);
    }
}
