//! Register I/O capability and typed register banks.
//!
//! The driver core never touches memory-mapped registers directly. It talks to
//! a [`RegisterIo`] implementation supplied by the platform: the volatile
//! [`MmioRegion`] on real hardware, or a simulated controller in tests.
//!
//! The [`register_block!`] macro generates typed accessors over an
//! [`IoHandle`]:
//!
//! ```ignore
//! use sdhc_mmio::register_block;
//!
//! register_block! {
//!     /// Slot register set.
//!     pub SlotRegs {
//!         /// Present state.
//!         [0x24; ro] present_state => PresentState,
//!         /// Normal and error interrupt status.
//!         [0x30; rw1c] int_status => IntStatus,
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;
extern crate self as sdhc_mmio;

use alloc::sync::Arc;

pub use sdhc_mmio_macros::register_block;

mod mmio;
mod poll;

pub use mmio::MmioRegion;
pub use poll::{PollBudget, poll_until, wait_for};

/// Access to a bank of 32-bit controller registers plus the timing
/// primitives needed for hardware handshakes.
pub trait RegisterIo: Send + Sync {
    /// Reads the register at byte `offset`.
    fn read32(&self, offset: u32) -> u32;

    /// Writes `value` to the register at byte `offset`.
    fn write32(&self, offset: u32, value: u32);

    /// Orders preceding memory writes (descriptors, buffers) before
    /// subsequent register writes.
    fn barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Busy-waits for roughly `us` microseconds.
    fn delay_us(&self, us: u32);
}

/// Shared handle to the platform's register I/O backend.
pub type IoHandle = Arc<dyn RegisterIo>;
