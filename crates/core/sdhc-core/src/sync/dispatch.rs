//! Single-owner token for interrupt dispatch.
//!
//! The controller dispatcher may be driven by the hardware interrupt callback
//! or, when interrupts are disabled, by a polling loop that calls the same
//! code. Only one of the two may run it at any instant. [`DispatchCell`]
//! makes that explicit: entering returns a guard that is the token, and a
//! second entry is refused rather than recursing into half-updated state.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

const NO_OWNER: u8 = 0;

/// Which call path holds the dispatch token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchSource {
    /// Hardware interrupt callback.
    Interrupt = 1,
    /// Busy-wait loop standing in for the interrupt.
    Polling = 2,
}

impl DispatchSource {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Interrupt),
            2 => Some(Self::Polling),
            _ => None,
        }
    }
}

/// Cell whose contents are reachable only through a [`DispatchGuard`].
pub struct DispatchCell<T> {
    owner: AtomicU8,
    data: UnsafeCell<T>,
}

// SAFETY: `owner` admits at most one guard at a time, so `T` is never
// aliased mutably.
unsafe impl<T: Send> Send for DispatchCell<T> {}
unsafe impl<T: Send> Sync for DispatchCell<T> {}

impl<T> DispatchCell<T> {
    /// Wraps `value` with no current owner.
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU8::new(NO_OWNER),
            data: UnsafeCell::new(value),
        }
    }

    /// Takes the dispatch token for `source`.
    ///
    /// Returns `None` if either path already holds it. The caller is expected
    /// to back off: an interrupt that finds the polling path inside simply
    /// returns, since the poller will observe the same status bits.
    pub fn enter(&self, source: DispatchSource) -> Option<DispatchGuard<'_, T>> {
        self.owner
            .compare_exchange(NO_OWNER, source as u8, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| DispatchGuard { cell: self, source })
    }

    /// Returns the path currently holding the token, if any.
    #[must_use]
    pub fn owner(&self) -> Option<DispatchSource> {
        DispatchSource::from_raw(self.owner.load(Ordering::Relaxed))
    }

    /// Direct access when `&mut self` already proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the cell and returns the value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// The dispatch token. Releases ownership on drop.
pub struct DispatchGuard<'a, T> {
    cell: &'a DispatchCell<T>,
    source: DispatchSource,
}

impl<T> DispatchGuard<'_, T> {
    /// Returns the path that took this token.
    #[must_use]
    pub const fn source(&self) -> DispatchSource {
        self.source
    }
}

impl<T> Deref for DispatchGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard is the single owner of the cell.
        unsafe { &*self.cell.data.get() }
    }
}

impl<T> DerefMut for DispatchGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard is the single owner of the cell.
        unsafe { &mut *self.cell.data.get() }
    }
}

impl<T> Drop for DispatchGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.owner.store(NO_OWNER, Ordering::Release);
    }
}
