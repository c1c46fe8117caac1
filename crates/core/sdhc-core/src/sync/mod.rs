//! Synchronization primitives.
//!
//! - [`SpinLock`] guards request state that the caller reads while the
//!   dispatcher writes it.
//! - [`DispatchCell`] hands out the single-owner token that lets exactly one of
//!   the interrupt path or the polling path run the dispatcher at a time.

mod dispatch;
mod spinlock;

pub use dispatch::{DispatchCell, DispatchGuard, DispatchSource};
pub use spinlock::{SpinLock, SpinLockGuard};
