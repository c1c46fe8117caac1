//! Core support for the SD host controller driver stack.
//!
//! Holds the pieces every other crate in the workspace leans on: the leveled
//! log facade ([`log`]) and the small synchronization primitives ([`sync`])
//! that guard request state and the interrupt dispatcher.
//!
//! Everything here is `no_std` and host-testable.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod log;
pub mod sync;
