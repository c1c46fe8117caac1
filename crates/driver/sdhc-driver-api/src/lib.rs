//! Driver API types and traits for the SD host controller core.
//!
//! Defines the error taxonomy shared by every layer ([`SdError`]) and the
//! capabilities the core consumes from the platform and the card protocol
//! layer: DMA preparation, descriptor memory, phase tuning and card
//! interrupt hooks.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod capability;
pub mod device;
pub mod error;

pub use error::SdError;
