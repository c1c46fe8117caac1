//! SD/SDIO/eMMC host controller core.
//!
//! Turns requests into controller register writes and drives them to a
//! terminal state from interrupt (or polled) status:
//!
//! - [`engine`]: command issue, completion tracking, PIO buffer pump, abort
//! - [`recovery`]: error classification, line reset, auto-CMD12 recovery
//! - [`tuning`]: hardware and software sampling-point tuning
//! - [`cq`]: the eMMC hardware command queue
//! - [`host`]: the [`Host`] that owns the slots, and the dispatcher
//!
//! Platform services (register access, DMA, phase programming) are injected
//! through the traits in `sdhc_driver_api` and `sdhc_mmio`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod cq;
pub mod engine;
pub mod host;
pub mod recovery;
pub mod regs;
pub mod registry;
pub mod request;
pub mod slot;
pub mod tuning;

pub use config::{CqSettings, HostConfig, Timeouts};
pub use cq::{CoalescingConfig, CqRequest, CqTaskParams, DcmdRequest, TaskState};
pub use host::{Host, HostCapabilities, check_busy};
pub use registry::{DeviceDriver, DeviceRegistry};
pub use request::{
    AutoCommand, Command, CommandKind, DataBuffer, DataPhase, Request, RequestStatus,
    ResponseType,
};
pub use slot::Slot;
pub use tuning::{TUNING_BLOCK_4BIT, TUNING_BLOCK_8BIT};

pub use sdhc_driver_api::SdError;
