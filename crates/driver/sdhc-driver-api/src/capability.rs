//! Capabilities injected into the host controller core.
//!
//! The core owns no platform policy. Everything it cannot do on its own (DMA
//! mapping, coherent descriptor memory, programming a PHY phase, reacting to
//! SDIO card interrupts) is handed in as a trait object when the host is
//! configured. Optional hooks are modelled as present or absent
//! ([`SlotHooks`]) rather than as nullable callbacks.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::SdError;

// ---------------------------------------------------------------------------
// DMA
// ---------------------------------------------------------------------------

/// Direction of a data phase, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// One physically contiguous DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address of the buffer.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// DMA engine selected for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaMode {
    /// Single-address SDMA with boundary interrupts.
    Sdma,
    /// ADMA2 descriptor table.
    Adma2,
}

/// Everything the DMA layer needs to map one normal-mode transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    /// Slot index.
    pub slot: u8,
    /// Data direction.
    pub direction: DataDirection,
    /// Block length in bytes.
    pub block_size: u32,
    /// Number of blocks.
    pub block_count: u32,
    /// Caller's scatter list.
    pub segments: Vec<DmaSegment>,
    /// Controller uses 64-bit DMA addressing.
    pub addressing_64: bool,
    /// Set by [`DmaCapability::handle_interrupt`] when SDMA must be restarted
    /// at a new system address after a boundary interrupt.
    pub next_system_address: Option<u64>,
}

impl TransferContext {
    /// Total bytes the scatter list covers.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// How the DMA layer armed a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSetup {
    /// Engine to select in host control 1.
    pub mode: DmaMode,
    /// SDMA buffer address or ADMA2 descriptor table address.
    pub system_address: u64,
}

/// DMA mapping for normal-mode transfers and coherent memory for command
/// queue descriptors.
pub trait DmaCapability: Send + Sync {
    /// Validates and maps the scatter list, returning the engine and
    /// address to program.
    fn prepare_transfer(&self, ctx: &mut TransferContext) -> Result<DmaSetup, SdError>;

    /// Gives the DMA layer a look at a DMA interrupt.
    ///
    /// Returns `true` if the interrupt was consumed.
    fn handle_interrupt(&self, ctx: &mut TransferContext, raw_status: u32) -> bool;

    /// Allocates zeroed, device-visible memory for descriptors.
    fn alloc_descriptors(&self, len: usize) -> Result<Box<dyn DescriptorMemory>, SdError>;
}

/// A block of coherent memory the controller reads descriptors from.
pub trait DescriptorMemory: Send {
    /// Bus address of the first byte.
    fn phys_addr(&self) -> u64;

    /// CPU view of the memory.
    fn bytes(&self) -> &[u8];

    /// Mutable CPU view of the memory.
    fn bytes_mut(&mut self) -> &mut [u8];
}

// ---------------------------------------------------------------------------
// Device hooks
// ---------------------------------------------------------------------------

/// Programs the sampling phase for the software tuning path.
pub trait PhaseTuner: Send + Sync {
    /// Selects `phase` (0..40) on `slot`.
    fn set_phase(&self, slot: u8, phase: u8) -> Result<(), SdError>;
}

/// Receives SDIO card interrupts.
pub trait CardInterruptHandler: Send + Sync {
    /// Called from dispatch context when `slot` raises a card interrupt.
    ///
    /// The card interrupt stays masked until the host's
    /// `ack_card_interrupt` is called for the slot.
    fn card_interrupt(&self, slot: u8);
}

/// The optional hooks a device driver supplies for a slot.
#[derive(Clone, Default)]
pub struct SlotHooks {
    /// Phase programming for eMMC software tuning.
    pub tuner: Option<Arc<dyn PhaseTuner>>,
    /// SDIO card interrupt sink.
    pub card_interrupt: Option<Arc<dyn CardInterruptHandler>>,
}

impl SlotHooks {
    /// No hooks present.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            tuner: None,
            card_interrupt: None,
        }
    }

    /// Adds a phase tuner.
    #[must_use]
    pub fn with_tuner(mut self, tuner: Arc<dyn PhaseTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    /// Adds a card interrupt handler.
    #[must_use]
    pub fn with_card_interrupt(mut self, handler: Arc<dyn CardInterruptHandler>) -> Self {
        self.card_interrupt = Some(handler);
        self
    }
}

impl core::fmt::Debug for SlotHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotHooks")
            .field("tuner", &self.tuner.is_some())
            .field("card_interrupt", &self.card_interrupt.is_some())
            .finish()
    }
}
