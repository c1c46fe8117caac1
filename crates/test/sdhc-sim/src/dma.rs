//! Fake DMA capability and heap-backed descriptor memory.

use std::sync::{Arc, Mutex, PoisonError};

use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::{
    DescriptorMemory, DmaCapability, DmaMode, DmaSetup, TransferContext,
};

/// Address reported for the ADMA2 descriptor table of a transfer.
pub const ADMA_TABLE_ADDR: u64 = 0x8000_0000;
/// Physical address reported for allocated descriptor memory.
pub const DESCRIPTOR_BASE: u64 = 0x9000_0000;

/// Descriptor memory backed by a heap buffer.
#[derive(Debug)]
pub struct HeapDescriptors {
    phys: u64,
    bytes: Vec<u8>,
}

impl HeapDescriptors {
    /// `len` zeroed bytes reported at physical address `phys`.
    #[must_use]
    pub fn new(phys: u64, len: usize) -> Self {
        Self {
            phys,
            bytes: vec![0; len],
        }
    }
}

impl DescriptorMemory for HeapDescriptors {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// DMA capability that maps nothing and records every transfer it prepares.
#[derive(Debug)]
pub struct SimDma {
    mode: DmaMode,
    prepared: Mutex<Vec<TransferContext>>,
    interrupts: Mutex<u32>,
}

impl SimDma {
    /// Prepares every transfer for ADMA2.
    #[must_use]
    pub fn adma2() -> Arc<Self> {
        Arc::new(Self::with_mode(DmaMode::Adma2))
    }

    /// Prepares every transfer for SDMA at the first segment's address.
    #[must_use]
    pub fn sdma() -> Arc<Self> {
        Arc::new(Self::with_mode(DmaMode::Sdma))
    }

    fn with_mode(mode: DmaMode) -> Self {
        Self {
            mode,
            prepared: Mutex::new(Vec::new()),
            interrupts: Mutex::new(0),
        }
    }

    /// Transfers prepared so far.
    #[must_use]
    pub fn prepared(&self) -> Vec<TransferContext> {
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of DMA interrupts handed to the capability.
    #[must_use]
    pub fn interrupts(&self) -> u32 {
        *self.interrupts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DmaCapability for SimDma {
    fn prepare_transfer(&self, ctx: &mut TransferContext) -> Result<DmaSetup, SdError> {
        let first = ctx.segments.first().ok_or(SdError::InvalidParameter)?;
        let system_address = match self.mode {
            DmaMode::Adma2 => ADMA_TABLE_ADDR,
            DmaMode::Sdma => first.addr,
        };
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ctx.clone());
        Ok(DmaSetup {
            mode: self.mode,
            system_address,
        })
    }

    fn handle_interrupt(&self, ctx: &mut TransferContext, _raw_status: u32) -> bool {
        *self.interrupts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if self.mode == DmaMode::Sdma {
            let next = ctx.next_system_address.unwrap_or_else(|| {
                ctx.segments.first().map_or(0, |s| s.addr)
            });
            ctx.next_system_address = Some(next + 4096);
        }
        true
    }

    fn alloc_descriptors(&self, len: usize) -> Result<Box<dyn DescriptorMemory>, SdError> {
        Ok(Box::new(HeapDescriptors::new(DESCRIPTOR_BASE, len)))
    }
}
