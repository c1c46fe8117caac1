//! Task and transfer descriptor encoding.
//!
//! Every task owns two consecutive descriptors in the task descriptor list:
//! the task descriptor (or a direct-command descriptor) followed by either a
//! transfer descriptor or a link to an external transfer descriptor array.
//!
//! In the 64-bit format each descriptor is 8 bytes: attributes in the low
//! word, a 32-bit address in the high word. The 128-bit format appends the
//! high address word and 4 reserved bytes. All fields are little-endian.

use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::DataDirection;

use super::task::CqTaskParams;
use crate::request::ResponseType;

const VALID: u64 = 1 << 0;
const END: u64 = 1 << 1;
const INT: u64 = 1 << 2;

const ACT_SHIFT: u32 = 3;
const ACT_TASK: u64 = 0b101 << ACT_SHIFT;
const ACT_TRAN: u64 = 0b100 << ACT_SHIFT;
const ACT_LINK: u64 = 0b110 << ACT_SHIFT;

const FORCED_PROGRAMMING: u64 = 1 << 6;
const CONTEXT_SHIFT: u32 = 7;
const TAG_REQUEST: u64 = 1 << 11;
const DATA_READ: u64 = 1 << 12;
const PRIORITY: u64 = 1 << 13;
const QBR: u64 = 1 << 14;
const RELIABLE_WRITE: u64 = 1 << 15;
const BLOCK_COUNT_SHIFT: u32 = 16;
const ADDRESS_SHIFT: u32 = 32;

const DCMD_INDEX_SHIFT: u32 = 16;
const DCMD_TIMING: u64 = 1 << 22;
const DCMD_RESP_SHIFT: u32 = 23;

const LENGTH_SHIFT: u32 = 16;

/// Largest buffer a single transfer descriptor can describe.
pub const MAX_SEGMENT: u32 = 0x1_0000;

/// Width of each descriptor in the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    /// 8-byte descriptors, 32-bit addresses.
    Bits64,
    /// 16-byte descriptors, 64-bit addresses.
    Bits128,
}

impl DescriptorFormat {
    /// Bytes per descriptor.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Bits64 => 8,
            Self::Bits128 => 16,
        }
    }

    /// Bytes per task (task descriptor plus transfer or link descriptor).
    #[must_use]
    pub const fn slot_size(self) -> usize {
        self.size() * 2
    }

    /// Offset of `task`'s task descriptor in the list.
    #[must_use]
    pub const fn task_offset(self, task: u8) -> usize {
        task as usize * self.slot_size()
    }

    fn check_address(self, addr: u64) -> Result<(), SdError> {
        if self == Self::Bits64 && addr > u64::from(u32::MAX) {
            Err(SdError::InvalidParameter)
        } else {
            Ok(())
        }
    }
}

/// One encoded descriptor: the attribute/address word plus the upper
/// address word used only by the 128-bit format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Bits 63:0.
    pub low: u64,
    /// Bits 95:64.
    pub high: u32,
}

impl Descriptor {
    /// Writes the descriptor at the start of `buf` in `format`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `format.size()`.
    pub fn write(self, buf: &mut [u8], format: DescriptorFormat) {
        buf[..8].copy_from_slice(&self.low.to_le_bytes());
        if format == DescriptorFormat::Bits128 {
            buf[8..12].copy_from_slice(&self.high.to_le_bytes());
            buf[12..16].fill(0);
        }
    }

    /// Reads a descriptor back from `buf`.
    #[must_use]
    pub fn read(buf: &[u8], format: DescriptorFormat) -> Self {
        let mut low = [0u8; 8];
        low.copy_from_slice(&buf[..8]);
        let high = if format == DescriptorFormat::Bits128 {
            let mut high = [0u8; 4];
            high.copy_from_slice(&buf[8..12]);
            u32::from_le_bytes(high)
        } else {
            0
        };
        Self {
            low: u64::from_le_bytes(low),
            high,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Encodes a data task descriptor.
#[must_use]
pub fn task_descriptor(params: &CqTaskParams) -> Descriptor {
    let mut low = VALID | END | INT | ACT_TASK;
    if params.forced_programming {
        low |= FORCED_PROGRAMMING;
    }
    low |= u64::from(params.context_id & 0xF) << CONTEXT_SHIFT;
    if params.tag_request {
        low |= TAG_REQUEST;
    }
    if params.direction == DataDirection::Read {
        low |= DATA_READ;
    }
    if params.priority {
        low |= PRIORITY;
    }
    if params.qbr {
        low |= QBR;
    }
    if params.reliable_write {
        low |= RELIABLE_WRITE;
    }
    low |= u64::from(params.block_count) << BLOCK_COUNT_SHIFT;
    low |= u64::from(params.block_address) << ADDRESS_SHIFT;
    Descriptor { low, high: 0 }
}

/// Encodes a direct-command task descriptor.
///
/// Commands with a busy response are sent with the timing bit clear, so the
/// controller waits for the busy signal before starting the next task.
#[must_use]
pub fn dcmd_descriptor(index: u8, argument: u32, response: ResponseType, qbr: bool) -> Descriptor {
    let (resp, timing) = match response {
        ResponseType::None => (0u64, true),
        r if r.has_busy() => (3, false),
        _ => (2, true),
    };
    let mut low = VALID | END | INT | ACT_TASK;
    if qbr {
        low |= QBR;
    }
    low |= u64::from(index & 0x3F) << DCMD_INDEX_SHIFT;
    if timing {
        low |= DCMD_TIMING;
    }
    low |= resp << DCMD_RESP_SHIFT;
    low |= u64::from(argument) << ADDRESS_SHIFT;
    Descriptor { low, high: 0 }
}

/// Encodes a transfer descriptor for one buffer.
///
/// # Errors
///
/// [`SdError::InvalidParameter`] if `len` is 0 or above 64 KiB, or `addr`
/// does not fit the format.
pub fn transfer_descriptor(
    addr: u64,
    len: u32,
    last: bool,
    format: DescriptorFormat,
) -> Result<Descriptor, SdError> {
    if len == 0 || len > MAX_SEGMENT {
        return Err(SdError::InvalidParameter);
    }
    format.check_address(addr)?;
    let mut low = VALID | ACT_TRAN;
    if last {
        low |= END;
    }
    // A length of 64 KiB wraps to 0 in the 16-bit field.
    low |= u64::from(len & 0xFFFF) << LENGTH_SHIFT;
    low |= (addr & 0xFFFF_FFFF) << ADDRESS_SHIFT;
    Ok(Descriptor {
        low,
        high: (addr >> 32) as u32,
    })
}

/// Encodes a link descriptor pointing at an external transfer descriptor
/// array.
///
/// # Errors
///
/// [`SdError::InvalidParameter`] if `addr` does not fit the format.
pub fn link_descriptor(addr: u64, format: DescriptorFormat) -> Result<Descriptor, SdError> {
    format.check_address(addr)?;
    Ok(Descriptor {
        low: VALID | ACT_LINK | ((addr & 0xFFFF_FFFF) << ADDRESS_SHIFT),
        high: (addr >> 32) as u32,
    })
}

/// The no-op transfer descriptor paired with a direct command.
#[must_use]
pub const fn nop_descriptor() -> Descriptor {
    Descriptor {
        low: VALID | END,
        high: 0,
    }
}
