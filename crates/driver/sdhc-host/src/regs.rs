//! Controller register layout.
//!
//! Three banks, all 32-bit registers:
//!
//! - HRS: host registers shared by every slot, at offset 0
//! - SRS: the standard slot register set, at `0x200 + slot * 0x400`
//! - CQRS: the command queue bank, `0x200` above the slot's SRS

use bitflags::bitflags;
use sdhc_mmio::register_block;

/// Offset of slot 0's SRS bank.
pub const SLOT_BASE: u32 = 0x200;
/// Distance between consecutive slots.
pub const SLOT_STRIDE: u32 = 0x400;
/// Offset of the CQ bank relative to its slot's SRS bank.
pub const CQ_BANK_OFFSET: u32 = 0x200;

/// Returns the SRS base offset of `slot`.
#[must_use]
pub const fn slot_base(slot: u8) -> u32 {
    SLOT_BASE + slot as u32 * SLOT_STRIDE
}

// ---------------------------------------------------------------------------
// Host register set
// ---------------------------------------------------------------------------

register_block! {
    /// Host registers shared by all slots.
    pub HostRegs {
        /// General information and host software reset.
        [0x00; rw] general => HostGeneral,
        /// eMMC control.
        [0x18; rw] emmc_control,
        /// Host capabilities.
        [0x78; ro] host_caps => HostCaps,
        /// Controller IP version.
        [0x7C; ro] version,
    }
}

bitflags! {
    /// HRS00 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostGeneral: u32 {
        /// Software reset of the whole controller; self-clearing.
        const SOFTWARE_RESET = 1 << 0;
    }
}

bitflags! {
    /// HRS30 host capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCaps: u32 {
        /// HS400 enhanced strobe supported.
        const HS400ES = 1 << 0;
        /// eMMC command queuing supported.
        const CQ = 1 << 1;
    }
}

// ---------------------------------------------------------------------------
// Slot register set
// ---------------------------------------------------------------------------

register_block! {
    /// Standard slot registers.
    pub SlotRegs {
        /// SDMA system address, or argument 2 (auto-CMD23 block count).
        [0x00; rw] sdma_address,
        /// Block size (11:0), SDMA boundary (14:12), block count (31:16).
        [0x04; rw] block,
        /// Command argument.
        [0x08; rw] argument,
        /// Transfer mode (15:0) and command (31:16); writing issues the command.
        [0x0C; rw] command => CommandWord,
        /// Response bits 31:0.
        [0x10; ro] response0,
        /// Response bits 63:32.
        [0x14; ro] response1,
        /// Response bits 95:64.
        [0x18; ro] response2,
        /// Response bits 127:96 (also the auto-CMD12 response).
        [0x1C; ro] response3,
        /// PIO buffer data port.
        [0x20; rw] data_port,
        /// Present state.
        [0x24; ro] present_state => PresentState,
        /// Host control 1, power, block gap and wakeup control.
        [0x28; rw] host_control1 => HostControl1,
        /// Clock control, timeout control and software resets.
        [0x2C; rw] clock_reset => ClockReset,
        /// Normal (15:0) and error (31:16) interrupt status.
        [0x30; rw1c] int_status => IntStatus,
        /// Interrupt status enable.
        [0x34; rw] int_status_enable => IntStatus,
        /// Interrupt signal enable.
        [0x38; rw] int_signal_enable => IntStatus,
        /// Auto-command error status (15:0) and host control 2 (31:16).
        [0x3C; rw] auto_cmd_control2 => AutoCmdControl2,
        /// Capabilities, low word.
        [0x40; ro] caps1,
        /// Capabilities, high word.
        [0x44; ro] caps2 => Caps2,
        /// ADMA system address, low word.
        [0x58; rw] adma_address_lo,
        /// ADMA system address, high word.
        [0x5C; rw] adma_address_hi,
    }
}

bitflags! {
    /// Transfer mode and command register image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandWord: u32 {
        /// Use DMA for the data phase.
        const DMA_ENABLE = 1 << 0;
        /// Block count register is valid.
        const BLOCK_COUNT_ENABLE = 1 << 1;
        /// Send CMD12 after the last block.
        const AUTO_CMD12 = 1 << 2;
        /// Send CMD23 before the data command.
        const AUTO_CMD23 = 2 << 2;
        /// Card to host.
        const READ = 1 << 4;
        /// More than one block.
        const MULTI_BLOCK = 1 << 5;
        /// 136-bit response.
        const RESPONSE_136 = 1 << 16;
        /// 48-bit response.
        const RESPONSE_48 = 2 << 16;
        /// 48-bit response with busy on DAT0.
        const RESPONSE_48_BUSY = 3 << 16;
        /// Check the response CRC.
        const CRC_CHECK = 1 << 19;
        /// Check the response command index.
        const INDEX_CHECK = 1 << 20;
        /// Command has a data phase.
        const DATA_PRESENT = 1 << 21;
        /// Suspend command.
        const TYPE_SUSPEND = 1 << 22;
        /// Resume command.
        const TYPE_RESUME = 2 << 22;
        /// Abort command (CMD12, CMD52 abort).
        const TYPE_ABORT = 3 << 22;
    }
}

impl CommandWord {
    /// Shift of the command index field.
    pub const INDEX_SHIFT: u32 = 24;

    /// Returns the word with `index` in the command index field.
    #[must_use]
    pub const fn with_index(self, index: u8) -> Self {
        Self::from_bits_retain(self.bits() | ((index as u32 & 0x3F) << Self::INDEX_SHIFT))
    }

    /// Extracts the command index.
    #[must_use]
    pub const fn index(self) -> u8 {
        ((self.bits() >> Self::INDEX_SHIFT) & 0x3F) as u8
    }
}

bitflags! {
    /// Present state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentState: u32 {
        /// Command inhibit (CMD line in use).
        const CMD_INHIBIT = 1 << 0;
        /// Command inhibit for commands using DAT lines.
        const DAT_INHIBIT = 1 << 1;
        /// DAT line active.
        const DAT_LINE_ACTIVE = 1 << 2;
        /// Host asks for re-tuning.
        const RETUNE_REQUEST = 1 << 3;
        /// Write transfer active.
        const WRITE_ACTIVE = 1 << 8;
        /// Read transfer active.
        const READ_ACTIVE = 1 << 9;
        /// Buffer write enable.
        const BUFFER_WRITE_ENABLE = 1 << 10;
        /// Buffer read enable.
        const BUFFER_READ_ENABLE = 1 << 11;
        /// Card inserted.
        const CARD_INSERTED = 1 << 16;
        /// DAT[3:0] signal levels.
        const DAT_LEVEL = 0xF << 20;
        /// CMD signal level.
        const CMD_LEVEL = 1 << 24;
    }
}

bitflags! {
    /// Host control 1 (7:0), power (15:8), block gap (23:16), wakeup (31:24).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostControl1: u32 {
        /// 4-bit data transfer width.
        const WIDTH_4 = 1 << 1;
        /// High speed enable.
        const HIGH_SPEED = 1 << 2;
        /// DMA select field.
        const DMA_SELECT = 3 << 3;
        /// DMA select: ADMA2.
        const DMA_ADMA2 = 2 << 3;
        /// 8-bit data transfer width.
        const WIDTH_8 = 1 << 5;
        /// Stop at block gap request.
        const STOP_AT_BLOCK_GAP = 1 << 16;
        /// Continue request.
        const CONTINUE = 1 << 17;
    }
}

bitflags! {
    /// Clock control (15:0), timeout control (19:16), software reset (26:24).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockReset: u32 {
        /// Data timeout counter value field.
        const TIMEOUT_FIELD = 0xF << 16;
        /// Software reset for all.
        const RESET_ALL = 1 << 24;
        /// Software reset for the CMD line.
        const RESET_CMD = 1 << 25;
        /// Software reset for the DAT line.
        const RESET_DAT = 1 << 26;
    }
}

bitflags! {
    /// Normal and error interrupt bits, shared by status, status-enable and
    /// signal-enable registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        /// Command complete.
        const CMD_COMPLETE = 1 << 0;
        /// Transfer complete.
        const XFER_COMPLETE = 1 << 1;
        /// Block gap event.
        const BLOCK_GAP = 1 << 2;
        /// DMA interrupt (SDMA boundary).
        const DMA_INT = 1 << 3;
        /// Buffer write ready.
        const BUF_WRITE_READY = 1 << 4;
        /// Buffer read ready.
        const BUF_READ_READY = 1 << 5;
        /// Card insertion.
        const CARD_INSERT = 1 << 6;
        /// Card removal.
        const CARD_REMOVE = 1 << 7;
        /// Card interrupt (SDIO).
        const CARD_INT = 1 << 8;
        /// Re-tuning event.
        const RETUNE_EVENT = 1 << 12;
        /// Command queuing interrupt.
        const CQ_INT = 1 << 14;
        /// Summary of the error half.
        const ERROR_INT = 1 << 15;
        /// Command timeout.
        const CMD_TIMEOUT = 1 << 16;
        /// Command CRC error.
        const CMD_CRC = 1 << 17;
        /// Command end bit error.
        const CMD_END_BIT = 1 << 18;
        /// Command index error.
        const CMD_INDEX = 1 << 19;
        /// Data timeout.
        const DATA_TIMEOUT = 1 << 20;
        /// Data CRC error.
        const DATA_CRC = 1 << 21;
        /// Data end bit error.
        const DATA_END_BIT = 1 << 22;
        /// Current limit error.
        const CURRENT_LIMIT = 1 << 23;
        /// Auto command error.
        const AUTO_CMD = 1 << 24;
        /// ADMA error.
        const ADMA = 1 << 25;
        /// Tuning error.
        const TUNING = 1 << 26;
        /// Response error.
        const RESPONSE = 1 << 27;
    }
}

impl IntStatus {
    /// Every defined error bit.
    pub const ERRORS: Self = Self::from_bits_retain(
        Self::CMD_TIMEOUT.bits()
            | Self::CMD_CRC.bits()
            | Self::CMD_END_BIT.bits()
            | Self::CMD_INDEX.bits()
            | Self::DATA_TIMEOUT.bits()
            | Self::DATA_CRC.bits()
            | Self::DATA_END_BIT.bits()
            | Self::CURRENT_LIMIT.bits()
            | Self::AUTO_CMD.bits()
            | Self::ADMA.bits()
            | Self::TUNING.bits()
            | Self::RESPONSE.bits(),
    );

    /// Errors detected on the CMD line.
    pub const CMD_LINE_ERRORS: Self = Self::from_bits_retain(
        Self::CMD_TIMEOUT.bits()
            | Self::CMD_CRC.bits()
            | Self::CMD_END_BIT.bits()
            | Self::CMD_INDEX.bits(),
    );

    /// Errors detected on the DAT lines.
    pub const DAT_LINE_ERRORS: Self = Self::from_bits_retain(
        Self::DATA_TIMEOUT.bits()
            | Self::DATA_CRC.bits()
            | Self::DATA_END_BIT.bits()
            | Self::ADMA.bits(),
    );

    /// Normal-half events the dispatcher acknowledges up front.
    pub const ACK: Self = Self::from_bits_retain(
        Self::CMD_COMPLETE.bits()
            | Self::XFER_COMPLETE.bits()
            | Self::BLOCK_GAP.bits()
            | Self::DMA_INT.bits()
            | Self::BUF_WRITE_READY.bits()
            | Self::BUF_READ_READY.bits()
            | Self::CARD_INSERT.bits()
            | Self::CARD_REMOVE.bits(),
    );

    /// Status bits enabled at slot reset.
    pub const DEFAULT_ENABLE: Self = Self::from_bits_retain(
        Self::ACK.bits()
            | Self::CARD_INT.bits()
            | Self::RETUNE_EVENT.bits()
            | Self::ERRORS.bits(),
    );
}

bitflags! {
    /// Auto-command error status (15:0) and host control 2 (31:16).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AutoCmdControl2: u32 {
        /// Auto CMD12 was not executed.
        const AUTO_CMD12_NOT_EXECUTED = 1 << 0;
        /// Auto command timeout.
        const AUTO_CMD_TIMEOUT = 1 << 1;
        /// Auto command CRC error.
        const AUTO_CMD_CRC = 1 << 2;
        /// Auto command end bit error.
        const AUTO_CMD_END_BIT = 1 << 3;
        /// Auto command index error.
        const AUTO_CMD_INDEX = 1 << 4;
        /// Auto command response error.
        const AUTO_CMD_RESPONSE = 1 << 5;
        /// Command not issued because of an auto-CMD12 error.
        const CMD_NOT_ISSUED = 1 << 7;
        /// UHS mode select field.
        const UHS_MODE = 7 << 16;
        /// 1.8 V signaling.
        const SIGNALING_1V8 = 1 << 19;
        /// Execute tuning; cleared by hardware when tuning ends.
        const EXECUTE_TUNING = 1 << 22;
        /// Sampling clock select; set by hardware on tuning success.
        const SAMPLING_CLOCK = 1 << 23;
        /// Host version 4 enable.
        const HOST_V4 = 1 << 28;
        /// 64-bit addressing.
        const ADDRESSING_64 = 1 << 29;
        /// Preset value enable.
        const PRESET_VALUE = 1 << 31;
    }
}

impl AutoCmdControl2 {
    /// Shift of the UHS mode select field.
    pub const UHS_SHIFT: u32 = 16;

    /// Auto command error causes.
    pub const ERRORS: Self = Self::from_bits_retain(
        Self::AUTO_CMD_TIMEOUT.bits()
            | Self::AUTO_CMD_CRC.bits()
            | Self::AUTO_CMD_END_BIT.bits()
            | Self::AUTO_CMD_INDEX.bits()
            | Self::AUTO_CMD_RESPONSE.bits(),
    );
}

bitflags! {
    /// Capabilities, high word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps2: u32 {
        /// SDR50 supported.
        const SDR50 = 1 << 0;
        /// SDR104 supported.
        const SDR104 = 1 << 1;
        /// DDR50 supported.
        const DDR50 = 1 << 2;
        /// Timer count for re-tuning field.
        const RETUNE_TIMER = 0xF << 8;
        /// SDR50 needs tuning.
        const SDR50_TUNING = 1 << 13;
        /// Re-tuning modes field.
        const RETUNE_MODES = 3 << 14;
    }
}

impl Caps2 {
    /// Re-tuning timer period in seconds, or `None` when the timer is off.
    ///
    /// The field encodes `2^(n-1)` seconds for `n` in 1..=0xB.
    #[must_use]
    pub const fn retune_timer_secs(self) -> Option<u32> {
        let n = (self.bits() >> 8) & 0xF;
        if n == 0 || n > 0xB {
            None
        } else {
            Some(1 << (n - 1))
        }
    }
}

// ---------------------------------------------------------------------------
// Command queue register set
// ---------------------------------------------------------------------------

register_block! {
    /// Command queuing registers.
    pub CqRegs {
        /// CQ version.
        [0x00; ro] version,
        /// CQ capabilities.
        [0x04; ro] caps,
        /// Configuration.
        [0x08; rw] config => CqConfig,
        /// Control.
        [0x0C; rw] control => CqControl,
        /// Interrupt status.
        [0x10; rw1c] int_status => CqIntStatus,
        /// Interrupt status enable.
        [0x14; rw] int_status_enable => CqIntStatus,
        /// Interrupt signal enable.
        [0x18; rw] int_signal_enable => CqIntStatus,
        /// Interrupt coalescing.
        [0x1C; rw] coalescing,
        /// Task descriptor list base, low word.
        [0x20; rw] tdl_base_lo,
        /// Task descriptor list base, high word.
        [0x24; rw] tdl_base_hi,
        /// Task doorbell; writing 1 rings a task.
        [0x28; rw] doorbell,
        /// Task completion notification.
        [0x2C; rw1c] completion,
        /// Device queue status.
        [0x30; ro] device_queue_status,
        /// Device pending tasks.
        [0x34; ro] device_pending,
        /// Task clear; bits self-clear when the task is cleared.
        [0x38; rw] task_clear,
        /// Send status configuration 1.
        [0x40; rw] send_status1,
        /// Send status configuration 2 (RCA).
        [0x44; rw] send_status2,
        /// Response of the last direct command.
        [0x48; ro] dcmd_response,
        /// Response mode error mask.
        [0x50; rw] response_error_mask,
        /// Task error information.
        [0x54; ro] task_error_info => TaskErrorInfo,
        /// Index of the last command with a response.
        [0x58; ro] last_response_index,
        /// Last response argument.
        [0x5C; ro] last_response,
    }
}

bitflags! {
    /// CQ configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CqConfig: u32 {
        /// Command queuing enable.
        const ENABLE = 1 << 0;
        /// 128-bit task descriptors.
        const TASK_DESC_128 = 1 << 8;
        /// Direct command enable.
        const DCMD_ENABLE = 1 << 12;
    }
}

bitflags! {
    /// CQ control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CqControl: u32 {
        /// Halt the queue.
        const HALT = 1 << 0;
        /// Clear all tasks; self-clearing.
        const CLEAR_ALL = 1 << 8;
    }
}

bitflags! {
    /// CQ interrupt bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CqIntStatus: u32 {
        /// Halt complete.
        const HALT_COMPLETE = 1 << 0;
        /// Task complete.
        const TASK_COMPLETE = 1 << 1;
        /// Response error detected.
        const RESPONSE_ERROR = 1 << 2;
        /// Task cleared.
        const TASK_CLEARED = 1 << 3;
        /// Task error.
        const TASK_ERROR = 1 << 4;
    }
}

impl CqIntStatus {
    /// Both error causes.
    pub const ERRORS: Self =
        Self::from_bits_retain(Self::RESPONSE_ERROR.bits() | Self::TASK_ERROR.bits());
}

bitflags! {
    /// Task error information.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskErrorInfo: u32 {
        /// Response mode error fields are valid.
        const RESPONSE_VALID = 1 << 15;
        /// Data transfer error fields are valid.
        const DATA_VALID = 1 << 31;
    }
}

impl TaskErrorInfo {
    /// Task ID of the response mode error.
    #[must_use]
    pub const fn response_task(self) -> u8 {
        ((self.bits() >> 8) & 0x1F) as u8
    }

    /// Task ID of the data transfer error.
    #[must_use]
    pub const fn data_task(self) -> u8 {
        ((self.bits() >> 24) & 0x1F) as u8
    }
}

/// Coalescing register: enable.
pub const COALESCING_ENABLE: u32 = 1 << 31;
/// Coalescing register: counter and timer reset.
pub const COALESCING_RESET: u32 = 1 << 16;
/// Coalescing register: threshold write enable.
pub const COALESCING_THRESHOLD_WEN: u32 = 1 << 15;
/// Coalescing register: timeout write enable.
pub const COALESCING_TIMEOUT_WEN: u32 = 1 << 7;
