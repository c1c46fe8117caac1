//! Simulated SD host controller for driver tests.
//!
//! [`SimController`] implements [`RegisterIo`] over a register map laid out
//! like the real controller (host registers at 0, slot 0 at `0x200`, its
//! command queue bank at `0x400`) and models just enough behaviour to drive
//! the host core without hardware:
//!
//! - write-1-to-clear interrupt status, with the error summary and CQ
//!   summary bits derived from the other bits
//! - self-clearing host and line resets, recorded for inspection
//! - commands that complete on their own: a response, command complete, and
//!   then a PIO FIFO, DMA completion or busy release as the command needs
//! - the hardware tuning sweep (execute-tuning / sampling-clock handshake)
//! - a command queue doorbell, halt, task clear and completion model
//!
//! Only slot 0 runs commands. Other slots exist as plain registers with
//! self-clearing resets, so a multi-slot host can still come up.

mod dma;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};

use sdhc_core::log::{self, LogLevel};
use sdhc_mmio::RegisterIo;

pub use dma::{ADMA_TABLE_ADDR, DESCRIPTOR_BASE, HeapDescriptors, SimDma};

// ---------------------------------------------------------------------------
// Register map
// ---------------------------------------------------------------------------

const HRS_GENERAL: u32 = 0x000;
const HRS_HOST_CAPS: u32 = 0x078;
const HRS_VERSION: u32 = 0x07C;

const SRS: u32 = 0x200;
const SLOT_STRIDE: u32 = 0x400;
const SRS_ARGUMENT: u32 = SRS + 0x08;
const SRS_BLOCK: u32 = SRS + 0x04;
const SRS_COMMAND: u32 = SRS + 0x0C;
const SRS_RESPONSE: u32 = SRS + 0x10;
const SRS_DATA_PORT: u32 = SRS + 0x20;
const SRS_PRESENT: u32 = SRS + 0x24;
const SRS_CLOCK_RESET: u32 = SRS + 0x2C;
const SRS_INT_STATUS: u32 = SRS + 0x30;
const SRS_INT_STATUS_ENABLE: u32 = SRS + 0x34;
const SRS_AUTO_CMD_CONTROL2: u32 = SRS + 0x3C;
const SRS_CAPS2: u32 = SRS + 0x44;

const CQ: u32 = 0x400;
const CQ_CONTROL: u32 = CQ + 0x0C;
const CQ_INT_STATUS: u32 = CQ + 0x10;
const CQ_DOORBELL: u32 = CQ + 0x28;
const CQ_COMPLETION: u32 = CQ + 0x2C;
const CQ_TASK_CLEAR: u32 = CQ + 0x38;
const CQ_DCMD_RESPONSE: u32 = CQ + 0x48;
const CQ_TASK_ERROR_INFO: u32 = CQ + 0x54;

// ---------------------------------------------------------------------------
// Bits the simulator acts on
// ---------------------------------------------------------------------------

/// Command complete.
pub const INT_CMD_COMPLETE: u32 = 1 << 0;
/// Transfer complete.
pub const INT_XFER_COMPLETE: u32 = 1 << 1;
/// Buffer write ready.
pub const INT_BUF_WRITE_READY: u32 = 1 << 4;
/// Buffer read ready.
pub const INT_BUF_READ_READY: u32 = 1 << 5;
/// Card insertion.
pub const INT_CARD_INSERT: u32 = 1 << 6;
/// Card removal.
pub const INT_CARD_REMOVE: u32 = 1 << 7;
/// Card interrupt.
pub const INT_CARD_INT: u32 = 1 << 8;
/// Re-tuning event. Stays set until tuning succeeds.
pub const INT_RETUNE: u32 = 1 << 12;
/// CQ summary.
pub const INT_CQ: u32 = 1 << 14;
/// Error summary.
pub const INT_ERROR: u32 = 1 << 15;

const CMD_DMA: u32 = 1 << 0;
const CMD_BLOCK_COUNT_ENABLE: u32 = 1 << 1;
const CMD_READ: u32 = 1 << 4;
const CMD_MULTI_BLOCK: u32 = 1 << 5;
const CMD_RESPONSE_MASK: u32 = 3 << 16;
const CMD_RESPONSE_BUSY: u32 = 3 << 16;
const CMD_DATA_PRESENT: u32 = 1 << 21;

const PRESENT_RETUNE_REQUEST: u32 = 1 << 3;
const PRESENT_CARD: u32 = 1 << 16;
const PRESENT_DAT_SHIFT: u32 = 20;
const PRESENT_CMD_HIGH: u32 = 1 << 24;

const RESET_ALL: u32 = 1 << 24;
const RESET_DAT: u32 = 1 << 26;
const RESET_MASK: u32 = 7 << 24;

const EXECUTE_TUNING: u32 = 1 << 22;
const SAMPLING_CLOCK: u32 = 1 << 23;

const CQ_HALT: u32 = 1 << 0;
const CQ_CLEAR_ALL: u32 = 1 << 8;
const CQ_HALT_COMPLETE: u32 = 1 << 0;
const CQ_TASK_COMPLETE: u32 = 1 << 1;
const CQ_TASK_ERROR: u32 = 1 << 4;

/// Default host capabilities: command queuing and HS400 enhanced strobe.
pub const DEFAULT_HOST_CAPS: u32 = 0b11;
/// Card status returned when no response was configured (READY_FOR_DATA,
/// state tran).
pub const DEFAULT_RESPONSE: u32 = 0x900;

/// A command written to the command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCommand {
    /// Command index.
    pub index: u8,
    /// Argument register at the time of the write.
    pub argument: u32,
    /// Full transfer mode and command word.
    pub word: u32,
}

type ReadProvider = Box<dyn Fn(u8, u32) -> Vec<u8> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug)]
struct Transfer {
    direction: Direction,
    block_size: u32,
    /// `None` for an open-ended transfer.
    blocks_left: Option<u32>,
    in_block: u32,
    data: Vec<u8>,
    cursor: usize,
}

struct SimState {
    regs: HashMap<u32, u32>,
    card_present: bool,
    dat_level: u32,
    present_extra: u32,
    int_status: u32,
    card_irq: bool,
    auto_status: u32,
    host_control2: u32,
    commands: Vec<SimCommand>,
    line_resets: Vec<u32>,
    auto_complete: bool,
    held: HashSet<u8>,
    responses: HashMap<u8, [u32; 4]>,
    failures: HashMap<u8, u32>,
    completions_on: HashMap<u8, u32>,
    provider: Option<ReadProvider>,
    transfer: Option<Transfer>,
    written: Vec<u8>,
    tuning_target: u32,
    tuning_succeeds: bool,
    tuning_rounds: u32,
    cq_int_status: u32,
    doorbell: u32,
    completion: u32,
    dcmd_response: u32,
    task_error_info: u32,
}

/// A simulated controller with one active slot.
pub struct SimController {
    state: Mutex<SimState>,
}

impl SimController {
    /// Creates a controller with a card inserted and every command set to
    /// complete on its own.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut regs = HashMap::new();
        regs.insert(HRS_HOST_CAPS, DEFAULT_HOST_CAPS);
        regs.insert(HRS_VERSION, 0x0B);
        Arc::new(Self {
            state: Mutex::new(SimState {
                regs,
                card_present: true,
                dat_level: 0xF,
                present_extra: 0,
                int_status: 0,
                card_irq: false,
                auto_status: 0,
                host_control2: 0,
                commands: Vec::new(),
                line_resets: Vec::new(),
                auto_complete: true,
                held: HashSet::new(),
                responses: HashMap::new(),
                failures: HashMap::new(),
                completions_on: HashMap::new(),
                provider: None,
                transfer: None,
                written: Vec::new(),
                tuning_target: 0,
                tuning_succeeds: false,
                tuning_rounds: 0,
                cq_int_status: 0,
                doorbell: 0,
                completion: 0,
                dcmd_response: 0,
                task_error_info: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Inserts or removes the card. Only the present-state bit changes; use
    /// [`raise`](Self::raise) for the matching interrupt.
    pub fn set_card_present(&self, present: bool) {
        self.state().card_present = present;
    }

    /// Signal level of DAT[3:0]; all high by default.
    pub fn set_dat_level(&self, level: u32) {
        self.state().dat_level = level;
    }

    /// Extra present-state bits, such as DAT line active or the retune
    /// request.
    pub fn set_present_bits(&self, bits: u32) {
        self.state().present_extra = bits;
    }

    /// Sets interrupt status bits.
    ///
    /// [`INT_CARD_INT`] is not latched: it asserts the card's interrupt
    /// line, which stays up until [`lower_card_interrupt`](Self::lower_card_interrupt)
    /// and is only reported while its status enable bit is set.
    pub fn raise(&self, bits: u32) {
        let mut st = self.state();
        if bits & INT_CARD_INT != 0 {
            st.card_irq = true;
        }
        st.int_status |= bits & !INT_CARD_INT;
    }

    /// Releases the card's interrupt line.
    pub fn lower_card_interrupt(&self) {
        self.state().card_irq = false;
    }

    /// Turns automatic completion of every command on or off.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    /// Leaves commands with `index` pending forever.
    pub fn hold(&self, index: u8) {
        self.state().held.insert(index);
    }

    /// Response registers reported for command `index`.
    pub fn set_response(&self, index: u8, response: [u32; 4]) {
        self.state().responses.insert(index, response);
    }

    /// Makes the next command `index` fail with `error_bits` instead of
    /// completing.
    pub fn fail_next(&self, index: u8, error_bits: u32) {
        self.state().failures.insert(index, error_bits);
    }

    /// Source of read data: called with the command index and argument, the
    /// result is truncated or zero-padded to the transfer length.
    pub fn set_read_data(&self, provider: impl Fn(u8, u32) -> Vec<u8> + Send + 'static) {
        self.state().provider = Some(Box::new(provider));
    }

    /// Auto-command error status (low half of the auto-CMD / host control 2
    /// register).
    pub fn set_auto_cmd_status(&self, bits: u32) {
        self.state().auto_status = bits & 0xFFFF;
    }

    /// Host capability register.
    pub fn set_host_caps(&self, caps: u32) {
        self.state().regs.insert(HRS_HOST_CAPS, caps);
    }

    /// Slot capabilities, high word.
    pub fn set_caps2(&self, caps: u32) {
        self.state().regs.insert(SRS_CAPS2, caps);
    }

    /// Hardware tuning finishes after `rounds` tuning commands, with the
    /// sampling clock selected if `succeeds`.
    pub fn configure_hw_tuning(&self, rounds: u32, succeeds: bool) {
        let mut st = self.state();
        st.tuning_target = rounds;
        st.tuning_succeeds = succeeds;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Every command written so far.
    #[must_use]
    pub fn commands(&self) -> Vec<SimCommand> {
        self.state().commands.clone()
    }

    /// Indices of every command written so far.
    #[must_use]
    pub fn command_indices(&self) -> Vec<u8> {
        self.state().commands.iter().map(|c| c.index).collect()
    }

    /// Reset bits of every software reset written to slot 0, in order.
    #[must_use]
    pub fn line_resets(&self) -> Vec<u32> {
        self.state().line_resets.clone()
    }

    /// Bytes written through the data port.
    #[must_use]
    pub fn written_data(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Current task doorbell.
    #[must_use]
    pub fn doorbell(&self) -> u32 {
        self.state().doorbell
    }

    /// Reads a register the way the driver would.
    #[must_use]
    pub fn reg(&self, offset: u32) -> u32 {
        self.read32(offset)
    }

    /// Stores a raw register value, bypassing the register model.
    pub fn set_reg(&self, offset: u32, value: u32) {
        self.state().regs.insert(offset, value);
    }

    // -----------------------------------------------------------------------
    // Command queue events
    // -----------------------------------------------------------------------

    /// Completes the tasks in `mask`. `dcmd_response` is latched as the
    /// direct command response.
    pub fn complete_tasks(&self, mask: u32, dcmd_response: u32) {
        let mut st = self.state();
        st.doorbell &= !mask;
        st.completion |= mask;
        st.dcmd_response = dcmd_response;
        st.cq_int_status |= CQ_TASK_COMPLETE;
    }

    /// Completes the tasks in `mask` as soon as command `index` is issued.
    pub fn complete_tasks_on_command(&self, index: u8, mask: u32) {
        self.state().completions_on.insert(index, mask);
    }

    /// Raises a task error with the given error information, plus
    /// `slot_error_bits` in the slot's interrupt status.
    pub fn raise_task_error(&self, info: u32, slot_error_bits: u32) {
        let mut st = self.state();
        st.task_error_info = info;
        st.cq_int_status |= CQ_TASK_ERROR;
        st.int_status |= slot_error_bits;
    }
}

// ---------------------------------------------------------------------------
// Register model
// ---------------------------------------------------------------------------

impl SimState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn int_status(&self) -> u32 {
        let mut value = self.int_status;
        if self.card_irq && self.reg(SRS_INT_STATUS_ENABLE) & INT_CARD_INT != 0 {
            value |= INT_CARD_INT;
        }
        if self.cq_int_status != 0 {
            value |= INT_CQ;
        }
        if value & 0xFFFF_0000 != 0 {
            value |= INT_ERROR;
        }
        value
    }

    fn present_state(&self) -> u32 {
        let mut value =
            ((self.dat_level & 0xF) << PRESENT_DAT_SHIFT) | PRESENT_CMD_HIGH | self.present_extra;
        if self.card_present {
            value |= PRESENT_CARD;
        }
        value
    }

    fn software_reset(&mut self, value: u32) {
        let bits = value & RESET_MASK;
        if bits != 0 {
            self.line_resets.push(bits);
        }
        if bits & RESET_ALL != 0 {
            self.int_status = 0;
            self.transfer = None;
        } else if bits & RESET_DAT != 0 {
            self.transfer = None;
        }
        self.regs.insert(SRS_CLOCK_RESET, value & !RESET_MASK);
    }

    fn write_control2(&mut self, value: u32) {
        let old = self.host_control2;
        self.host_control2 = value & 0xFFFF_0000;
        if old & EXECUTE_TUNING == 0 && self.host_control2 & EXECUTE_TUNING != 0 {
            self.tuning_rounds = 0;
        }
    }

    fn command(&mut self, word: u32) {
        let index = ((word >> 24) & 0x3F) as u8;
        let argument = self.reg(SRS_ARGUMENT);
        self.commands.push(SimCommand {
            index,
            argument,
            word,
        });
        if let Some(mask) = self.completions_on.remove(&index) {
            self.doorbell &= !mask;
            self.completion |= mask;
            self.cq_int_status |= CQ_TASK_COMPLETE;
        }

        if (index == 19 || index == 21) && self.host_control2 & EXECUTE_TUNING != 0 {
            self.tuning_round();
            return;
        }
        if !self.auto_complete || self.held.contains(&index) {
            return;
        }
        if let Some(bits) = self.failures.remove(&index) {
            self.int_status |= bits;
            return;
        }

        let response = self
            .responses
            .get(&index)
            .copied()
            .unwrap_or([DEFAULT_RESPONSE, 0, 0, 0]);
        for (i, word) in (0u32..).zip(response) {
            self.regs.insert(SRS_RESPONSE + i * 4, word);
        }
        self.int_status |= INT_CMD_COMPLETE;

        if word & CMD_DATA_PRESENT == 0 {
            if word & CMD_RESPONSE_MASK == CMD_RESPONSE_BUSY {
                self.int_status |= INT_XFER_COMPLETE;
            }
            return;
        }
        if word & CMD_DMA != 0 {
            self.int_status |= INT_XFER_COMPLETE;
            return;
        }

        let block = self.reg(SRS_BLOCK);
        let block_size = (block & 0xFFF).max(1);
        let blocks_left = if word & CMD_BLOCK_COUNT_ENABLE != 0 {
            Some((block >> 16).max(1))
        } else if word & CMD_MULTI_BLOCK != 0 {
            None
        } else {
            Some(1)
        };
        let direction = if word & CMD_READ != 0 {
            Direction::Read
        } else {
            Direction::Write
        };
        let mut data = Vec::new();
        if direction == Direction::Read {
            data = self
                .provider
                .as_ref()
                .map(|p| p(index, argument))
                .unwrap_or_default();
            if let Some(blocks) = blocks_left {
                data.resize((block_size * blocks) as usize, 0);
            }
        }
        self.transfer = Some(Transfer {
            direction,
            block_size,
            blocks_left,
            in_block: 0,
            data,
            cursor: 0,
        });
        self.int_status |= match direction {
            Direction::Read => INT_BUF_READ_READY,
            Direction::Write => INT_BUF_WRITE_READY,
        };
    }

    fn tuning_round(&mut self) {
        self.tuning_rounds += 1;
        if self.tuning_target != 0 && self.tuning_rounds >= self.tuning_target {
            self.host_control2 &= !EXECUTE_TUNING;
            if self.tuning_succeeds {
                self.host_control2 |= SAMPLING_CLOCK;
                self.int_status &= !INT_RETUNE;
                self.present_extra &= !PRESENT_RETUNE_REQUEST;
            }
        }
        self.int_status |= INT_BUF_READ_READY;
    }

    /// Advances the PIO transfer by one data port word.
    fn port_word(&mut self, write: Option<u32>) -> u32 {
        let Some(xfer) = self.transfer.as_mut() else {
            return 0;
        };
        let value = match (xfer.direction, write) {
            (Direction::Read, None) => {
                let mut bytes = [0u8; 4];
                let end = (xfer.cursor + 4).min(xfer.data.len());
                let chunk = &xfer.data[xfer.cursor.min(end)..end];
                bytes[..chunk.len()].copy_from_slice(chunk);
                xfer.cursor = end;
                u32::from_le_bytes(bytes)
            }
            (Direction::Write, Some(value)) => {
                xfer.data.extend_from_slice(&value.to_le_bytes());
                0
            }
            _ => return 0,
        };
        xfer.in_block += 4;
        if xfer.in_block < xfer.block_size {
            return value;
        }
        xfer.in_block = 0;
        let ready = match xfer.direction {
            Direction::Read => INT_BUF_READ_READY,
            Direction::Write => INT_BUF_WRITE_READY,
        };
        match xfer.blocks_left.as_mut() {
            None => {
                self.int_status |= ready;
                return value;
            }
            Some(left) => {
                *left -= 1;
                if *left > 0 {
                    self.int_status |= ready;
                    return value;
                }
            }
        }
        if let Some(done) = self.transfer.take() {
            if done.direction == Direction::Write {
                self.written.extend_from_slice(&done.data);
            }
        }
        self.int_status |= INT_XFER_COMPLETE;
        value
    }
}

/// Slot register offset within its bank, for slots other than 0.
fn other_slot_reg(offset: u32) -> Option<u32> {
    if offset < SRS + SLOT_STRIDE {
        return None;
    }
    Some((offset - SRS) % SLOT_STRIDE)
}

impl RegisterIo for SimController {
    fn read32(&self, offset: u32) -> u32 {
        let mut st = self.state();
        match offset {
            SRS_INT_STATUS => st.int_status(),
            SRS_PRESENT => st.present_state(),
            SRS_AUTO_CMD_CONTROL2 => st.host_control2 | st.auto_status,
            SRS_DATA_PORT => st.port_word(None),
            CQ_INT_STATUS => st.cq_int_status,
            CQ_DOORBELL => st.doorbell,
            CQ_COMPLETION => st.completion,
            CQ_TASK_CLEAR => 0,
            CQ_DCMD_RESPONSE => st.dcmd_response,
            CQ_TASK_ERROR_INFO => st.task_error_info,
            _ => st.reg(offset),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = self.state();
        match offset {
            HRS_GENERAL => {
                st.regs.insert(offset, value & !1);
            }
            SRS_COMMAND => {
                st.regs.insert(offset, value);
                st.command(value);
            }
            SRS_DATA_PORT => {
                st.port_word(Some(value));
            }
            SRS_CLOCK_RESET => st.software_reset(value),
            SRS_INT_STATUS => st.int_status &= !value,
            SRS_AUTO_CMD_CONTROL2 => st.write_control2(value),
            CQ_CONTROL => {
                let old = st.reg(CQ_CONTROL);
                if value & CQ_HALT != 0 && old & CQ_HALT == 0 {
                    st.cq_int_status |= CQ_HALT_COMPLETE;
                }
                if value & CQ_CLEAR_ALL != 0 {
                    st.doorbell = 0;
                }
                st.regs.insert(offset, value & !CQ_CLEAR_ALL);
            }
            CQ_INT_STATUS => st.cq_int_status &= !value,
            CQ_DOORBELL => st.doorbell |= value,
            CQ_COMPLETION => st.completion &= !value,
            CQ_TASK_CLEAR => st.doorbell &= !value,
            _ => {
                let value = match other_slot_reg(offset) {
                    Some(0x2C) => value & !RESET_MASK,
                    _ => value,
                };
                st.regs.insert(offset, value);
            }
        }
    }

    fn delay_us(&self, _us: u32) {}
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn stderr_sink(level: LogLevel, args: core::fmt::Arguments<'_>) {
    eprintln!("[{}] {}", level.name(), args);
}

/// Routes driver log output to stderr at debug level. Safe to call from
/// every test.
pub fn install_logger() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: `stderr_sink` neither blocks on driver state nor calls
        // back into the driver.
        unsafe { log::set_log_fn(stderr_sink) };
        log::set_max_level(LogLevel::Debug);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_interrupt_follows_line_and_enable() {
        let sim = SimController::new();
        sim.raise(INT_CARD_INT);
        assert_eq!(sim.read32(SRS_INT_STATUS), 0, "not enabled");

        sim.write32(SRS_INT_STATUS_ENABLE, INT_CARD_INT);
        assert_eq!(sim.read32(SRS_INT_STATUS), INT_CARD_INT);
        sim.write32(SRS_INT_STATUS, INT_CARD_INT);
        assert_eq!(sim.read32(SRS_INT_STATUS), INT_CARD_INT, "read-only");

        sim.lower_card_interrupt();
        assert_eq!(sim.read32(SRS_INT_STATUS), 0);
    }

    #[test]
    fn status_is_write_one_to_clear() {
        let sim = SimController::new();
        sim.raise(INT_CMD_COMPLETE | INT_XFER_COMPLETE | (1 << 16));
        assert_eq!(
            sim.read32(SRS_INT_STATUS),
            INT_CMD_COMPLETE | INT_XFER_COMPLETE | (1 << 16) | INT_ERROR
        );
        sim.write32(SRS_INT_STATUS, INT_CMD_COMPLETE | (1 << 16));
        assert_eq!(sim.read32(SRS_INT_STATUS), INT_XFER_COMPLETE);
    }

    #[test]
    fn resets_self_clear_and_are_recorded() {
        let sim = SimController::new();
        sim.write32(SRS_CLOCK_RESET, (1 << 25) | (1 << 26) | 0x7);
        assert_eq!(sim.read32(SRS_CLOCK_RESET), 0x7);
        assert_eq!(sim.line_resets(), vec![(1 << 25) | (1 << 26)]);
        sim.write32(HRS_GENERAL, 1);
        assert_eq!(sim.read32(HRS_GENERAL), 0);
    }

    #[test]
    fn read_fifo_signals_per_block() {
        let sim = SimController::new();
        sim.set_read_data(|_, _| (0u8..16).collect());
        sim.write32(SRS_BLOCK, 8 | (2 << 16));
        sim.write32(SRS_COMMAND, (18 << 24) | CMD_DATA_PRESENT | CMD_READ | CMD_BLOCK_COUNT_ENABLE);
        assert_eq!(
            sim.read32(SRS_INT_STATUS),
            INT_CMD_COMPLETE | INT_BUF_READ_READY
        );
        sim.write32(SRS_INT_STATUS, INT_CMD_COMPLETE | INT_BUF_READ_READY);
        assert_eq!(sim.read32(SRS_DATA_PORT), 0x0302_0100);
        assert_eq!(sim.read32(SRS_DATA_PORT), 0x0706_0504);
        assert_eq!(sim.read32(SRS_INT_STATUS), INT_BUF_READ_READY);
        sim.write32(SRS_INT_STATUS, INT_BUF_READ_READY);
        sim.read32(SRS_DATA_PORT);
        sim.read32(SRS_DATA_PORT);
        assert_eq!(sim.read32(SRS_INT_STATUS), INT_XFER_COMPLETE);
    }

    #[test]
    fn cq_halt_and_clear() {
        let sim = SimController::new();
        sim.write32(CQ_DOORBELL, 0b101);
        sim.write32(CQ_TASK_CLEAR, 0b100);
        assert_eq!(sim.doorbell(), 0b001);
        sim.write32(CQ_CONTROL, CQ_HALT);
        assert_eq!(sim.read32(CQ_INT_STATUS), CQ_HALT_COMPLETE);
        assert_ne!(sim.read32(SRS_INT_STATUS) & INT_CQ, 0);
        sim.write32(CQ_CONTROL, CQ_HALT | CQ_CLEAR_ALL);
        assert_eq!(sim.doorbell(), 0);
        assert_eq!(sim.read32(CQ_CONTROL), CQ_HALT);
    }

    #[test]
    fn hardware_tuning_handshake() {
        let sim = SimController::new();
        sim.configure_hw_tuning(2, true);
        sim.write32(SRS_AUTO_CMD_CONTROL2, EXECUTE_TUNING);
        sim.write32(SRS_COMMAND, 19 << 24);
        assert_ne!(sim.read32(SRS_AUTO_CMD_CONTROL2) & EXECUTE_TUNING, 0);
        sim.write32(SRS_COMMAND, 19 << 24);
        let control = sim.read32(SRS_AUTO_CMD_CONTROL2);
        assert_eq!(control & EXECUTE_TUNING, 0);
        assert_ne!(control & SAMPLING_CLOCK, 0);
    }
}
