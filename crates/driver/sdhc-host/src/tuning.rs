//! Sampling-point tuning.
//!
//! Two procedures exist:
//!
//! - the hardware path, where the controller sweeps the sampling clock while
//!   the driver keeps feeding it tuning commands (CMD19 for SD, CMD21 for
//!   eMMC) until it clears execute-tuning
//! - the eMMC software path, used when the device driver supplies a
//!   [`PhaseTuner`](sdhc_driver_api::capability::PhaseTuner): each of 40
//!   phases is tried with a CMD21 read compared against the known pattern,
//!   and the middle of the first longest passing window wins
//!
//! [`TuningState`] tracks when a slot needs retuning.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use sdhc_core::{sd_debug, sd_err, sd_info};
use sdhc_driver_api::SdError;
use sdhc_driver_api::device::BusWidth;
use sdhc_mmio::wait_for;

use crate::engine::command_word;
use crate::regs::{AutoCmdControl2, ClockReset, IntStatus, PresentState};
use crate::request::{Command, DataBuffer, DataPhase, Request, ResponseType};
use crate::slot::Slot;

/// Tuning block returned by CMD19/CMD21 on a 4-bit bus.
pub const TUNING_BLOCK_4BIT: [u8; 64] = [
    0xff, 0x0f, 0xff, 0x00, 0xff, 0xcc, 0xc3, 0xcc, 0xc3, 0x3c, 0xcc, 0xff, 0xfe, 0xff, 0xfe, 0xef,
    0xff, 0xdf, 0xff, 0xdd, 0xff, 0xfb, 0xff, 0xfb, 0xbf, 0xff, 0x7f, 0xff, 0x77, 0xf7, 0xbd, 0xef,
    0xff, 0xf0, 0xff, 0xf0, 0x0f, 0xfc, 0xcc, 0x3c, 0xcc, 0x33, 0xcc, 0xcf, 0xff, 0xef, 0xff, 0xee,
    0xff, 0xfd, 0xff, 0xfd, 0xdf, 0xff, 0xbf, 0xff, 0xbb, 0xff, 0xf7, 0xff, 0xf7, 0x7f, 0x7b, 0xde,
];

/// Tuning block returned by CMD21 on an 8-bit bus.
pub const TUNING_BLOCK_8BIT: [u8; 128] = [
    0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc, 0xcc,
    0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, 0xff, 0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee, 0xff,
    0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, 0xdd, 0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff, 0xbb,
    0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, 0xff, 0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee, 0xff,
    0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc,
    0xcc, 0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, 0xff, 0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee,
    0xff, 0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, 0xdd, 0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff,
    0xbb, 0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, 0xff, 0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee,
];

/// Maximum tuning commands sent on the hardware path.
pub const TUNING_ITERATIONS: usize = 40;
/// Phases swept on the software path.
pub const TUNING_PHASES: usize = 40;

const SEND_TUNING_SD: u8 = 19;
const SEND_TUNING_MMC: u8 = 21;

/// Per-slot retuning bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningState {
    /// The current access mode needs a tuned sampling point.
    pub enabled: bool,
    /// A retune was requested by the controller.
    pub requested: bool,
    /// Bytes transferred since the last successful tuning.
    pub bytes_since: u64,
    /// Retuning timer period, if the controller has one.
    pub timer_secs: Option<u32>,
    /// Byte count after which a timer-mode retune is due.
    pub threshold: u64,
    /// Phase selected by the last software tuning.
    pub last_phase: Option<u8>,
}

impl TuningState {
    pub(crate) const fn new(threshold: u64) -> Self {
        Self {
            enabled: false,
            requested: false,
            bytes_since: 0,
            timer_secs: None,
            threshold,
            last_phase: None,
        }
    }

    /// Decides whether a retune must run before command `index`.
    #[must_use]
    pub fn needs_tuning(&self, index: u8, retune_bit: bool) -> bool {
        if !self.enabled || index == SEND_TUNING_SD || index == SEND_TUNING_MMC {
            return false;
        }
        self.requested
            || retune_bit
            || (self.timer_secs.is_some() && self.bytes_since > self.threshold)
    }

    pub(crate) fn account(&mut self, bytes: u64) {
        self.bytes_since = self.bytes_since.saturating_add(bytes);
    }

    fn tuned(&mut self, timer_secs: Option<u32>) {
        self.timer_secs = timer_secs;
        self.bytes_since = 0;
        self.requested = false;
    }
}

/// Returns the midpoint of the first longest run of passing phases.
#[must_use]
pub fn select_phase(passes: &[bool]) -> Option<u8> {
    let mut best: Option<(usize, usize)> = None;
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, &ok) in passes.iter().enumerate() {
        if ok {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if best.is_none_or(|(_, len)| run_len > len) {
                best = Some((run_start, run_len));
            }
        } else {
            run_len = 0;
        }
    }
    best.and_then(|(start, len)| u8::try_from(start + (len - 1) / 2).ok())
}

impl Slot {
    /// Runs tuning now, picking the procedure for the attached device.
    pub(crate) fn execute_tuning(&mut self) -> Result<(), SdError> {
        if self.current.is_some() {
            return Err(SdError::Busy);
        }
        let software = self.device.is_some_and(|d| d.kind.is_emmc()) && self.hooks.tuner.is_some();
        let result = if software {
            self.software_tuning()
        } else {
            self.hardware_tuning()
        };
        match result {
            Ok(()) => {
                let timer = self.srs.caps2().retune_timer_secs();
                self.tuning.tuned(timer);
                sd_info!("sdhc{}: tuning complete", self.index);
                Ok(())
            }
            Err(e) => {
                sd_err!("sdhc{}: tuning failed: {}", self.index, e);
                Err(SdError::Tuning)
            }
        }
    }

    /// Runs tuning if `req` is a data command and a retune is due.
    pub(crate) fn retune_if_needed(&mut self, req: &Request) -> Result<(), SdError> {
        if req.data().is_none() {
            return Ok(());
        }
        let retune_bit = self
            .srs
            .present_state()
            .contains(PresentState::RETUNE_REQUEST);
        if self.tuning.needs_tuning(req.command().index, retune_bit) {
            sd_debug!("sdhc{}: retune before CMD{}", self.index, req.command().index);
            self.execute_tuning()?;
        }
        Ok(())
    }

    fn tuning_command(&self) -> (u8, usize) {
        let emmc = self.device.is_some_and(|d| d.kind.is_emmc());
        if emmc && self.bus_width == BusWidth::Eight {
            (SEND_TUNING_MMC, TUNING_BLOCK_8BIT.len())
        } else if emmc {
            (SEND_TUNING_MMC, TUNING_BLOCK_4BIT.len())
        } else {
            (SEND_TUNING_SD, TUNING_BLOCK_4BIT.len())
        }
    }

    // -----------------------------------------------------------------------
    // Hardware path
    // -----------------------------------------------------------------------

    fn hardware_tuning(&mut self) -> Result<(), SdError> {
        match self.run_hw_tuning(false) {
            Ok(()) => Ok(()),
            Err(e) => {
                sd_debug!("sdhc{}: tuning pass failed ({}), retrying", self.index, e);
                self.run_hw_tuning(true)
            }
        }
    }

    fn run_hw_tuning(&mut self, reset: bool) -> Result<(), SdError> {
        if reset {
            let ctl = self.srs.auto_cmd_control2();
            self.srs.set_auto_cmd_control2(
                ctl.difference(AutoCmdControl2::EXECUTE_TUNING | AutoCmdControl2::SAMPLING_CLOCK),
            );
            self.reset_lines(ClockReset::RESET_CMD | ClockReset::RESET_DAT)?;
        }
        let ctl = self.srs.auto_cmd_control2();
        self.srs
            .set_auto_cmd_control2(ctl | AutoCmdControl2::EXECUTE_TUNING);

        let (index, len) = self.tuning_command();
        for _ in 0..TUNING_ITERATIONS {
            self.send_tuning_block(index, len)?;
            if !self
                .srs
                .auto_cmd_control2()
                .contains(AutoCmdControl2::EXECUTE_TUNING)
            {
                break;
            }
        }

        let ctl = self.srs.auto_cmd_control2();
        if ctl.contains(AutoCmdControl2::EXECUTE_TUNING) {
            self.srs
                .set_auto_cmd_control2(ctl.difference(AutoCmdControl2::EXECUTE_TUNING));
            return Err(SdError::Tuning);
        }
        if ctl.contains(AutoCmdControl2::SAMPLING_CLOCK) {
            Ok(())
        } else {
            Err(SdError::Tuning)
        }
    }

    /// Issues one tuning command and waits for buffer-read-ready. The
    /// controller consumes the block itself.
    fn send_tuning_block(&self, index: u8, len: usize) -> Result<(), SdError> {
        let srs = &self.srs;
        let budget = self.timeouts.line_idle();
        if !wait_for(&*self.io, budget, || {
            !srs.present_state()
                .intersects(PresentState::CMD_INHIBIT | PresentState::DAT_INHIBIT)
        }) {
            return Err(SdError::Timeout);
        }
        let phase = DataPhase::read(len as u32, 1);
        srs.set_block(phase.block_size | (1 << 16));
        srs.set_argument(0);
        self.io.barrier();
        srs.set_command(command_word(
            &Command::new(index, 0, ResponseType::R1),
            Some(&phase),
        ));
        let mut seen = IntStatus::empty();
        let ready = wait_for(&*self.io, budget, || {
            seen |= srs.int_status();
            seen.contains(IntStatus::BUF_READ_READY)
        });
        let ack = seen & (IntStatus::ACK | IntStatus::ERRORS | IntStatus::ERROR_INT);
        if !ack.is_empty() {
            srs.clear_int_status(ack);
        }
        if ready { Ok(()) } else { Err(SdError::Timeout) }
    }

    // -----------------------------------------------------------------------
    // Software path
    // -----------------------------------------------------------------------

    fn software_tuning(&mut self) -> Result<(), SdError> {
        let tuner = self.hooks.tuner.clone().ok_or(SdError::Unsupported)?;
        let (_, len) = self.tuning_command();
        let pattern: &[u8] = if len == TUNING_BLOCK_8BIT.len() {
            &TUNING_BLOCK_8BIT
        } else {
            &TUNING_BLOCK_4BIT
        };

        let mut passes = [false; TUNING_PHASES];
        for (phase, pass) in (0u8..).zip(passes.iter_mut()) {
            tuner.set_phase(self.index, phase)?;
            *pass = self.read_tuning_block(len).is_ok_and(|block| block == pattern);
        }
        let phase = select_phase(&passes).ok_or(SdError::Tuning)?;
        sd_debug!("sdhc{}: selected sampling phase {}", self.index, phase);
        tuner.set_phase(self.index, phase)?;
        if !self.read_tuning_block(len).is_ok_and(|block| block == pattern) {
            return Err(SdError::Tuning);
        }
        self.tuning.last_phase = Some(phase);
        Ok(())
    }

    fn read_tuning_block(&mut self, len: usize) -> Result<Vec<u8>, SdError> {
        let req = Arc::new(
            Request::new(Command::new(SEND_TUNING_MMC, 0, ResponseType::R1))
                .with_data(DataPhase::read(len as u32, 1), DataBuffer::Pio(vec![0; len])),
        );
        self.run_request(&req)?;
        req.take_data().ok_or(SdError::InvalidResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(range: core::ops::RangeInclusive<usize>) -> [bool; TUNING_PHASES] {
        let mut passes = [false; TUNING_PHASES];
        for i in range {
            passes[i] = true;
        }
        passes
    }

    #[test]
    fn midpoint_of_single_window() {
        assert_eq!(select_phase(&window(10..=19)), Some(14));
        assert_eq!(select_phase(&window(0..=0)), Some(0));
        assert_eq!(select_phase(&window(0..=39)), Some(19));
    }

    #[test]
    fn first_longest_window_wins() {
        let mut passes = window(2..=5);
        for p in &mut passes[20..24] {
            *p = true;
        }
        assert_eq!(select_phase(&passes), Some(3));
        passes[6] = true;
        assert_eq!(select_phase(&passes), Some(4));
    }

    #[test]
    fn no_window() {
        assert_eq!(select_phase(&[false; TUNING_PHASES]), None);
        assert_eq!(select_phase(&[]), None);
    }

    #[test]
    fn needs_tuning_rules() {
        let mut st = TuningState::new(1024);
        assert!(!st.needs_tuning(17, true));
        st.enabled = true;
        assert!(!st.needs_tuning(17, false));
        assert!(st.needs_tuning(17, true));
        assert!(!st.needs_tuning(19, true));
        assert!(!st.needs_tuning(21, true));
        st.requested = true;
        assert!(st.needs_tuning(18, false));
        st.tuned(None);
        st.account(4096);
        assert!(!st.needs_tuning(18, false));
        st.timer_secs = Some(8);
        assert!(st.needs_tuning(18, false));
        st.tuned(Some(8));
        assert_eq!(st.bytes_since, 0);
        assert!(!st.needs_tuning(18, false));
    }

    #[test]
    fn patterns_have_block_lengths() {
        assert_eq!(TUNING_BLOCK_4BIT.len(), 64);
        assert_eq!(TUNING_BLOCK_8BIT.len(), 128);
        assert_eq!(TUNING_BLOCK_4BIT[0..4], [0xff, 0x0f, 0xff, 0x00]);
    }
}
