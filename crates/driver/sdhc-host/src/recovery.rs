//! Error classification and bus recovery.
//!
//! [`calc_int_to_clear`] maps an error interrupt to exactly one [`SdError`]
//! and the status bits to acknowledge. `Slot::recover` then brings the bus
//! back to idle:
//!
//! - tuning errors are reported as-is, without touching the lines
//! - auto-CMD12 errors take the auto-CMD12 path, which yields one of four
//!   recovered codes or [`SdError::AutoCmd12Unrecoverable`]
//! - everything else resets the failing lines, sends an abort, resets both
//!   lines and checks that DAT[3:0] read high
//!
//! Signals are masked for the duration and restored on every exit. A nested
//! call (recovery triggered while recovering) only classifies and clears.

use sdhc_core::{sd_debug, sd_err, sd_warn};
use sdhc_driver_api::SdError;
use sdhc_mmio::wait_for;

use crate::engine::command_word;
use crate::regs::{AutoCmdControl2, ClockReset, IntStatus, PresentState};
use crate::request::{AutoCommand, Command};
use crate::slot::Slot;

/// How the interrupted request used the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoveryContext {
    /// Automatic command of the failed request.
    pub(crate) auto_cmd: AutoCommand,
    /// Send an abort command as part of line recovery.
    pub(crate) issue_abort: bool,
}

impl RecoveryContext {
    /// Recovery for a normal request.
    pub(crate) const fn request(auto_cmd: AutoCommand, issue_abort: bool) -> Self {
        Self {
            auto_cmd,
            issue_abort,
        }
    }

    /// Recovery with no request on the bus.
    pub(crate) const fn idle() -> Self {
        Self::request(AutoCommand::None, false)
    }

    /// Recovery under a halted command queue. The device is told about the
    /// failing task with CMD48 instead of CMD12.
    pub(crate) const fn queue() -> Self {
        Self::idle()
    }
}

/// Picks the error code for `status` and the bits to acknowledge.
///
/// The code is chosen by fixed priority; the clear set is every error bit
/// present plus the error summary bit, so it is always a subset of `status`.
/// Auto-command errors all map to [`SdError::AutoCmd`]; the auto-CMD12
/// recovery path refines that into its four outcomes. A cause latched in
/// `auto` without the interrupt bit still counts as an auto-command error.
/// Returns [`SdError::Undefined`] when nothing indicates an error.
#[must_use]
pub fn calc_int_to_clear(status: IntStatus, auto: AutoCmdControl2) -> (SdError, IntStatus) {
    const PRIORITY: [(IntStatus, SdError); 11] = [
        (IntStatus::TUNING, SdError::Tuning),
        (IntStatus::ADMA, SdError::Adma),
        (IntStatus::CMD_TIMEOUT, SdError::CmdTimeout),
        (IntStatus::CMD_CRC, SdError::CmdCrc),
        (IntStatus::CMD_END_BIT, SdError::CmdEndBit),
        (IntStatus::CMD_INDEX, SdError::CmdIndex),
        (IntStatus::DATA_TIMEOUT, SdError::DataTimeout),
        (IntStatus::DATA_CRC, SdError::DataCrc),
        (IntStatus::DATA_END_BIT, SdError::DataEndBit),
        (IntStatus::CURRENT_LIMIT, SdError::CurrentLimit),
        (IntStatus::RESPONSE, SdError::ResponseError),
    ];

    let errors = status & IntStatus::ERRORS;
    let clear = errors | (status & IntStatus::ERROR_INT);

    let code = if errors.contains(IntStatus::TUNING) {
        SdError::Tuning
    } else if errors.contains(IntStatus::ADMA) {
        SdError::Adma
    } else if errors.contains(IntStatus::AUTO_CMD)
        || (errors.is_empty() && auto.intersects(AutoCmdControl2::ERRORS))
    {
        SdError::AutoCmd
    } else {
        PRIORITY
            .iter()
            .find(|(bit, _)| errors.contains(*bit))
            .map_or(SdError::Undefined, |&(_, code)| code)
    };
    (code, clear)
}

impl Slot {
    /// Classifies `status`, recovers the bus and returns the code to report.
    pub(crate) fn recover(&mut self, status: IntStatus, ctx: RecoveryContext) -> SdError {
        let auto = self.srs.auto_cmd_control2();
        let (code, clear) = calc_int_to_clear(status, auto);
        if self.recovering {
            self.srs.clear_int_status(clear);
            return code;
        }
        self.recovering = true;
        let saved = self.srs.int_signal_enable();
        self.srs.set_int_signal_enable(IntStatus::empty());
        self.srs.clear_int_status(clear);

        let result = match code {
            SdError::Tuning => code,
            SdError::AutoCmd if ctx.auto_cmd == AutoCommand::Cmd12 => {
                self.recover_auto_cmd12(status, auto)
            }
            _ => self.recover_lines(status, code, ctx.issue_abort),
        };

        let saved = if self.card_int_armed {
            saved
        } else {
            saved.difference(IntStatus::CARD_INT)
        };
        self.srs.set_int_signal_enable(saved);
        self.recovering = false;
        if result == SdError::Unrecoverable || result == SdError::AutoCmd12Unrecoverable {
            sd_err!("sdhc{}: {} not recovered: {}", self.index, code, result);
        } else {
            sd_warn!("sdhc{}: recovered from {}", self.index, result);
        }
        result
    }

    fn recover_lines(&mut self, status: IntStatus, code: SdError, issue_abort: bool) -> SdError {
        let mut lines = ClockReset::empty();
        if status.intersects(IntStatus::CMD_LINE_ERRORS) {
            lines |= ClockReset::RESET_CMD;
        }
        if status.intersects(
            IntStatus::DAT_LINE_ERRORS | IntStatus::CURRENT_LIMIT | IntStatus::RESPONSE,
        ) {
            lines |= ClockReset::RESET_DAT;
        }
        if !lines.is_empty() && self.reset_lines(lines).is_err() {
            return SdError::Unrecoverable;
        }
        if issue_abort {
            if let Err(e) = self.send_abort_raw() {
                sd_debug!("sdhc{}: abort during recovery failed: {}", self.index, e);
            }
        }
        if self
            .reset_lines(ClockReset::RESET_CMD | ClockReset::RESET_DAT)
            .is_err()
        {
            return SdError::Unrecoverable;
        }
        if !self.dat_lines_idle() {
            return SdError::Unrecoverable;
        }
        code
    }

    fn recover_auto_cmd12(&mut self, status: IntStatus, auto: AutoCmdControl2) -> SdError {
        let issued = !auto.contains(AutoCmdControl2::AUTO_CMD12_NOT_EXECUTED);
        if !issued && self.reset_lines(ClockReset::RESET_CMD).is_err() {
            return SdError::AutoCmd12Unrecoverable;
        }
        let data_error = status.intersects(IntStatus::DAT_LINE_ERRORS);
        if self.send_abort_raw().is_err() {
            let _ = self.reset_lines(ClockReset::RESET_CMD | ClockReset::RESET_DAT);
            return SdError::AutoCmd12Unrecoverable;
        }
        if data_error && self.reset_lines(ClockReset::RESET_DAT).is_err() {
            return SdError::AutoCmd12Unrecoverable;
        }
        match (issued, data_error) {
            (true, false) => SdError::AutoCmd12RecoverableA,
            (true, true) => SdError::AutoCmd12RecoverableB,
            (false, false) => SdError::AutoCmd12RecoverableC,
            (false, true) => SdError::AutoCmd12RecoverableD,
        }
    }

    /// Sets the software reset bits in `lines` and waits for them to clear.
    pub(crate) fn reset_lines(&self, lines: ClockReset) -> Result<(), SdError> {
        self.srs.set_clock_reset(self.srs.clock_reset() | lines);
        let srs = &self.srs;
        if wait_for(&*self.io, self.timeouts.reset(), || {
            !srs.clock_reset().intersects(lines)
        }) {
            Ok(())
        } else {
            sd_err!("sdhc{}: line reset {:#x} stuck", self.index, lines.bits());
            Err(SdError::Timeout)
        }
    }

    fn dat_lines_idle(&self) -> bool {
        let srs = &self.srs;
        wait_for(&*self.io, self.timeouts.dat_idle(), || {
            srs.present_state().contains(PresentState::DAT_LEVEL)
        })
    }

    /// Sends CMD12 by hand and polls raw status for its completion, without
    /// going through the dispatcher.
    pub(crate) fn send_abort_raw(&self) -> Result<(), SdError> {
        let srs = &self.srs;
        let budget = self.timeouts.line_idle();
        if !wait_for(&*self.io, budget, || {
            !srs.present_state().contains(PresentState::CMD_INHIBIT)
        }) {
            return Err(SdError::Timeout);
        }
        srs.set_argument(0);
        self.io.barrier();
        srs.set_command(command_word(&Command::stop_transmission(), None));

        let mut seen = IntStatus::empty();
        let done = wait_for(&*self.io, budget, || {
            seen |= srs.int_status();
            seen.intersects(IntStatus::ERRORS) || seen.contains(IntStatus::XFER_COMPLETE)
        });
        let ack = seen
            & (IntStatus::CMD_COMPLETE
                | IntStatus::XFER_COMPLETE
                | IntStatus::ERRORS
                | IntStatus::ERROR_INT);
        if !ack.is_empty() {
            srs.clear_int_status(ack);
        }
        if !done {
            return Err(SdError::Timeout);
        }
        if seen.intersects(IntStatus::ERRORS) {
            return Err(calc_int_to_clear(seen, AutoCmdControl2::empty()).0);
        }
        Ok(())
    }
}
