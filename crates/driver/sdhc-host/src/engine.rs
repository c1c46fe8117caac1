//! Request execution engine.
//!
//! Each slot runs at most one request at a time. The engine programs the
//! command, then advances the request from dispatcher ticks:
//!
//! ```text
//!   issue ──► Pending ──CC──► response latched ──TC──► Finished
//!                │                 │
//!                │                 └─ BRR/BWR: one block through the data port
//!                └─ error bits ──► recovery ──► Failed(code)
//! ```
//!
//! Two requests may share the bus briefly: an abort command displaces the
//! current request, and a queuing sub-command without data may run as a
//! companion while the current request's data phase is active.

use alloc::sync::Arc;

use sdhc_core::{sd_debug, sd_trace, sd_warn};
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::{DataDirection, DmaMode, TransferContext};
use sdhc_driver_api::device::DeviceKind;
use sdhc_mmio::wait_for;

use crate::recovery::RecoveryContext;
use crate::regs::{ClockReset, CommandWord, HostControl1, IntStatus, PresentState};
use crate::request::{
    AutoCommand, Command, CommandKind, DataBuffer, DataPhase, Request, RequestStatus,
    ResponseType, Seen,
};
use crate::slot::Slot;

/// Largest block the controller's block size field accepts.
const MAX_BLOCK_SIZE: u32 = 2048;
/// Largest block count the 16-bit block count field accepts.
const MAX_BLOCK_COUNT: u32 = 0xFFFF;

/// R1 card status bits that signal an error.
const R1_ERRORS: u32 = 0xFDF8_0008;
/// Extra R1 error bit defined for eMMC (SWITCH_ERROR).
const R1_SWITCH_ERROR: u32 = 1 << 7;
/// R5 response flags that signal an error.
const R5_ERRORS: u32 = 0xCB00;
/// R6 status bits that signal an error.
const R6_ERRORS: u32 = 0xE000;

/// Which in-flight request an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Current,
    Companion,
}

/// Builds the transfer mode and command register image for `cmd`.
///
/// DMA enable is left to the caller, which knows how the buffer was mapped.
pub(crate) fn command_word(cmd: &Command, data: Option<&DataPhase>) -> CommandWord {
    let mut word = match cmd.response {
        ResponseType::None => CommandWord::empty(),
        ResponseType::R2 => CommandWord::RESPONSE_136,
        r if r.has_busy() => CommandWord::RESPONSE_48_BUSY,
        _ => CommandWord::RESPONSE_48,
    };
    if cmd.response.has_crc() {
        word |= CommandWord::CRC_CHECK;
    }
    if cmd.response.has_index() {
        word |= CommandWord::INDEX_CHECK;
    }
    word |= match cmd.kind {
        CommandKind::Suspend => CommandWord::TYPE_SUSPEND,
        CommandKind::Resume => CommandWord::TYPE_RESUME,
        CommandKind::Abort => CommandWord::TYPE_ABORT,
        CommandKind::Normal | CommandKind::QueueSubCommand => CommandWord::empty(),
    };
    if let Some(phase) = data {
        word |= CommandWord::DATA_PRESENT;
        if phase.direction == DataDirection::Read {
            word |= CommandWord::READ;
        }
        if phase.is_multi_block() {
            word |= CommandWord::MULTI_BLOCK;
            if !phase.infinite {
                word |= CommandWord::BLOCK_COUNT_ENABLE;
            }
        }
        word |= match phase.auto_cmd {
            AutoCommand::None => CommandWord::empty(),
            AutoCommand::Cmd12 => CommandWord::AUTO_CMD12,
            AutoCommand::Cmd23 => CommandWord::AUTO_CMD23,
        };
    }
    word.with_index(cmd.index)
}

/// Checks the latched response against the card's error bits.
fn response_ok(response: ResponseType, word: u32, kind: Option<DeviceKind>) -> bool {
    match response {
        ResponseType::R1 | ResponseType::R1b => {
            let mut mask = R1_ERRORS;
            if kind.is_some_and(DeviceKind::is_emmc) {
                mask |= R1_SWITCH_ERROR;
            }
            word & mask == 0
        }
        ResponseType::R5 | ResponseType::R5b => word & R5_ERRORS == 0,
        ResponseType::R6 => word & R6_ERRORS == 0,
        _ => true,
    }
}

fn validate(req: &Request) -> Result<(), SdError> {
    if req.command().index > 63 {
        return Err(SdError::InvalidParameter);
    }
    let Some(phase) = req.data() else {
        return Ok(());
    };
    if phase.block_size == 0 || phase.block_size > MAX_BLOCK_SIZE {
        return Err(SdError::InvalidParameter);
    }
    if !phase.infinite && (phase.block_count == 0 || phase.block_count > MAX_BLOCK_COUNT) {
        return Err(SdError::InvalidParameter);
    }
    let st = req.state.lock();
    match &st.buffer {
        Some(DataBuffer::Pio(buf)) if phase.infinite => {
            if buf.is_empty() {
                return Err(SdError::InvalidParameter);
            }
        }
        Some(DataBuffer::Pio(buf)) => {
            if (buf.len() as u64) < phase.byte_len() {
                return Err(SdError::InvalidParameter);
            }
        }
        Some(DataBuffer::Dma(_)) if phase.infinite => return Err(SdError::InvalidParameter),
        Some(buf @ DataBuffer::Dma(_)) => {
            if buf.capacity() < phase.byte_len() {
                return Err(SdError::InvalidParameter);
            }
        }
        None => return Err(SdError::InvalidParameter),
    }
    Ok(())
}

impl Slot {
    // -----------------------------------------------------------------------
    // Issue
    // -----------------------------------------------------------------------

    /// Starts `req` on this slot.
    pub(crate) fn issue(&mut self, req: &Arc<Request>) -> Result<(), SdError> {
        if !self.card_present {
            return Err(SdError::NoCard);
        }
        if self.cq.is_running() {
            return Err(SdError::Busy);
        }
        if req.status() != RequestStatus::Idle {
            return Err(SdError::InvalidParameter);
        }
        validate(req)?;

        if self.current.is_some() {
            return self.issue_alongside(req);
        }

        self.retune_if_needed(req)?;
        if let Some(prelude) = req.prelude() {
            if prelude.status() != RequestStatus::Idle || prelude.prelude().is_some() {
                return Err(SdError::InvalidParameter);
            }
            validate(prelude)?;
            self.start_request(prelude.clone())?;
            self.deferred = Some(req.clone());
            return Ok(());
        }
        self.start_request(req.clone())
    }

    /// Handles an issue while another request is in flight.
    fn issue_alongside(&mut self, req: &Arc<Request>) -> Result<(), SdError> {
        match req.command().kind {
            CommandKind::Abort => {
                self.displace_for_abort();
                let issued = self.start_request(req.clone());
                if let Err(e) = issued {
                    sd_warn!("sdhc{}: abort command not issued: {}", self.index, e);
                    self.finish_abort();
                }
                issued
            }
            CommandKind::QueueSubCommand
                if req.data().is_none()
                    && self.companion.is_none()
                    && self
                        .srs
                        .present_state()
                        .contains(PresentState::DAT_LINE_ACTIVE) =>
            {
                self.program(req)?;
                self.companion = Some(req.clone());
                Ok(())
            }
            _ => Err(SdError::Busy),
        }
    }

    /// Moves the current request aside so an abort command can take the bus.
    fn displace_for_abort(&mut self) {
        if let Some(victim) = self.current.take() {
            if !victim.is_abort() {
                self.aborted = Some(victim);
            }
        }
    }

    pub(crate) fn start_request(&mut self, req: Arc<Request>) -> Result<(), SdError> {
        self.program(&req)?;
        self.current = Some(req);
        Ok(())
    }

    /// Writes the registers for `req` and marks it pending. The command
    /// register is written last; that write starts the command.
    fn program(&self, req: &Request) -> Result<(), SdError> {
        let cmd = req.command();
        let sidecar = matches!(cmd.kind, CommandKind::Abort | CommandKind::QueueSubCommand);
        let mut inhibit = PresentState::CMD_INHIBIT;
        if !sidecar && (req.data().is_some() || cmd.response.has_busy()) {
            inhibit |= PresentState::DAT_INHIBIT;
        }
        let srs = &self.srs;
        if !wait_for(&*self.io, self.timeouts.line_idle(), || {
            !srs.present_state().intersects(inhibit)
        }) {
            sd_warn!("sdhc{}: lines busy, CMD{} not issued", self.index, cmd.index);
            return Err(SdError::Timeout);
        }

        let mut word = command_word(cmd, req.data());
        if let Some(phase) = req.data() {
            let count = if phase.infinite { 0 } else { phase.block_count.min(MAX_BLOCK_COUNT) };
            srs.set_block(phase.block_size | (count << 16));
            if phase.auto_cmd == AutoCommand::Cmd23 {
                srs.set_sdma_address(phase.block_count);
            }
            if self.arm_dma(req, phase)? {
                word |= CommandWord::DMA_ENABLE;
            }
        }

        srs.set_argument(cmd.argument);
        self.io.barrier();
        req.arm();
        sd_trace!(
            "sdhc{}: CMD{} arg {:#010x} word {:#010x}",
            self.index,
            cmd.index,
            cmd.argument,
            word.bits()
        );
        srs.set_command(word);
        Ok(())
    }

    /// Maps a DMA-backed buffer and programs the system address. Returns
    /// `false` for PIO buffers.
    fn arm_dma(&self, req: &Request, phase: &DataPhase) -> Result<bool, SdError> {
        let mut st = req.state.lock();
        let segments = match &st.buffer {
            Some(DataBuffer::Dma(segments)) => segments.clone(),
            _ => return Ok(false),
        };
        let dma = self.dma.as_ref().ok_or(SdError::Unsupported)?;
        let mut ctx = TransferContext {
            slot: self.index,
            direction: phase.direction,
            block_size: phase.block_size,
            block_count: phase.block_count,
            segments,
            addressing_64: self.addressing_64,
            next_system_address: None,
        };
        let setup = dma.prepare_transfer(&mut ctx)?;
        if !self.addressing_64 && setup.system_address > u64::from(u32::MAX) {
            return Err(SdError::InvalidParameter);
        }
        let control = self.srs.host_control1().difference(HostControl1::DMA_SELECT);
        match setup.mode {
            DmaMode::Sdma => {
                if phase.auto_cmd == AutoCommand::Cmd23 {
                    // Argument 2 and the SDMA address share a register.
                    return Err(SdError::InvalidParameter);
                }
                self.srs.set_host_control1(control);
                self.srs.set_sdma_address(setup.system_address as u32);
            }
            DmaMode::Adma2 => {
                self.srs.set_host_control1(control | HostControl1::DMA_ADMA2);
                self.srs.set_adma_address_lo(setup.system_address as u32);
                self.srs
                    .set_adma_address_hi((setup.system_address >> 32) as u32);
            }
        }
        st.dma = Some(ctx);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn role(&self, role: Role) -> Option<&Arc<Request>> {
        match role {
            Role::Current => self.current.as_ref(),
            Role::Companion => self.companion.as_ref(),
        }
    }

    /// Advances the in-flight requests from one status snapshot.
    pub(crate) fn service_request(&mut self, status: IntStatus) {
        if status.intersects(IntStatus::ERRORS) {
            let (auto_cmd, issue_abort) = match &self.current {
                Some(req) => (
                    req.data().map_or(AutoCommand::None, |d| d.auto_cmd),
                    !req.is_abort(),
                ),
                None => (AutoCommand::None, false),
            };
            let code = self.recover(status, RecoveryContext::request(auto_cmd, issue_abort));
            self.retire(Role::Companion, RequestStatus::Failed(code));
            self.retire(Role::Current, RequestStatus::Failed(code));
            return;
        }

        if status.contains(IntStatus::CMD_COMPLETE) {
            let to_companion = self.companion.is_some()
                && self
                    .current
                    .as_ref()
                    .is_none_or(|c| c.state.lock().seen.contains(Seen::COMMAND));
            self.command_complete(if to_companion { Role::Companion } else { Role::Current });
        }

        if status.intersects(IntStatus::BUF_READ_READY | IntStatus::BUF_WRITE_READY) {
            self.pump();
        }

        if status.contains(IntStatus::DMA_INT) {
            self.dma_interrupt(status);
        }

        if status.intersects(IntStatus::XFER_COMPLETE | IntStatus::BLOCK_GAP) {
            let abort_pending = self.abort_requested
                && self.current.as_ref().is_some_and(|c| !c.is_abort());
            if abort_pending {
                self.start_async_abort();
                return;
            }
            if status.contains(IntStatus::XFER_COMPLETE) {
                if let Some(req) = &self.current {
                    req.state.lock().seen |= Seen::TRANSFER;
                }
                self.finish_if_done(Role::Current);
            }
        }
    }

    fn command_complete(&mut self, role: Role) {
        let Some(req) = self.role(role).cloned() else {
            return;
        };
        let cmd = *req.command();
        let response = self.read_response(cmd.response);
        {
            let mut st = req.state.lock();
            st.response = response;
            st.seen |= Seen::COMMAND;
        }
        if !req.is_abort() && !response_ok(cmd.response, response[0], self.device.map(|d| d.kind)) {
            sd_warn!(
                "sdhc{}: CMD{} response {:#010x} reports an error",
                self.index,
                cmd.index,
                response[0]
            );
            let _ = self.reset_lines(ClockReset::RESET_CMD | ClockReset::RESET_DAT);
            self.retire(role, RequestStatus::Failed(SdError::InvalidResponse));
            return;
        }
        self.finish_if_done(role);
    }

    fn read_response(&self, response: ResponseType) -> [u32; 4] {
        let raw = [
            self.srs.response0(),
            self.srs.response1(),
            self.srs.response2(),
            self.srs.response3(),
        ];
        if !response.is_long() {
            return [raw[0], 0, 0, 0];
        }
        // The controller drops the CRC byte; shift it back so word 0 holds
        // bits 127:96 of the response.
        let mut out = [0u32; 4];
        for (i, word) in out.iter_mut().enumerate() {
            *word = raw[3 - i] << 8;
            if i < 3 {
                *word |= raw[2 - i] >> 24;
            }
        }
        out
    }

    fn finish_if_done(&mut self, role: Role) {
        let done = self.role(role).is_some_and(|req| {
            let seen = req.state.lock().seen;
            match req.data() {
                Some(phase) if phase.infinite => false,
                _ if req.needs_transfer_complete() => seen.contains(Seen::COMMAND | Seen::TRANSFER),
                _ => seen.contains(Seen::COMMAND),
            }
        });
        if done {
            self.retire(role, RequestStatus::Finished);
        }
    }

    /// Moves one block between the data port and the PIO buffer.
    fn pump(&mut self) {
        let Some(req) = self.current.clone() else {
            return;
        };
        let Some(phase) = req.data().copied() else {
            return;
        };
        let exhausted = {
            let mut st = req.state.lock();
            if st.remaining == 0 {
                return;
            }
            let chunk = u64::from(phase.block_size).min(st.remaining) as usize;
            let start = st.cursor;
            let Some(DataBuffer::Pio(buf)) = st.buffer.as_mut() else {
                return;
            };
            let end = (start + chunk).min(buf.len());
            let block = &mut buf[start..end];
            match phase.direction {
                DataDirection::Read => {
                    for word in block.chunks_mut(4) {
                        let bytes = self.srs.data_port().to_le_bytes();
                        word.copy_from_slice(&bytes[..word.len()]);
                    }
                }
                DataDirection::Write => {
                    for word in block.chunks(4) {
                        let mut bytes = [0u8; 4];
                        bytes[..word.len()].copy_from_slice(word);
                        self.srs.set_data_port(u32::from_le_bytes(bytes));
                    }
                }
            }
            st.cursor = end;
            st.remaining -= chunk as u64;
            phase.infinite && st.remaining == 0
        };
        if exhausted {
            self.retire(Role::Current, RequestStatus::Finished);
        }
    }

    fn dma_interrupt(&mut self, status: IntStatus) {
        let (Some(req), Some(dma)) = (self.current.clone(), self.dma.clone()) else {
            return;
        };
        let mut st = req.state.lock();
        let Some(ctx) = st.dma.as_mut() else {
            return;
        };
        if !dma.handle_interrupt(ctx, status.bits()) {
            sd_debug!("sdhc{}: DMA interrupt not consumed", self.index);
        }
        if let Some(next) = ctx.next_system_address.take() {
            self.srs.set_sdma_address(next as u32);
        }
    }

    // -----------------------------------------------------------------------
    // Retirement
    // -----------------------------------------------------------------------

    /// Drops the slot's reference to the request in `role` and latches
    /// `status`.
    pub(crate) fn retire(&mut self, role: Role, status: RequestStatus) {
        let req = match role {
            Role::Current => self.current.take(),
            Role::Companion => self.companion.take(),
        };
        let Some(req) = req else {
            return;
        };
        if !req.complete(status) {
            return;
        }
        self.on_retired(&req, status);
    }

    fn on_retired(&mut self, req: &Arc<Request>, status: RequestStatus) {
        if status == RequestStatus::Finished {
            if let Some(phase) = req.data() {
                let moved = if phase.infinite {
                    req.state.lock().cursor as u64
                } else {
                    phase.byte_len()
                };
                self.tuning.account(moved);
            }
        }
        if req.is_abort() {
            self.finish_abort();
        }
        self.resolve_deferred(req, status);
    }

    /// Starts or fails the request waiting on `prelude`.
    fn resolve_deferred(&mut self, prelude: &Arc<Request>, status: RequestStatus) {
        let waiting = self
            .deferred
            .as_ref()
            .is_some_and(|main| main.prelude().is_some_and(|p| Arc::ptr_eq(p, prelude)));
        if !waiting {
            return;
        }
        let Some(main) = self.deferred.take() else {
            return;
        };
        if status == RequestStatus::Finished {
            if let Err(e) = self.start_request(main.clone()) {
                main.complete(RequestStatus::Failed(e));
            }
        } else {
            main.complete(status);
        }
    }

    /// Completes an abort: resets both lines and marks the displaced
    /// request aborted.
    fn finish_abort(&mut self) {
        let _ = self.reset_lines(ClockReset::RESET_CMD | ClockReset::RESET_DAT);
        let control = self.srs.host_control1();
        if control.contains(HostControl1::STOP_AT_BLOCK_GAP) {
            self.srs
                .set_host_control1(control.difference(HostControl1::STOP_AT_BLOCK_GAP));
        }
        self.abort_requested = false;
        if let Some(victim) = self.aborted.take() {
            if victim.complete(RequestStatus::Aborted) {
                sd_debug!("sdhc{}: CMD{} aborted", self.index, victim.command().index);
            }
            self.resolve_deferred(&victim, RequestStatus::Aborted);
        }
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    /// Aborts the current request.
    ///
    /// A synchronous abort sends CMD12 and waits for it. Otherwise the abort
    /// is only requested and starts at the next transfer-complete or
    /// block-gap event.
    pub(crate) fn abort(&mut self, synchronous: bool) -> Result<(), SdError> {
        if self.current.is_none() {
            return Ok(());
        }
        self.abort_requested = true;
        if !synchronous {
            return Ok(());
        }
        let abort = Arc::new(Request::new(Command::stop_transmission()));
        self.displace_for_abort();
        if let Err(e) = self.start_request(abort.clone()) {
            sd_warn!("sdhc{}: abort command not issued: {}", self.index, e);
            self.finish_abort();
            return Ok(());
        }
        if !self.wait_internal(&abort) {
            sd_warn!("sdhc{}: abort command timed out", self.index);
            self.retire(Role::Current, RequestStatus::Failed(SdError::Timeout));
        }
        Ok(())
    }

    fn start_async_abort(&mut self) {
        let control = self.srs.host_control1();
        self.srs
            .set_host_control1(control | HostControl1::STOP_AT_BLOCK_GAP);
        let abort = Arc::new(Request::new(Command::stop_transmission()));
        self.displace_for_abort();
        if let Err(e) = self.start_request(abort) {
            sd_warn!("sdhc{}: abort command not issued: {}", self.index, e);
            self.finish_abort();
        }
    }

    /// Gives up on `req` after a blocking wait ran out of budget.
    pub(crate) fn expire(&mut self, req: &Arc<Request>) {
        let is = |slot: &Option<Arc<Request>>| slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, req));
        if is(&self.current) {
            if req.is_abort() {
                self.retire(Role::Current, RequestStatus::Failed(SdError::Timeout));
                return;
            }
            self.current = None;
            req.complete(RequestStatus::Failed(SdError::Timeout));
            self.resolve_deferred(req, RequestStatus::Failed(SdError::Timeout));
            self.aborted = Some(req.clone());
            if let Err(e) = self.start_request(Arc::new(Request::new(Command::stop_transmission())))
            {
                sd_warn!("sdhc{}: abort after timeout not issued: {}", self.index, e);
                self.finish_abort();
            }
        } else if is(&self.companion) {
            self.retire(Role::Companion, RequestStatus::Failed(SdError::Timeout));
        } else if is(&self.deferred) {
            self.deferred = None;
            req.complete(RequestStatus::Failed(SdError::Timeout));
        } else {
            req.complete(RequestStatus::Failed(SdError::Timeout));
        }
    }

    // -----------------------------------------------------------------------
    // Internal waits
    // -----------------------------------------------------------------------

    /// Polls the dispatcher until `req` is terminal. Used by operations that
    /// already own the slot (sync abort, tuning, queue management).
    pub(crate) fn wait_internal(&mut self, req: &Arc<Request>) -> bool {
        let io = self.io.clone();
        let budget = self.timeouts.request();
        wait_for(&*io, budget, || {
            if !req.status().is_terminal() {
                self.dispatch(None);
            }
            req.status().is_terminal()
        })
    }

    /// Runs `req` to completion from inside the driver.
    pub(crate) fn run_request(&mut self, req: &Arc<Request>) -> Result<(), SdError> {
        if self.current.is_some() {
            return Err(SdError::Busy);
        }
        validate(req)?;
        self.start_request(req.clone())?;
        if !self.wait_internal(req) {
            self.expire(req);
            return Err(SdError::Timeout);
        }
        match req.status() {
            RequestStatus::Finished => Ok(()),
            RequestStatus::Failed(e) => Err(e),
            RequestStatus::Aborted | RequestStatus::Idle | RequestStatus::Pending => {
                Err(SdError::Undefined)
            }
        }
    }

    /// Fails every legacy request the slot holds.
    pub(crate) fn fail_all_requests(&mut self, status: RequestStatus) {
        self.retire(Role::Companion, status);
        self.retire(Role::Current, status);
        for slot in [&mut self.deferred, &mut self.aborted] {
            if let Some(req) = slot.take() {
                req.complete(status);
            }
        }
        self.abort_requested = false;
    }
}
