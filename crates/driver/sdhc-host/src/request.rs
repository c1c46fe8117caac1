//! Requests: one command with an optional data phase.
//!
//! A [`Request`] is built by the caller, shared as `Arc<Request>` and handed
//! to [`Host::issue_command`](crate::Host::issue_command). The slot keeps a
//! clone while the request is in flight; the caller watches
//! [`Request::status`] (or blocks in [`check_busy`](crate::check_busy)) and
//! collects the response and read data afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use sdhc_core::sync::SpinLock;
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::{DataDirection, DmaSegment, TransferContext};

// ---------------------------------------------------------------------------
// Command description
// ---------------------------------------------------------------------------

/// Expected response format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// No response.
    None,
    /// Normal response (card status).
    R1,
    /// R1 with busy signalled on DAT0.
    R1b,
    /// 136-bit CID/CSD.
    R2,
    /// OCR, no CRC.
    R3,
    /// SDIO OCR, no CRC.
    R4,
    /// SDIO IO_RW_DIRECT response.
    R5,
    /// R5 with busy.
    R5b,
    /// Published RCA.
    R6,
    /// Card interface condition.
    R7,
}

impl ResponseType {
    /// Response occupies 136 bits.
    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Self::R2)
    }

    /// Card holds DAT0 low until the operation finishes.
    #[must_use]
    pub const fn has_busy(self) -> bool {
        matches!(self, Self::R1b | Self::R5b)
    }

    /// Response carries a CRC the controller can check.
    #[must_use]
    pub const fn has_crc(self) -> bool {
        !matches!(self, Self::None | Self::R3 | Self::R4)
    }

    /// Response echoes the command index.
    #[must_use]
    pub const fn has_index(self) -> bool {
        !matches!(self, Self::None | Self::R2 | Self::R3 | Self::R4)
    }
}

/// How the controller should treat the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Ordinary command.
    Normal,
    /// SDIO suspend.
    Suspend,
    /// SDIO resume.
    Resume,
    /// Abort (CMD12, or CMD52 writing the I/O abort register). Allowed while
    /// another request is outstanding; it displaces that request.
    Abort,
    /// Queuing-protocol sub-command without data. Allowed while another
    /// request's data phase is active.
    QueueSubCommand,
}

/// Automatic command the controller sends around a multi-block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCommand {
    /// None.
    None,
    /// CMD12 after the last block.
    Cmd12,
    /// CMD23 before the data command; the block count goes in argument 2.
    Cmd23,
}

/// Command index, argument and response expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command index (0..=63).
    pub index: u8,
    /// 32-bit argument.
    pub argument: u32,
    /// Expected response.
    pub response: ResponseType,
    /// Command type.
    pub kind: CommandKind,
}

impl Command {
    /// A normal command.
    #[must_use]
    pub const fn new(index: u8, argument: u32, response: ResponseType) -> Self {
        Self {
            index,
            argument,
            response,
            kind: CommandKind::Normal,
        }
    }

    /// Changes the command type.
    #[must_use]
    pub const fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    /// CMD12 STOP_TRANSMISSION as an abort command.
    #[must_use]
    pub const fn stop_transmission() -> Self {
        Self::new(12, 0, ResponseType::R1b).with_kind(CommandKind::Abort)
    }
}

/// Shape of a data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPhase {
    /// Direction.
    pub direction: DataDirection,
    /// Block length in bytes (1..=2048).
    pub block_size: u32,
    /// Number of blocks. Ignored for infinite transfers.
    pub block_count: u32,
    /// Open-ended transfer that stops when the buffer is exhausted or on
    /// abort.
    pub infinite: bool,
    /// Automatic command.
    pub auto_cmd: AutoCommand,
}

impl DataPhase {
    /// A read of `block_count` blocks.
    #[must_use]
    pub const fn read(block_size: u32, block_count: u32) -> Self {
        Self {
            direction: DataDirection::Read,
            block_size,
            block_count,
            infinite: false,
            auto_cmd: AutoCommand::None,
        }
    }

    /// A write of `block_count` blocks.
    #[must_use]
    pub const fn write(block_size: u32, block_count: u32) -> Self {
        Self {
            direction: DataDirection::Write,
            block_size,
            block_count,
            infinite: false,
            auto_cmd: AutoCommand::None,
        }
    }

    /// Sets the automatic command.
    #[must_use]
    pub const fn with_auto_cmd(mut self, auto_cmd: AutoCommand) -> Self {
        self.auto_cmd = auto_cmd;
        self
    }

    /// Marks the transfer as open-ended.
    #[must_use]
    pub const fn infinite(mut self) -> Self {
        self.infinite = true;
        self
    }

    /// Transfer spans more than one block.
    #[must_use]
    pub const fn is_multi_block(&self) -> bool {
        self.infinite || self.block_count > 1
    }

    /// Bytes described by block size and count.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.block_size as u64 * self.block_count as u64
    }
}

/// Where the data phase lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataBuffer {
    /// CPU buffer moved through the data port.
    Pio(Vec<u8>),
    /// Scatter list handed to the DMA capability.
    Dma(Vec<DmaSegment>),
}

impl DataBuffer {
    /// Bytes the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        match self {
            Self::Pio(buf) => buf.len() as u64,
            Self::Dma(segs) => segs.iter().map(|s| u64::from(s.len)).sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Built but not issued.
    Idle,
    /// Issued, waiting for completion.
    Pending,
    /// Completed successfully.
    Finished,
    /// Stopped by an abort.
    Aborted,
    /// Failed with the given code.
    Failed(SdError),
}

impl RequestStatus {
    /// Returns `true` once the request can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted | Self::Failed(_))
    }
}

bitflags! {
    /// Completion events seen so far.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Seen: u8 {
        const COMMAND = 1 << 0;
        const TRANSFER = 1 << 1;
    }
}

pub(crate) struct RequestState {
    pub(crate) status: RequestStatus,
    pub(crate) response: [u32; 4],
    pub(crate) seen: Seen,
    pub(crate) buffer: Option<DataBuffer>,
    pub(crate) cursor: usize,
    pub(crate) remaining: u64,
    pub(crate) dma: Option<TransferContext>,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One command, optionally with data and a prelude sub-command.
pub struct Request {
    command: Command,
    data: Option<DataPhase>,
    prelude: Option<Arc<Request>>,
    pub(crate) state: SpinLock<RequestState>,
}

impl Request {
    /// A request without a data phase.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            data: None,
            prelude: None,
            state: SpinLock::new(RequestState {
                status: RequestStatus::Idle,
                response: [0; 4],
                seen: Seen::empty(),
                buffer: None,
                cursor: 0,
                remaining: 0,
                dma: None,
            }),
        }
    }

    /// Attaches a data phase and its buffer.
    #[must_use]
    pub fn with_data(mut self, phase: DataPhase, buffer: DataBuffer) -> Self {
        self.data = Some(phase);
        self.state.get_mut().buffer = Some(buffer);
        self
    }

    /// Attaches a sub-command that must finish before this request is
    /// issued (for example CMD23 ahead of a multi-block transfer).
    #[must_use]
    pub fn with_prelude(mut self, prelude: Request) -> Self {
        self.prelude = Some(Arc::new(prelude));
        self
    }

    /// The command.
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// The data phase, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&DataPhase> {
        self.data.as_ref()
    }

    /// The prelude sub-command, if any.
    #[must_use]
    pub fn prelude(&self) -> Option<&Arc<Request>> {
        self.prelude.as_ref()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    /// Latched response. For R2 the words are most significant first, with
    /// the CRC byte stripped.
    #[must_use]
    pub fn response(&self) -> [u32; 4] {
        self.state.lock().response
    }

    /// Takes the PIO buffer back, typically after a read finished.
    pub fn take_data(&self) -> Option<Vec<u8>> {
        match self.state.lock().buffer.take() {
            Some(DataBuffer::Pio(buf)) => Some(buf),
            _ => None,
        }
    }

    /// Returns `true` if this is an abort command.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self.command.kind, CommandKind::Abort)
    }

    /// Needs a transfer-complete event in addition to command complete.
    pub(crate) fn needs_transfer_complete(&self) -> bool {
        match self.data {
            Some(phase) => !phase.infinite,
            None => self.command.response.has_busy(),
        }
    }

    /// Moves the request to `Pending` and resets per-execution state.
    pub(crate) fn arm(&self) {
        let mut st = self.state.lock();
        st.status = RequestStatus::Pending;
        st.seen = Seen::empty();
        st.cursor = 0;
        st.remaining = match (&self.data, &st.buffer) {
            (Some(phase), Some(buf)) if phase.infinite => buf.capacity(),
            (Some(phase), _) => phase.byte_len(),
            (None, _) => 0,
        };
    }

    /// Latches a terminal status. Has no effect once the request is terminal.
    ///
    /// Returns `true` if the status changed.
    pub(crate) fn complete(&self, status: RequestStatus) -> bool {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return false;
        }
        st.status = status;
        true
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("data", &self.data)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
