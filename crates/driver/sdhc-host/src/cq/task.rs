//! Command queue task requests and the per-task arena entry.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use sdhc_core::sync::SpinLock;
use sdhc_driver_api::capability::{DataDirection, DescriptorMemory, DmaSegment};

use crate::request::{RequestStatus, ResponseType};

/// Hardware task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Never used since the queue was enabled.
    #[default]
    Unused,
    /// Descriptors written, doorbell not rung.
    Attached,
    /// Doorbell rung.
    Pending,
    /// Completed.
    Finished,
    /// Failed or discarded.
    Failed,
}

/// Fields of a data task descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqTaskParams {
    /// Transfer direction.
    pub direction: DataDirection,
    /// Block address on the device.
    pub block_address: u32,
    /// Number of 512-byte blocks.
    pub block_count: u16,
    /// High priority task.
    pub priority: bool,
    /// Reliable write.
    pub reliable_write: bool,
    /// Forced programming.
    pub forced_programming: bool,
    /// Queue barrier.
    pub qbr: bool,
    /// Tag request.
    pub tag_request: bool,
    /// Context ID (0..=15).
    pub context_id: u8,
}

impl CqTaskParams {
    const fn new(direction: DataDirection, block_address: u32, block_count: u16) -> Self {
        Self {
            direction,
            block_address,
            block_count,
            priority: false,
            reliable_write: false,
            forced_programming: false,
            qbr: false,
            tag_request: false,
            context_id: 0,
        }
    }

    /// A plain read task.
    #[must_use]
    pub const fn read(block_address: u32, block_count: u16) -> Self {
        Self::new(DataDirection::Read, block_address, block_count)
    }

    /// A plain write task.
    #[must_use]
    pub const fn write(block_address: u32, block_count: u16) -> Self {
        Self::new(DataDirection::Write, block_address, block_count)
    }

    /// Bytes the task moves.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.block_count as u64 * 512
    }
}

// ---------------------------------------------------------------------------
// Data task
// ---------------------------------------------------------------------------

/// A queued data transfer.
///
/// A single buffer is described inline in the task list. Several buffers
/// need an external descriptor array, supplied with
/// [`with_descriptor_array`](Self::with_descriptor_array), which the task
/// list links to.
pub struct CqRequest {
    params: CqTaskParams,
    buffers: Vec<DmaSegment>,
    pub(crate) descriptors: SpinLock<Option<Box<dyn DescriptorMemory>>>,
    status: SpinLock<RequestStatus>,
}

impl CqRequest {
    /// A task over `buffers`.
    #[must_use]
    pub fn new(params: CqTaskParams, buffers: Vec<DmaSegment>) -> Self {
        Self {
            params,
            buffers,
            descriptors: SpinLock::new(None),
            status: SpinLock::new(RequestStatus::Idle),
        }
    }

    /// Supplies memory for the transfer descriptor array.
    #[must_use]
    pub fn with_descriptor_array(self, memory: Box<dyn DescriptorMemory>) -> Self {
        *self.descriptors.lock() = Some(memory);
        self
    }

    /// Task descriptor fields.
    #[must_use]
    pub const fn params(&self) -> &CqTaskParams {
        &self.params
    }

    /// Data buffers.
    #[must_use]
    pub fn buffers(&self) -> &[DmaSegment] {
        &self.buffers
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        *self.status.lock()
    }

    pub(crate) fn set_pending(&self) {
        *self.status.lock() = RequestStatus::Pending;
    }

    pub(crate) fn complete(&self, status: RequestStatus) -> bool {
        let mut st = self.status.lock();
        if st.is_terminal() {
            return false;
        }
        *st = status;
        true
    }
}

impl core::fmt::Debug for CqRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CqRequest")
            .field("params", &self.params)
            .field("buffers", &self.buffers)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Direct command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DcmdState {
    status: RequestStatus,
    response: u32,
}

/// A direct command sent through the reserved task.
#[derive(Debug)]
pub struct DcmdRequest {
    index: u8,
    argument: u32,
    response_type: ResponseType,
    qbr: bool,
    state: SpinLock<DcmdState>,
}

impl DcmdRequest {
    /// A direct command. Data commands cannot be sent this way.
    #[must_use]
    pub const fn new(index: u8, argument: u32, response_type: ResponseType) -> Self {
        Self {
            index,
            argument,
            response_type,
            qbr: false,
            state: SpinLock::new(DcmdState {
                status: RequestStatus::Idle,
                response: 0,
            }),
        }
    }

    /// Sets the queue barrier bit.
    #[must_use]
    pub const fn with_qbr(mut self, qbr: bool) -> Self {
        self.qbr = qbr;
        self
    }

    /// Command index.
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Argument.
    #[must_use]
    pub const fn argument(&self) -> u32 {
        self.argument
    }

    /// Expected response.
    #[must_use]
    pub const fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Queue barrier.
    #[must_use]
    pub const fn qbr(&self) -> bool {
        self.qbr
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    /// Response word captured on completion.
    #[must_use]
    pub fn response(&self) -> u32 {
        self.state.lock().response
    }

    pub(crate) fn set_pending(&self) {
        self.state.lock().status = RequestStatus::Pending;
    }

    pub(crate) fn finish(&self, response: u32) -> bool {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return false;
        }
        st.response = response;
        st.status = RequestStatus::Finished;
        true
    }

    pub(crate) fn complete(&self, status: RequestStatus) -> bool {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return false;
        }
        st.status = status;
        true
    }
}

// ---------------------------------------------------------------------------
// Arena entry
// ---------------------------------------------------------------------------

/// Request held by a task slot.
#[derive(Debug, Clone)]
pub(crate) enum TaskRef {
    Data(Arc<CqRequest>),
    Direct(Arc<DcmdRequest>),
}

impl TaskRef {
    pub(crate) fn fail(&self, status: RequestStatus) {
        match self {
            Self::Data(req) => {
                req.complete(status);
            }
            Self::Direct(req) => {
                req.complete(status);
            }
        }
    }
}

/// One of the 32 hardware task slots.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    pub(crate) state: TaskState,
    pub(crate) request: Option<TaskRef>,
}

impl TaskSlot {
    pub(crate) fn is_occupied(&self) -> bool {
        self.request.is_some()
    }
}
