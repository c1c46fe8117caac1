//! eMMC command queuing engine.
//!
//! Up to 32 data tasks are described in a task descriptor list and handed to
//! the controller through a doorbell register; the controller schedules them
//! on the device and reports each completion through a notification bitmap.
//! Task 31 is reserved for direct commands (DCMD) when those are enabled.
//!
//! Tasks live in a fixed `[TaskSlot; 32]` arena indexed by the hardware task
//! ID. Each slot holds the request that owns it until completion, discard or
//! failure.
//!
//! Legacy commands can be issued only while the queue is halted or disabled.
//! The error path and discard operations halt the queue, run their legacy
//! commands (CMD48 task management) and resume it.

mod descriptor;
mod task;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use sdhc_core::{sd_debug, sd_err, sd_info, sd_warn};
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::DescriptorMemory;
use sdhc_mmio::wait_for;

pub use descriptor::{
    Descriptor, DescriptorFormat, MAX_SEGMENT, dcmd_descriptor, link_descriptor, nop_descriptor,
    task_descriptor, transfer_descriptor,
};
pub(crate) use task::{TaskRef, TaskSlot};
pub use task::{CqRequest, CqTaskParams, DcmdRequest, TaskState};

use crate::recovery::RecoveryContext;
use crate::regs::{
    COALESCING_ENABLE, COALESCING_RESET, COALESCING_THRESHOLD_WEN, COALESCING_TIMEOUT_WEN,
    CqConfig, CqControl, CqIntStatus, IntStatus, TaskErrorInfo,
};
use crate::request::{
    Command, DataBuffer, DataPhase, Request, RequestStatus, ResponseType,
};
use crate::slot::Slot;

/// Number of hardware tasks.
pub const CQ_TASKS: usize = 32;
/// Task ID reserved for direct commands.
pub const DCMD_TASK: u8 = 31;

/// EXT_CSD byte holding CMDQ_SUPPORT.
const EXT_CSD_CMDQ_SUPPORT: usize = 308;
/// EXT_CSD byte holding CMDQ_MODE_EN.
const EXT_CSD_CMDQ_MODE_EN: u32 = 15;
/// CMD6 access mode: write byte.
const SWITCH_WRITE_BYTE: u32 = 3;

/// CMD48 CMDQ_TASK_MGMT operation codes.
const TM_DISCARD_QUEUE: u32 = 1;
const TM_DISCARD_TASK: u32 = 2;

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

/// Interrupt coalescing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescingConfig {
    /// Coalescing on.
    pub enabled: bool,
    /// Completions collected before interrupting (0..=31).
    pub threshold: u8,
    /// Timeout in units of 1024 CQ clock periods (0..=127).
    pub timeout: u8,
}

impl CoalescingConfig {
    /// Coalescing off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: 0,
            timeout: 0,
        }
    }

    /// Coalescing on with the given threshold and timeout.
    #[must_use]
    pub const fn new(threshold: u8, timeout: u8) -> Self {
        Self {
            enabled: true,
            threshold,
            timeout,
        }
    }

    fn validate(self) -> Result<(), SdError> {
        if self.threshold > 31 || self.timeout > 127 {
            Err(SdError::InvalidParameter)
        } else {
            Ok(())
        }
    }

    /// Value for the coalescing register. Both write-enable bits are always
    /// set so the threshold and timeout are updated together.
    #[must_use]
    pub const fn register_value(self) -> u32 {
        let mut value = COALESCING_THRESHOLD_WEN | COALESCING_TIMEOUT_WEN;
        if self.enabled {
            value |= COALESCING_ENABLE
                | ((self.threshold as u32 & 0x1F) << 8)
                | (self.timeout as u32 & 0x7F);
        }
        value
    }
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

pub(crate) struct CqState {
    pub(crate) enabled: bool,
    pub(crate) halted: bool,
    /// The halt, recover, discard and resume sequence is running.
    pub(crate) recovering: bool,
    pub(crate) dcmd_enabled: bool,
    pub(crate) format: DescriptorFormat,
    pub(crate) tasks: [TaskSlot; CQ_TASKS],
    pub(crate) memory: Option<Box<dyn DescriptorMemory>>,
    pub(crate) coalescing: CoalescingConfig,
}

impl CqState {
    pub(crate) fn new() -> Self {
        Self {
            enabled: false,
            halted: false,
            recovering: false,
            dcmd_enabled: false,
            format: DescriptorFormat::Bits64,
            tasks: core::array::from_fn(|_| TaskSlot::default()),
            memory: None,
            coalescing: CoalescingConfig::disabled(),
        }
    }

    /// Enabled and not halted: the controller owns the bus.
    pub(crate) const fn is_running(&self) -> bool {
        self.enabled && !self.halted
    }

    fn is_reserved(&self, task: u8) -> bool {
        self.dcmd_enabled && task == DCMD_TASK
    }

    fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.state == TaskState::Pending)
    }

    fn write_descriptor(&mut self, offset: usize, desc: Descriptor) -> Result<(), SdError> {
        let format = self.format;
        let mem = self.memory.as_mut().ok_or(SdError::QueueDisabled)?;
        let bytes = mem.bytes_mut();
        let end = offset + format.size();
        if end > bytes.len() {
            return Err(SdError::InvalidParameter);
        }
        desc.write(&mut bytes[offset..end], format);
        Ok(())
    }
}

impl Slot {
    // -----------------------------------------------------------------------
    // Enable / disable
    // -----------------------------------------------------------------------

    /// Turns on command queuing in the device and the controller.
    pub(crate) fn cq_enable(&mut self) -> Result<(), SdError> {
        if self.cq.enabled {
            return Ok(());
        }
        if !self.cq_supported {
            return Err(SdError::Unsupported);
        }
        let device = self.device.ok_or(SdError::NotAttached)?;
        if !device.kind.is_emmc() {
            return Err(SdError::Unsupported);
        }
        let dma = self.dma.clone().ok_or(SdError::Unsupported)?;
        if self.current.is_some() {
            return Err(SdError::Busy);
        }

        let ext_csd = Arc::new(
            Request::new(Command::new(8, 0, ResponseType::R1))
                .with_data(DataPhase::read(512, 1), DataBuffer::Pio(vec![0; 512])),
        );
        self.run_request(&ext_csd)?;
        let ext_csd = ext_csd.take_data().ok_or(SdError::InvalidResponse)?;
        if ext_csd.get(EXT_CSD_CMDQ_SUPPORT).is_none_or(|b| b & 1 == 0) {
            sd_warn!("sdhc{}: device does not support command queuing", self.index);
            return Err(SdError::Unsupported);
        }
        self.switch_cmdq_mode(true)?;

        let format = if self.addressing_64 {
            DescriptorFormat::Bits128
        } else {
            DescriptorFormat::Bits64
        };
        let memory = dma.alloc_descriptors(CQ_TASKS * format.slot_size())?;
        let base = memory.phys_addr();
        if format == DescriptorFormat::Bits64 && base > u64::from(u32::MAX) {
            return Err(SdError::InvalidParameter);
        }

        let settings = self.cq_settings;
        self.cqrs.set_tdl_base_lo(base as u32);
        self.cqrs.set_tdl_base_hi((base >> 32) as u32);
        self.cqrs.set_send_status1(
            u32::from(settings.send_status_idle_timer)
                | (u32::from(settings.send_status_block_counter & 0xF) << 16),
        );
        self.cqrs.set_send_status2(u32::from(device.rca));

        let mut config = CqConfig::empty();
        if format == DescriptorFormat::Bits128 {
            config |= CqConfig::TASK_DESC_128;
        }
        if settings.dcmd_enabled {
            config |= CqConfig::DCMD_ENABLE;
        }
        self.cqrs.set_config(config);

        self.cqrs.set_int_status_enable(CqIntStatus::all());
        if self.interrupts_enabled {
            self.cqrs.set_int_signal_enable(CqIntStatus::all());
        }
        self.srs
            .set_int_status_enable(self.srs.int_status_enable() | IntStatus::CQ_INT);
        if self.interrupts_enabled {
            self.srs
                .set_int_signal_enable(self.srs.int_signal_enable() | IntStatus::CQ_INT);
        }
        self.cqrs.set_coalescing(settings.coalescing.register_value());

        self.cq = CqState {
            enabled: true,
            halted: false,
            recovering: false,
            dcmd_enabled: settings.dcmd_enabled,
            format,
            tasks: core::array::from_fn(|_| TaskSlot::default()),
            memory: Some(memory),
            coalescing: settings.coalescing,
        };
        self.io.barrier();
        self.cqrs.set_config(config | CqConfig::ENABLE);
        sd_info!(
            "sdhc{}: command queue enabled ({}-bit descriptors, DCMD {})",
            self.index,
            format.size() * 8,
            if settings.dcmd_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Turns command queuing off. Refused while any task is in flight.
    pub(crate) fn cq_disable(&mut self) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Ok(());
        }
        if self.cqrs.doorbell() != 0 || self.cq.has_pending() {
            return Err(SdError::Busy);
        }
        self.cqrs
            .set_config(self.cqrs.config().difference(CqConfig::ENABLE));
        self.srs
            .set_int_status_enable(self.srs.int_status_enable().difference(IntStatus::CQ_INT));
        self.srs
            .set_int_signal_enable(self.srs.int_signal_enable().difference(IntStatus::CQ_INT));
        self.cq = CqState::new();
        sd_info!("sdhc{}: command queue disabled", self.index);
        self.switch_cmdq_mode(false)
    }

    fn switch_cmdq_mode(&mut self, enable: bool) -> Result<(), SdError> {
        let arg = (SWITCH_WRITE_BYTE << 24) | (EXT_CSD_CMDQ_MODE_EN << 16) | (u32::from(enable) << 8);
        let switch = Arc::new(Request::new(Command::new(6, arg, ResponseType::R1b)));
        self.run_request(&switch)
    }

    // -----------------------------------------------------------------------
    // Attach / start
    // -----------------------------------------------------------------------

    fn check_task(&self, task: u8) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        if usize::from(task) >= CQ_TASKS || self.cq.is_reserved(task) {
            return Err(SdError::InvalidTask);
        }
        Ok(())
    }

    fn doorbell_set(&self, task: u8) -> bool {
        self.cqrs.doorbell() & (1 << task) != 0
    }

    /// Writes the descriptors for `req` into task `task` without ringing the
    /// doorbell.
    pub(crate) fn cq_attach(&mut self, task: u8, req: &Arc<CqRequest>) -> Result<(), SdError> {
        self.check_task(task)?;
        if self.doorbell_set(task) || self.cq.tasks[usize::from(task)].is_occupied() {
            return Err(SdError::Busy);
        }

        let params = req.params();
        let buffers = req.buffers();
        if params.block_count == 0 || buffers.is_empty() {
            return Err(SdError::InvalidParameter);
        }
        if buffers.iter().any(|b| b.len == 0 || b.len > MAX_SEGMENT) {
            return Err(SdError::InvalidParameter);
        }
        let total: u64 = buffers.iter().map(|b| u64::from(b.len)).sum();
        if total != params.byte_len() {
            return Err(SdError::InvalidParameter);
        }

        let format = self.cq.format;
        let offset = format.task_offset(task);
        let second = if let [only] = buffers {
            transfer_descriptor(only.addr, only.len, true, format)?
        } else {
            let mut array = req.descriptors.lock();
            let array = array.as_mut().ok_or(SdError::InvalidParameter)?;
            let needed = buffers.len() * format.size();
            if array.bytes().len() < needed {
                return Err(SdError::InvalidParameter);
            }
            let bytes = array.bytes_mut();
            for (i, seg) in buffers.iter().enumerate() {
                let last = i + 1 == buffers.len();
                let at = i * format.size();
                transfer_descriptor(seg.addr, seg.len, last, format)?
                    .write(&mut bytes[at..at + format.size()], format);
            }
            link_descriptor(array.phys_addr(), format)?
        };
        self.cq.write_descriptor(offset, task_descriptor(params))?;
        self.cq.write_descriptor(offset + format.size(), second)?;

        let slot = &mut self.cq.tasks[usize::from(task)];
        slot.state = TaskState::Attached;
        slot.request = Some(TaskRef::Data(req.clone()));
        sd_debug!("sdhc{}: task {} attached", self.index, task);
        Ok(())
    }

    /// Rings the doorbell for every attached task in `mask`.
    pub(crate) fn cq_start_tasks(&mut self, mask: u32) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        if mask == 0 {
            return Err(SdError::InvalidParameter);
        }
        let doorbell = self.cqrs.doorbell();
        for task in set_bits(mask) {
            if self.cq.is_reserved(task) {
                return Err(SdError::InvalidTask);
            }
            if doorbell & (1 << task) != 0 {
                return Err(SdError::Busy);
            }
            if self.cq.tasks[usize::from(task)].state != TaskState::Attached {
                return Err(SdError::NotAttached);
            }
        }
        for task in set_bits(mask) {
            let slot = &mut self.cq.tasks[usize::from(task)];
            slot.state = TaskState::Pending;
            if let Some(TaskRef::Data(req)) = &slot.request {
                req.set_pending();
            }
        }
        self.io.barrier();
        self.cqrs.set_doorbell(mask);
        Ok(())
    }

    /// Rings the doorbell for one attached task.
    pub(crate) fn cq_start_task(&mut self, task: u8) -> Result<(), SdError> {
        if usize::from(task) >= CQ_TASKS {
            return Err(SdError::InvalidTask);
        }
        self.cq_start_tasks(1 << task)
    }

    /// Sends `req` through the reserved direct-command task.
    pub(crate) fn cq_execute_dcmd(&mut self, req: &Arc<DcmdRequest>) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        if !self.cq.dcmd_enabled {
            return Err(SdError::Unsupported);
        }
        if self.doorbell_set(DCMD_TASK) || self.cq.tasks[usize::from(DCMD_TASK)].is_occupied() {
            return Err(SdError::Busy);
        }
        let format = self.cq.format;
        let offset = format.task_offset(DCMD_TASK);
        let desc = dcmd_descriptor(req.index(), req.argument(), req.response_type(), req.qbr());
        self.cq.write_descriptor(offset, desc)?;
        self.cq.write_descriptor(offset + format.size(), nop_descriptor())?;

        let slot = &mut self.cq.tasks[usize::from(DCMD_TASK)];
        slot.state = TaskState::Pending;
        slot.request = Some(TaskRef::Direct(req.clone()));
        req.set_pending();
        self.io.barrier();
        self.cqrs.set_doorbell(1 << DCMD_TASK);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Interrupts
    // -----------------------------------------------------------------------

    /// Handles a CQ interrupt, plus any slot error raised while the queue
    /// was active.
    pub(crate) fn cq_service(&mut self, status: IntStatus) {
        let cq_status = self.cqrs.int_status();
        if !cq_status.is_empty() {
            self.cqrs.clear_int_status(cq_status);
        }
        let slot_errors = status & (IntStatus::ERRORS | IntStatus::ERROR_INT);
        if cq_status.intersects(CqIntStatus::ERRORS) || slot_errors.intersects(IntStatus::ERRORS) {
            self.cq_error(slot_errors);
        }
        if cq_status.contains(CqIntStatus::TASK_COMPLETE) {
            self.cq_complete();
        }
    }

    fn cq_complete(&mut self) {
        let done = self.cqrs.completion();
        if done == 0 {
            return;
        }
        self.cqrs.clear_completion(done);
        for task in set_bits(done) {
            let slot = &mut self.cq.tasks[usize::from(task)];
            let Some(req) = slot.request.take() else {
                sd_warn!("sdhc{}: completion for idle task {}", self.index, task);
                continue;
            };
            slot.state = TaskState::Finished;
            match req {
                TaskRef::Data(req) => {
                    req.complete(RequestStatus::Finished);
                }
                TaskRef::Direct(req) => {
                    req.finish(self.cqrs.dcmd_response());
                }
            }
        }
        if self.cq.coalescing.enabled {
            self.cqrs
                .set_coalescing(self.cq.coalescing.register_value() | COALESCING_RESET);
        }
    }

    fn cq_error(&mut self, slot_errors: IntStatus) {
        if self.cq.recovering {
            return;
        }
        self.cq.recovering = true;
        self.cq_recover(slot_errors);
        self.cq.recovering = false;
    }

    /// Halts the queue, recovers the bus, drops the failed tasks and resumes.
    fn cq_recover(&mut self, slot_errors: IntStatus) {
        sd_err!(
            "sdhc{}: command queue error (slot status {:#010x})",
            self.index,
            slot_errors.bits()
        );
        if self.cq_halt(true).is_err() {
            self.cq_fail_all(RequestStatus::Failed(SdError::Io));
            return;
        }
        let (data_code, response_code) = if slot_errors.intersects(IntStatus::ERRORS) {
            let code = self.recover(slot_errors, RecoveryContext::queue());
            (code, code)
        } else {
            (SdError::Io, SdError::ResponseError)
        };

        let info = self.cqrs.task_error_info();
        if info.contains(TaskErrorInfo::DATA_VALID) {
            let task = info.data_task();
            if let Err(e) = self.send_task_mgmt(TM_DISCARD_TASK, task) {
                sd_warn!("sdhc{}: discard of task {} failed: {}", self.index, task, e);
            }
            if self.clear_task(task).is_err() {
                self.cq_fail_all(RequestStatus::Failed(SdError::Io));
                return;
            }
            self.cq_fail_task(task, RequestStatus::Failed(data_code));
        }
        if info.contains(TaskErrorInfo::RESPONSE_VALID) {
            let task = info.response_task();
            if self.clear_task(task).is_err() {
                self.cq_fail_all(RequestStatus::Failed(SdError::Io));
                return;
            }
            self.cq_fail_task(task, RequestStatus::Failed(response_code));
        }

        if self.cq_halt(false).is_err() {
            self.cq_fail_all(RequestStatus::Failed(SdError::Io));
        }
    }

    // -----------------------------------------------------------------------
    // Halt / discard / coalescing
    // -----------------------------------------------------------------------

    /// Halts (`true`) or resumes (`false`) the queue.
    pub(crate) fn cq_halt(&mut self, halt: bool) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        let budget = self.timeouts.cq_handshake();
        let control = self.cqrs.control();
        if halt {
            if self.cq.halted {
                return Ok(());
            }
            self.cqrs.set_control(control | CqControl::HALT);
            let cqrs = &self.cqrs;
            if !wait_for(&*self.io, budget, || {
                cqrs.int_status().contains(CqIntStatus::HALT_COMPLETE)
            }) {
                sd_err!("sdhc{}: command queue did not halt", self.index);
                return Err(SdError::Io);
            }
            self.cqrs.clear_int_status(CqIntStatus::HALT_COMPLETE);
            self.cq.halted = true;
        } else {
            self.cqrs.set_control(control.difference(CqControl::HALT));
            let cqrs = &self.cqrs;
            if !wait_for(&*self.io, budget, || !cqrs.control().contains(CqControl::HALT)) {
                sd_err!("sdhc{}: command queue did not resume", self.index);
                return Err(SdError::Io);
            }
            self.cq.halted = false;
        }
        Ok(())
    }

    /// Discards one task, optionally in the device as well.
    pub(crate) fn cq_discard_task(&mut self, task: u8, device: bool) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        if usize::from(task) >= CQ_TASKS {
            return Err(SdError::InvalidTask);
        }
        self.cq_halt(true)?;
        if device {
            if let Err(e) = self.send_task_mgmt(TM_DISCARD_TASK, task) {
                sd_warn!("sdhc{}: device discard of task {} failed: {}", self.index, task, e);
            }
        }
        let cleared = self.clear_task(task);
        self.cq_fail_task(task, RequestStatus::Failed(SdError::TaskDiscarded));
        let resumed = self.cq_halt(false);
        cleared.and(resumed)
    }

    /// Discards every task, optionally in the device as well.
    pub(crate) fn cq_discard_all(&mut self, device: bool) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        self.cq_halt(true)?;
        if device {
            if let Err(e) = self.send_task_mgmt(TM_DISCARD_QUEUE, 0) {
                sd_warn!("sdhc{}: device queue discard failed: {}", self.index, e);
            }
        }
        let control = self.cqrs.control();
        self.cqrs.set_control(control | CqControl::CLEAR_ALL);
        let cqrs = &self.cqrs;
        let cleared = wait_for(&*self.io, self.timeouts.cq_handshake(), || {
            !cqrs.control().contains(CqControl::CLEAR_ALL)
        });
        self.cq_fail_all(RequestStatus::Failed(SdError::TaskDiscarded));
        let resumed = self.cq_halt(false);
        if cleared { resumed } else { Err(SdError::Io) }
    }

    /// Programs interrupt coalescing.
    pub(crate) fn cq_set_int_coalescing(&mut self, config: CoalescingConfig) -> Result<(), SdError> {
        if !self.cq.enabled {
            return Err(SdError::QueueDisabled);
        }
        config.validate()?;
        self.cqrs.set_coalescing(config.register_value());
        self.cq.coalescing = config;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn send_task_mgmt(&mut self, op: u32, task: u8) -> Result<(), SdError> {
        let arg = (u32::from(task & 0x1F) << 16) | op;
        let cmd = Arc::new(Request::new(Command::new(48, arg, ResponseType::R1b)));
        self.run_request(&cmd)
    }

    fn clear_task(&mut self, task: u8) -> Result<(), SdError> {
        let bit = 1u32 << task;
        self.cqrs.set_task_clear(bit);
        let cqrs = &self.cqrs;
        if wait_for(&*self.io, self.timeouts.cq_handshake(), || {
            cqrs.task_clear() & bit == 0
        }) {
            Ok(())
        } else {
            sd_err!("sdhc{}: task {} did not clear", self.index, task);
            Err(SdError::Io)
        }
    }

    pub(crate) fn cq_fail_task(&mut self, task: u8, status: RequestStatus) {
        let slot = &mut self.cq.tasks[usize::from(task)];
        if let Some(req) = slot.request.take() {
            slot.state = TaskState::Failed;
            req.fail(status);
        }
    }

    pub(crate) fn cq_fail_all(&mut self, status: RequestStatus) {
        for task in 0..CQ_TASKS as u8 {
            self.cq_fail_task(task, status);
        }
    }
}

fn set_bits(mask: u32) -> impl Iterator<Item = u8> {
    (0..32u8).filter(move |bit| mask & (1 << bit) != 0)
}
