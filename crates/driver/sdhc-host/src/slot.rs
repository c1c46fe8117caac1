//! Per-slot state and the interrupt dispatcher.

use alloc::sync::Arc;

use sdhc_core::{sd_debug, sd_err, sd_info, sd_warn};
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::{DmaCapability, SlotHooks};
use sdhc_driver_api::device::{AccessMode, BusWidth, DeviceContext};
use sdhc_mmio::{IoHandle, wait_for};

use crate::config::{CqSettings, HostConfig, Timeouts};
use crate::cq::{CQ_TASKS, CqState, TaskState};
use crate::recovery::RecoveryContext;
use crate::regs::{
    AutoCmdControl2, CQ_BANK_OFFSET, ClockReset, CqIntStatus, CqRegs, IntStatus, PresentState,
    SlotRegs, slot_base,
};
use crate::request::{Request, RequestStatus};
use crate::tuning::TuningState;

/// Data timeout counter value programmed at reset (TMCLK x 2^27).
const DATA_TIMEOUT_COUNTER: u32 = 0xE << 16;

/// One card slot of the controller.
///
/// Holds the slot's register banks, the in-flight legacy requests, tuning
/// bookkeeping and the command queue. All methods that change state take
/// `&mut self`; the [`Host`](crate::Host) is the only owner.
pub struct Slot {
    pub(crate) index: u8,
    pub(crate) io: IoHandle,
    pub(crate) srs: SlotRegs,
    pub(crate) cqrs: CqRegs,
    pub(crate) timeouts: Timeouts,
    pub(crate) dma: Option<Arc<dyn DmaCapability>>,
    pub(crate) hooks: SlotHooks,
    pub(crate) device: Option<DeviceContext>,
    pub(crate) card_present: bool,
    pub(crate) bus_width: BusWidth,
    pub(crate) access_mode: AccessMode,
    pub(crate) addressing_64: bool,
    pub(crate) interrupts_enabled: bool,

    /// Request that owns the bus.
    pub(crate) current: Option<Arc<Request>>,
    /// Queuing sub-command running alongside `current`.
    pub(crate) companion: Option<Arc<Request>>,
    /// Main request waiting for its prelude.
    pub(crate) deferred: Option<Arc<Request>>,
    /// Request displaced by an abort command.
    pub(crate) aborted: Option<Arc<Request>>,
    pub(crate) abort_requested: bool,
    pub(crate) recovering: bool,
    /// Card interrupts are enabled. Cleared while the card driver services
    /// one, until [`Host::ack_card_interrupt`](crate::Host::ack_card_interrupt).
    pub(crate) card_int_armed: bool,

    pub(crate) tuning: TuningState,
    pub(crate) cq: CqState,
    pub(crate) cq_settings: CqSettings,
    pub(crate) cq_supported: bool,
}

impl Slot {
    pub(crate) fn new(
        index: u8,
        io: IoHandle,
        config: &HostConfig,
        dma: Option<Arc<dyn DmaCapability>>,
        cq_supported: bool,
    ) -> Self {
        let base = slot_base(index);
        Self {
            index,
            srs: SlotRegs::new(io.clone(), base),
            cqrs: CqRegs::new(io.clone(), base + CQ_BANK_OFFSET),
            io,
            timeouts: config.timeouts,
            dma,
            hooks: SlotHooks::none(),
            device: None,
            card_present: false,
            bus_width: BusWidth::One,
            access_mode: AccessMode::DefaultSpeed,
            addressing_64: config.addressing_64,
            interrupts_enabled: config.interrupts_enabled,
            current: None,
            companion: None,
            deferred: None,
            aborted: None,
            abort_requested: false,
            recovering: false,
            card_int_armed: true,
            tuning: TuningState::new(config.retune_byte_threshold),
            cq: CqState::new(),
            cq_settings: config.cq,
            cq_supported,
        }
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Resets the slot's controller state and fails everything in flight.
    pub(crate) fn reset(&mut self) -> Result<(), SdError> {
        self.fail_all_requests(RequestStatus::Aborted);
        self.cq_fail_all(RequestStatus::Aborted);
        self.cq = CqState::new();

        self.srs.set_clock_reset(ClockReset::RESET_ALL);
        let srs = &self.srs;
        if !wait_for(&*self.io, self.timeouts.reset(), || {
            !srs.clock_reset().contains(ClockReset::RESET_ALL)
        }) {
            sd_err!("sdhc{}: software reset did not complete", self.index);
            return Err(SdError::Timeout);
        }

        let clock = self.srs.clock_reset().difference(ClockReset::TIMEOUT_FIELD);
        self.srs
            .set_clock_reset(clock | ClockReset::from_bits_retain(DATA_TIMEOUT_COUNTER));
        if self.addressing_64 {
            let control = self.srs.auto_cmd_control2();
            self.srs.set_auto_cmd_control2(
                control | AutoCmdControl2::HOST_V4 | AutoCmdControl2::ADDRESSING_64,
            );
        }
        self.card_int_armed = true;
        self.srs.clear_int_status(IntStatus::all());
        self.srs.set_int_status_enable(IntStatus::DEFAULT_ENABLE);
        self.srs.set_int_signal_enable(if self.interrupts_enabled {
            IntStatus::DEFAULT_ENABLE
        } else {
            IntStatus::empty()
        });

        self.device = None;
        self.hooks = SlotHooks::none();
        self.bus_width = BusWidth::One;
        self.access_mode = AccessMode::DefaultSpeed;
        self.tuning = TuningState::new(self.tuning.threshold);
        self.recovering = false;
        self.card_present = self
            .srs
            .present_state()
            .contains(PresentState::CARD_INSERTED);
        sd_info!(
            "sdhc{}: reset, card {}",
            self.index,
            if self.card_present { "present" } else { "absent" }
        );
        Ok(())
    }

    /// Masks every interrupt signal of the slot.
    pub(crate) fn mask_signals(&self) {
        self.srs.set_int_signal_enable(IntStatus::empty());
        self.cqrs.set_int_signal_enable(CqIntStatus::empty());
    }

    /// Status bits the slot currently wants reported.
    pub(crate) fn status_enable(&self) -> IntStatus {
        let mut enable = IntStatus::DEFAULT_ENABLE;
        if !self.card_int_armed {
            enable.remove(IntStatus::CARD_INT);
        }
        if self.cq.enabled {
            enable |= IntStatus::CQ_INT;
        }
        enable
    }

    /// Re-enables the interrupt signals the slot uses.
    pub(crate) fn unmask_signals(&self) {
        if !self.interrupts_enabled {
            return;
        }
        if self.cq.enabled {
            self.cqrs.set_int_signal_enable(CqIntStatus::all());
        }
        self.srs.set_int_signal_enable(self.status_enable());
    }

    /// Stops the card interrupt from being reported. The card keeps its
    /// interrupt line asserted until the card driver has serviced it.
    fn disarm_card_interrupt(&mut self) {
        self.card_int_armed = false;
        self.srs
            .set_int_status_enable(self.srs.int_status_enable().difference(IntStatus::CARD_INT));
        self.srs
            .set_int_signal_enable(self.srs.int_signal_enable().difference(IntStatus::CARD_INT));
    }

    /// Re-enables the card interrupt after the card driver serviced it.
    pub(crate) fn ack_card_interrupt(&mut self) {
        if self.card_int_armed {
            return;
        }
        self.card_int_armed = true;
        self.srs
            .set_int_status_enable(self.srs.int_status_enable() | IntStatus::CARD_INT);
        let signals = self.srs.int_signal_enable();
        if self.interrupts_enabled && !signals.is_empty() {
            self.srs.set_int_signal_enable(signals | IntStatus::CARD_INT);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatcher
    // -----------------------------------------------------------------------

    /// Handles one interrupt (or polling tick) for this slot.
    ///
    /// `raw` is a status snapshot taken by the platform's interrupt handler;
    /// `None` reads the status register here. Returns `true` if any event was
    /// handled.
    pub(crate) fn dispatch(&mut self, raw: Option<u32>) -> bool {
        let raw = raw.unwrap_or_else(|| self.srs.int_status().bits());
        let status = IntStatus::from_bits_retain(raw);
        if status.is_empty() {
            return false;
        }
        let ack = status & IntStatus::ACK;
        if !ack.is_empty() {
            self.srs.clear_int_status(ack);
        }

        if status.contains(IntStatus::CARD_REMOVE) {
            self.card_removed();
        }
        if status.contains(IntStatus::CARD_INSERT) {
            self.card_present = true;
            sd_info!("sdhc{}: card inserted", self.index);
        }
        if status.contains(IntStatus::CARD_INT) && self.card_int_armed {
            self.disarm_card_interrupt();
            match self.hooks.card_interrupt.clone() {
                Some(handler) => handler.card_interrupt(self.index),
                None => sd_debug!("sdhc{}: card interrupt without handler, masked", self.index),
            }
        }
        if status.contains(IntStatus::RETUNE_EVENT) {
            self.tuning.requested = true;
        }

        let mut rest = status;
        let legacy = self.current.is_some() || self.companion.is_some();
        if self.cq.enabled
            && !self.cq.recovering
            && (status.contains(IntStatus::CQ_INT)
                || (!legacy && status.intersects(IntStatus::ERRORS)))
        {
            self.cq_service(status);
            rest = rest.difference(IntStatus::CQ_INT | IntStatus::ERRORS | IntStatus::ERROR_INT);
        }

        if self.current.is_some() || self.companion.is_some() {
            self.service_request(rest);
        } else if rest.intersects(IntStatus::ERRORS) {
            let code = self.recover(rest, RecoveryContext::idle());
            sd_warn!("sdhc{}: error with no request in flight: {}", self.index, code);
        }
        true
    }

    fn card_removed(&mut self) {
        sd_info!("sdhc{}: card removed", self.index);
        self.card_present = false;
        let status = RequestStatus::Failed(SdError::NoCard);
        self.fail_all_requests(status);
        if self.cq.enabled {
            self.cq_fail_all(status);
        }
        self.device = None;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Slot index.
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// A card is in the slot.
    #[must_use]
    pub const fn card_present(&self) -> bool {
        self.card_present
    }

    /// Error recovery is running, for the bus or for the command queue.
    #[must_use]
    pub const fn is_recovering(&self) -> bool {
        self.recovering || self.cq.recovering
    }

    /// The request that owns the bus, if any.
    #[must_use]
    pub fn current_request(&self) -> Option<&Arc<Request>> {
        self.current.as_ref()
    }

    /// Device context set by the protocol layer.
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceContext> {
        self.device.as_ref()
    }

    /// Configured bus width.
    #[must_use]
    pub const fn bus_width(&self) -> BusWidth {
        self.bus_width
    }

    /// Configured access mode.
    #[must_use]
    pub const fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Phase chosen by the last software tuning.
    #[must_use]
    pub const fn tuned_phase(&self) -> Option<u8> {
        self.tuning.last_phase
    }

    /// Tuning bookkeeping.
    #[must_use]
    pub const fn tuning(&self) -> &TuningState {
        &self.tuning
    }

    /// Command queuing is enabled.
    #[must_use]
    pub const fn cq_enabled(&self) -> bool {
        self.cq.enabled
    }

    /// The command queue is halted.
    #[must_use]
    pub const fn cq_halted(&self) -> bool {
        self.cq.halted
    }

    /// State of queue task `task`; `Unused` for out-of-range IDs.
    #[must_use]
    pub fn cq_task_state(&self, task: u8) -> TaskState {
        self.cq
            .tasks
            .get(usize::from(task))
            .map_or(TaskState::Unused, |t| t.state)
    }

    /// Queue task `task` holds a request.
    #[must_use]
    pub fn cq_task_attached(&self, task: u8) -> bool {
        usize::from(task) < CQ_TASKS && self.cq.tasks[usize::from(task)].request.is_some()
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("card_present", &self.card_present)
            .field("device", &self.device)
            .field("current", &self.current)
            .field("cq_enabled", &self.cq.enabled)
            .finish_non_exhaustive()
    }
}
