//! The controller: host-wide registers, slots and the public operations.
//!
//! A [`Host`] is normally placed in a [`DispatchCell`] so the interrupt
//! handler and polling waiters can share it:
//!
//! ```ignore
//! let cell = DispatchCell::new(Host::new(config, io, Some(dma), registry)?);
//!
//! // interrupt handler
//! if let Some(mut host) = cell.enter(DispatchSource::Interrupt) {
//!     let _ = host.check_interrupt(0, None);
//! }
//!
//! // issuer
//! cell.enter(DispatchSource::Polling).unwrap().issue_command(0, &req)?;
//! let status = check_busy(&cell, 0, &req)?;
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use sdhc_core::sync::{DispatchCell, DispatchGuard, DispatchSource};
use sdhc_core::{sd_debug, sd_info, sd_warn};
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::{DmaCapability, SlotHooks};
use sdhc_driver_api::device::{AccessMode, BusWidth, DeviceContext, DeviceKind};
use sdhc_mmio::{IoHandle, PollBudget, wait_for};

use crate::config::{HostConfig, MAX_SLOTS};
use crate::cq::{CoalescingConfig, CqRequest, DcmdRequest};
use crate::regs::{AutoCmdControl2, Caps2, HostCaps, HostControl1, HostGeneral, HostRegs};
use crate::registry::DeviceRegistry;
use crate::request::{Request, RequestStatus};
use crate::slot::Slot;

/// Attempts to take the dispatch token before giving up with `Busy`.
const ENTER_ATTEMPTS: u32 = 1_000;

/// Features read from the host capability register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// eMMC command queuing engine present.
    pub cq: bool,
    /// HS400 enhanced strobe supported.
    pub hs400es: bool,
}

/// One SD host controller and its slots.
pub struct Host {
    io: IoHandle,
    hrs: HostRegs,
    config: HostConfig,
    registry: DeviceRegistry,
    slots: Vec<Slot>,
    caps: HostCapabilities,
    revision: u16,
}

impl Host {
    /// Resets the controller and brings up `config.slot_count` slots.
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for a slot count outside 1..=4,
    /// [`SdError::Timeout`] if a software reset does not self-clear.
    pub fn new(
        config: HostConfig,
        io: IoHandle,
        dma: Option<Arc<dyn DmaCapability>>,
        registry: DeviceRegistry,
    ) -> Result<Self, SdError> {
        if config.slot_count == 0 || config.slot_count > MAX_SLOTS {
            return Err(SdError::InvalidParameter);
        }
        let hrs = HostRegs::new(io.clone(), 0);

        hrs.set_general(hrs.general() | HostGeneral::SOFTWARE_RESET);
        if !wait_for(&*io, config.timeouts.reset(), || {
            !hrs.general().contains(HostGeneral::SOFTWARE_RESET)
        }) {
            sd_warn!("sdhc: host software reset did not complete");
            return Err(SdError::Timeout);
        }

        let raw_caps = hrs.host_caps();
        let caps = HostCapabilities {
            cq: raw_caps.contains(HostCaps::CQ),
            hs400es: raw_caps.contains(HostCaps::HS400ES),
        };
        let revision = (hrs.version() & 0xFFF) as u16;

        let mut slots = Vec::with_capacity(usize::from(config.slot_count));
        for index in 0..config.slot_count {
            let mut slot = Slot::new(index, io.clone(), &config, dma.clone(), caps.cq);
            slot.reset()?;
            slots.push(slot);
        }
        sd_info!(
            "sdhc: controller rev {:#x}, {} slot(s), cq={} hs400es={}",
            revision,
            config.slot_count,
            caps.cq,
            caps.hs400es
        );

        Ok(Self {
            io,
            hrs,
            config,
            registry,
            slots,
            caps,
            revision,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Host capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    /// Controller IP revision.
    #[must_use]
    pub const fn revision(&self) -> u16 {
        self.revision
    }

    /// The configuration the host was built with.
    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The driver registry.
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Mutable access to the driver registry, for late registration.
    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    /// Number of slots.
    #[must_use]
    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Slot `slot`.
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for an unknown slot.
    pub fn slot(&self, slot: u8) -> Result<&Slot, SdError> {
        self.slots
            .get(usize::from(slot))
            .ok_or(SdError::InvalidParameter)
    }

    fn slot_mut(&mut self, slot: u8) -> Result<&mut Slot, SdError> {
        self.slots
            .get_mut(usize::from(slot))
            .ok_or(SdError::InvalidParameter)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Software-resets `slot`. Outstanding requests end `Aborted`.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::Timeout`] if the reset bit does not self-clear
    pub fn reset(&mut self, slot: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.reset()
    }

    /// Enables interrupt status on every slot, and the interrupt signals when
    /// the host runs interrupt-driven.
    pub fn start(&mut self) {
        for slot in &self.slots {
            slot.srs.set_int_status_enable(slot.status_enable());
            slot.unmask_signals();
        }
        sd_debug!("sdhc: started");
    }

    /// Masks every interrupt signal and fails all outstanding requests,
    /// legacy and queued, with `Aborted`.
    pub fn stop(&mut self) {
        for slot in &mut self.slots {
            slot.mask_signals();
            slot.fail_all_requests(RequestStatus::Aborted);
            slot.cq_fail_all(RequestStatus::Aborted);
        }
        sd_info!("sdhc: stopped");
    }

    /// Records the device found in `slot` and installs the hooks of the
    /// first registered driver handling `kind`.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::NoCard`] with no card in the slot
    pub fn attach_device(&mut self, slot: u8, kind: DeviceKind, rca: u16) -> Result<(), SdError> {
        let hooks = self
            .registry
            .find(kind)
            .map_or_else(SlotHooks::none, |d| d.hooks.clone());
        let driver = self.registry.find(kind).map(|d| d.name);
        let s = self.slot_mut(slot)?;
        if !s.card_present {
            return Err(SdError::NoCard);
        }
        s.device = Some(DeviceContext { kind, rca });
        s.hooks = hooks;
        sd_info!(
            "sdhc{}: {:?} attached (rca {:#06x}, driver {})",
            slot,
            kind,
            rca,
            driver.unwrap_or("none")
        );
        Ok(())
    }

    /// Programs the data bus width.
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for an unknown slot.
    pub fn set_bus_width(&mut self, slot: u8, width: BusWidth) -> Result<(), SdError> {
        let s = self.slot_mut(slot)?;
        let control = s
            .srs
            .host_control1()
            .difference(HostControl1::WIDTH_4 | HostControl1::WIDTH_8);
        s.srs.set_host_control1(match width {
            BusWidth::One => control,
            BusWidth::Four => control | HostControl1::WIDTH_4,
            BusWidth::Eight => control | HostControl1::WIDTH_8,
        });
        s.bus_width = width;
        Ok(())
    }

    /// Programs the bus timing and decides whether the mode needs tuning.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::Unsupported`] for HS400 enhanced strobe on a controller
    ///   without it
    pub fn set_access_mode(&mut self, slot: u8, mode: AccessMode) -> Result<(), SdError> {
        if mode == AccessMode::Hs400Es && !self.caps.hs400es {
            return Err(SdError::Unsupported);
        }
        let s = self.slot_mut(slot)?;
        let control = s.srs.host_control1();
        s.srs.set_host_control1(if mode == AccessMode::DefaultSpeed {
            control.difference(HostControl1::HIGH_SPEED)
        } else {
            control | HostControl1::HIGH_SPEED
        });
        let control2 = s.srs.auto_cmd_control2().difference(AutoCmdControl2::UHS_MODE);
        s.srs.set_auto_cmd_control2(
            control2
                | AutoCmdControl2::from_bits_retain(
                    mode.uhs_select() << AutoCmdControl2::UHS_SHIFT,
                ),
        );

        let caps2 = s.srs.caps2();
        s.tuning.enabled = mode.requires_tuning(caps2.contains(Caps2::SDR50_TUNING));
        s.tuning.timer_secs = caps2.retune_timer_secs();
        s.access_mode = mode;
        sd_debug!(
            "sdhc{}: access mode {:?}, tuning {}",
            slot,
            mode,
            s.tuning.enabled
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Starts `req` on `slot`.
    ///
    /// # Errors
    ///
    /// - [`SdError::NoCard`] with no card in the slot
    /// - [`SdError::Busy`] while another request owns the bus or the command
    ///   queue is running
    /// - [`SdError::InvalidParameter`] for a malformed or reused request
    /// - [`SdError::Timeout`] if the CMD/DAT lines stay busy
    pub fn issue_command(&mut self, slot: u8, req: &Arc<Request>) -> Result<(), SdError> {
        self.slot_mut(slot)?.issue(req)
    }

    /// Runs the dispatcher for `slot` once. `raw` is the interrupt status
    /// captured by the platform, or `None` to read it from the controller.
    ///
    /// Returns `true` if any event was handled.
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for an unknown slot. Request failures
    /// are reported through the request status, not here.
    pub fn check_interrupt(&mut self, slot: u8, raw: Option<u32>) -> Result<bool, SdError> {
        Ok(self.slot_mut(slot)?.dispatch(raw))
    }

    /// Aborts the current request of `slot`. See [`Slot`] for the
    /// synchronous and requested forms.
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for an unknown slot. The aborted
    /// request ends `Aborted` even if the abort command itself fails.
    pub fn abort(&mut self, slot: u8, synchronous: bool) -> Result<(), SdError> {
        self.slot_mut(slot)?.abort(synchronous)
    }

    /// Runs tuning on `slot` now.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::Busy`] while a request owns the bus
    /// - [`SdError::Tuning`] if no sampling point passed
    pub fn execute_tuning(&mut self, slot: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.execute_tuning()
    }

    /// Re-enables the card interrupt of `slot` once the card driver has
    /// serviced it. The dispatcher masks it before calling the
    /// [`CardInterruptHandler`](sdhc_driver_api::capability::CardInterruptHandler).
    ///
    /// # Errors
    ///
    /// [`SdError::InvalidParameter`] for an unknown slot.
    pub fn ack_card_interrupt(&mut self, slot: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.ack_card_interrupt();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Command queue
    // -----------------------------------------------------------------------

    /// Enables command queuing on `slot`.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::Unsupported`] without controller or device support, for a
    ///   non-eMMC device, or without a DMA capability
    /// - [`SdError::NotAttached`] with no device attached
    /// - [`SdError::Busy`] while a request owns the bus
    /// - any error of the `EXT_CSD` read or the mode switch
    pub fn cq_enable(&mut self, slot: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_enable()
    }

    /// Disables command queuing on `slot`.
    ///
    /// # Errors
    ///
    /// - [`SdError::InvalidParameter`] for an unknown slot
    /// - [`SdError::Busy`] while any task is in flight
    /// - any error of the mode switch
    pub fn cq_disable(&mut self, slot: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_disable()
    }

    /// Attaches `req` to queue task `task`.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::InvalidTask`] for an out-of-range or reserved task
    /// - [`SdError::Busy`] if the task is occupied
    /// - [`SdError::InvalidParameter`] for buffers that do not match the
    ///   block count, or a scattered request without a descriptor array
    pub fn cq_attach_request(
        &mut self,
        slot: u8,
        task: u8,
        req: &Arc<CqRequest>,
    ) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_attach(task, req)
    }

    /// Rings the doorbell for one attached task.
    ///
    /// # Errors
    ///
    /// As [`cq_start_tasks`](Self::cq_start_tasks), plus
    /// [`SdError::InvalidTask`] for an out-of-range task.
    pub fn cq_start_task(&mut self, slot: u8, task: u8) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_start_task(task)
    }

    /// Rings the doorbell for every task in `mask`.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::InvalidParameter`] for an empty mask
    /// - [`SdError::InvalidTask`] if `mask` names the reserved task
    /// - [`SdError::Busy`] if a task is already pending in hardware
    /// - [`SdError::NotAttached`] for a task with no request attached
    pub fn cq_start_tasks(&mut self, slot: u8, mask: u32) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_start_tasks(mask)
    }

    /// Issues a direct command through the reserved task.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::Unsupported`] with direct commands disabled
    /// - [`SdError::Busy`] while another direct command is in flight
    pub fn cq_execute_dcmd(&mut self, slot: u8, req: &Arc<DcmdRequest>) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_execute_dcmd(req)
    }

    /// Halts (`true`) or resumes (`false`) the queue.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::Io`] if the controller does not acknowledge
    pub fn cq_halt(&mut self, slot: u8, halt: bool) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_halt(halt)
    }

    /// Discards one task, also in the device when `device` is set.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::InvalidTask`] for an out-of-range task
    /// - [`SdError::Io`] if halting, clearing or resuming fails
    pub fn cq_discard_task(&mut self, slot: u8, task: u8, device: bool) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_discard_task(task, device)
    }

    /// Discards every task, also in the device when `device` is set.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::Io`] if halting, clearing or resuming fails
    pub fn cq_discard_all(&mut self, slot: u8, device: bool) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_discard_all(device)
    }

    /// Programs interrupt coalescing.
    ///
    /// # Errors
    ///
    /// - [`SdError::QueueDisabled`] while queuing is off
    /// - [`SdError::InvalidParameter`] for a threshold above 31 or a timeout
    ///   above 127
    pub fn cq_set_int_coalescing(
        &mut self,
        slot: u8,
        config: CoalescingConfig,
    ) -> Result<(), SdError> {
        self.slot_mut(slot)?.cq_set_int_coalescing(config)
    }

    // -----------------------------------------------------------------------
    // Blocking support
    // -----------------------------------------------------------------------

    fn wait_params(&self) -> (IoHandle, PollBudget, bool) {
        (
            self.io.clone(),
            self.config.timeouts.request(),
            !self.config.interrupts_enabled,
        )
    }

    fn expire(&mut self, slot: u8, req: &Arc<Request>) {
        match self.slot_mut(slot) {
            Ok(s) => s.expire(req),
            Err(_) => {
                req.complete(RequestStatus::Failed(SdError::Timeout));
            }
        }
    }
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host")
            .field("hrs", &self.hrs.base())
            .field("caps", &self.caps)
            .field("revision", &self.revision)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

fn enter_with_retry(cell: &DispatchCell<Host>) -> Option<DispatchGuard<'_, Host>> {
    for _ in 0..ENTER_ATTEMPTS {
        if let Some(guard) = cell.enter(DispatchSource::Polling) {
            return Some(guard);
        }
        core::hint::spin_loop();
    }
    None
}

/// Blocks until `req` on `slot` is terminal and returns its status.
///
/// With interrupts disabled this drives the dispatcher itself, taking the
/// dispatch token for each poll. With interrupts enabled it only watches the
/// request and leaves the token to the interrupt handler.
///
/// # Errors
///
/// [`SdError::Timeout`] if the request is still pending after the request
/// budget; the request is then failed and an abort is started.
/// [`SdError::Busy`] if the dispatch token could not be taken at all.
pub fn check_busy(
    cell: &DispatchCell<Host>,
    slot: u8,
    req: &Arc<Request>,
) -> Result<RequestStatus, SdError> {
    let (io, budget, polled) = {
        let host = enter_with_retry(cell).ok_or(SdError::Busy)?;
        host.slot(slot)?;
        host.wait_params()
    };

    let done = wait_for(&*io, budget, || {
        if polled && !req.status().is_terminal() {
            if let Some(mut host) = cell.enter(DispatchSource::Polling) {
                let _ = host.check_interrupt(slot, None);
            }
        }
        req.status().is_terminal()
    });
    if done {
        return Ok(req.status());
    }

    sd_warn!("sdhc{}: CMD{} timed out", slot, req.command().index);
    match enter_with_retry(cell) {
        Some(mut host) => host.expire(slot, req),
        None => {
            req.complete(RequestStatus::Failed(SdError::Timeout));
        }
    }
    Err(SdError::Timeout)
}
