//! Sampling-point tuning: the hardware handshake, the software phase sweep
//! and retune triggers.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use sdhc_driver_api::capability::{PhaseTuner, SlotHooks};
use sdhc_driver_api::device::{AccessMode, BusWidth, DeviceKind};
use sdhc_host::{
    Command, DataBuffer, DataPhase, DeviceDriver, DeviceRegistry, Host, Request, RequestStatus,
    ResponseType, SdError, TUNING_BLOCK_4BIT,
};
use sdhc_sim::SimController;

const SAMPLING_CLOCK: u32 = 1 << 23;
const RETUNE_REQUEST: u32 = 1 << 3;
const RETUNE_EVENT: u32 = 1 << 12;

struct SharedPhase(Arc<AtomicU8>);

impl PhaseTuner for SharedPhase {
    fn set_phase(&self, _slot: u8, phase: u8) -> Result<(), SdError> {
        self.0.store(phase, Ordering::SeqCst);
        Ok(())
    }
}

fn single_read() -> Arc<Request> {
    Arc::new(
        Request::new(Command::new(17, 0, ResponseType::R1))
            .with_data(DataPhase::read(512, 1), DataBuffer::Pio(vec![0; 512])),
    )
}

fn count(sim: &SimController, index: u8) -> usize {
    sim.command_indices().iter().filter(|&&i| i == index).count()
}

/// eMMC host whose card returns the tuning block only while the sampling
/// phase is inside `window`.
fn emmc_host(sim: &Arc<SimController>, window: std::ops::RangeInclusive<u8>) -> Host {
    let phase = Arc::new(AtomicU8::new(0));
    let seen = phase.clone();
    sim.set_read_data(move |index, _| {
        if index == 21 && window.contains(&seen.load(Ordering::SeqCst)) {
            TUNING_BLOCK_4BIT.to_vec()
        } else {
            vec![0; TUNING_BLOCK_4BIT.len()]
        }
    });

    let mut registry = DeviceRegistry::default();
    registry
        .register(DeviceDriver {
            name: "mmc",
            kinds: &[DeviceKind::Emmc],
            hooks: SlotHooks::none().with_tuner(Arc::new(SharedPhase(phase))),
        })
        .unwrap();
    let mut host = common::host_with(sim, common::config(), None, registry);
    host.attach_device(0, DeviceKind::Emmc, 1).unwrap();
    host.set_bus_width(0, BusWidth::Four).unwrap();
    host
}

#[test]
fn hardware_tuning_succeeds() {
    let sim = SimController::new();
    sim.configure_hw_tuning(5, true);
    let mut host = common::host(&sim);
    host.set_access_mode(0, AccessMode::Sdr104).unwrap();
    assert!(host.slot(0).unwrap().tuning().enabled);

    host.execute_tuning(0).unwrap();
    assert_eq!(sim.command_indices(), vec![19; 5]);
    assert_ne!(sim.reg(0x23C) & SAMPLING_CLOCK, 0);
    assert!(!host.slot(0).unwrap().tuning().requested);
}

#[test]
fn hardware_tuning_retries_once_then_fails() {
    let sim = SimController::new();
    sim.configure_hw_tuning(3, false);
    let mut host = common::host(&sim);
    host.set_access_mode(0, AccessMode::Sdr104).unwrap();

    assert_eq!(host.execute_tuning(0), Err(SdError::Tuning));
    assert_eq!(count(&sim, 19), 6);
    assert!(sim.line_resets().contains(&((1 << 25) | (1 << 26))));
}

#[test]
fn retune_request_runs_before_data_command() {
    let sim = SimController::new();
    sim.configure_hw_tuning(2, true);
    let mut host = common::host(&sim);
    host.set_access_mode(0, AccessMode::Sdr104).unwrap();
    sim.set_present_bits(RETUNE_REQUEST);

    assert_eq!(common::run(&mut host, &single_read()), RequestStatus::Finished);
    assert_eq!(sim.command_indices(), vec![19, 19, 17]);
}

#[test]
fn retune_event_is_latched_until_next_data_command() {
    let sim = SimController::new();
    sim.configure_hw_tuning(1, true);
    let mut host = common::host(&sim);
    host.set_access_mode(0, AccessMode::Sdr104).unwrap();

    sim.raise(RETUNE_EVENT);
    host.check_interrupt(0, None).unwrap();
    assert!(host.slot(0).unwrap().tuning().requested);

    // Commands without data never trigger a retune.
    let status = Arc::new(Request::new(Command::new(13, 0, ResponseType::R1)));
    assert_eq!(common::run(&mut host, &status), RequestStatus::Finished);
    assert_eq!(sim.command_indices(), vec![13]);

    assert_eq!(common::run(&mut host, &single_read()), RequestStatus::Finished);
    assert_eq!(sim.command_indices(), vec![13, 19, 17]);
    assert!(!host.slot(0).unwrap().tuning().requested);
}

#[test]
fn default_speed_never_retunes() {
    let sim = SimController::new();
    let mut host = common::host(&sim);
    sim.set_present_bits(RETUNE_REQUEST);
    assert_eq!(common::run(&mut host, &single_read()), RequestStatus::Finished);
    assert_eq!(sim.command_indices(), vec![17]);
}

#[test]
fn software_tuning_picks_window_midpoint() {
    let sim = SimController::new();
    let mut host = emmc_host(&sim, 10..=19);

    host.execute_tuning(0).unwrap();
    assert_eq!(host.slot(0).unwrap().tuned_phase(), Some(14));
    // One read per phase plus the verification read.
    assert_eq!(count(&sim, 21), 41);
}

#[test]
fn software_tuning_without_passing_phase_fails() {
    let sim = SimController::new();
    let mut host = emmc_host(&sim, 50..=60);

    assert_eq!(host.execute_tuning(0), Err(SdError::Tuning));
    assert_eq!(host.slot(0).unwrap().tuned_phase(), None);
}

#[test]
fn enhanced_strobe_needs_host_support() {
    let sim = SimController::new();
    sim.set_host_caps(0);
    let mut host = common::host(&sim);
    assert_eq!(
        host.set_access_mode(0, AccessMode::Hs400Es),
        Err(SdError::Unsupported)
    );
    host.set_access_mode(0, AccessMode::HighSpeed).unwrap();
    assert_ne!(sim.reg(0x228) & (1 << 2), 0);
    assert!(!host.slot(0).unwrap().tuning().enabled);
}

#[test]
fn bus_width_register() {
    let sim = SimController::new();
    let mut host = common::host(&sim);
    host.set_bus_width(0, BusWidth::Eight).unwrap();
    assert_eq!(sim.reg(0x228) & ((1 << 1) | (1 << 5)), 1 << 5);
    host.set_bus_width(0, BusWidth::Four).unwrap();
    assert_eq!(sim.reg(0x228) & ((1 << 1) | (1 << 5)), 1 << 1);
    assert_eq!(host.slot(0).unwrap().bus_width(), BusWidth::Four);
}
