//! Error interrupts: classification, line recovery and the auto-CMD12 path.

mod common;

use std::sync::Arc;

use sdhc_host::{
    AutoCommand, Command, DataBuffer, DataPhase, Request, RequestStatus, ResponseType, SdError,
};
use sdhc_sim::SimController;

const CMD_TIMEOUT: u32 = 1 << 16;
const DATA_TIMEOUT: u32 = 1 << 20;
const DATA_CRC: u32 = 1 << 21;
const AUTO_CMD: u32 = 1 << 24;
const TUNING: u32 = 1 << 26;

const RESET_ALL: u32 = 1 << 24;
const RESET_CMD: u32 = 1 << 25;
const RESET_DAT: u32 = 1 << 26;

const AUTO_CMD12_NOT_EXECUTED: u32 = 1 << 0;
const AUTO_CMD_TIMEOUT: u32 = 1 << 1;

fn auto_cmd12_read() -> Arc<Request> {
    Arc::new(
        Request::new(Command::new(18, 0, ResponseType::R1)).with_data(
            DataPhase::read(512, 4).with_auto_cmd(AutoCommand::Cmd12),
            DataBuffer::Pio(vec![0; 2048]),
        ),
    )
}

#[test]
fn command_timeout_resets_cmd_line() {
    let sim = SimController::new();
    sim.fail_next(13, CMD_TIMEOUT);
    let mut host = common::host(&sim);
    let req = Arc::new(Request::new(Command::new(13, 0, ResponseType::R1)));
    assert_eq!(
        common::run(&mut host, &req),
        RequestStatus::Failed(SdError::CmdTimeout)
    );
    assert_eq!(
        sim.line_resets(),
        vec![RESET_ALL, RESET_CMD, RESET_CMD | RESET_DAT]
    );
    assert_eq!(sim.command_indices(), vec![13, 12]);
    assert!(!host.slot(0).unwrap().is_recovering());
    assert_eq!(sim.reg(0x230), 0, "status acknowledged");
}

#[test]
fn data_timeout_resets_dat_line() {
    let sim = SimController::new();
    sim.fail_next(17, DATA_TIMEOUT);
    let mut host = common::host(&sim);
    let req = Arc::new(
        Request::new(Command::new(17, 0, ResponseType::R1))
            .with_data(DataPhase::read(512, 1), DataBuffer::Pio(vec![0; 512])),
    );
    assert_eq!(
        common::run(&mut host, &req),
        RequestStatus::Failed(SdError::DataTimeout)
    );
    assert_eq!(
        sim.line_resets(),
        vec![RESET_ALL, RESET_DAT, RESET_CMD | RESET_DAT]
    );
}

#[test]
fn tuning_error_leaves_lines_alone() {
    let sim = SimController::new();
    sim.fail_next(17, TUNING | DATA_CRC);
    let mut host = common::host(&sim);
    let req = Arc::new(
        Request::new(Command::new(17, 0, ResponseType::R1))
            .with_data(DataPhase::read(512, 1), DataBuffer::Pio(vec![0; 512])),
    );
    assert_eq!(
        common::run(&mut host, &req),
        RequestStatus::Failed(SdError::Tuning)
    );
    assert_eq!(sim.line_resets(), vec![RESET_ALL]);
    assert_eq!(sim.command_indices(), vec![17]);
}

#[test]
fn auto_cmd12_issued_with_data_error() {
    let sim = SimController::new();
    sim.fail_next(18, AUTO_CMD | DATA_CRC);
    sim.set_auto_cmd_status(AUTO_CMD_TIMEOUT);
    let mut host = common::host(&sim);
    let req = auto_cmd12_read();
    assert_eq!(
        common::run(&mut host, &req),
        RequestStatus::Failed(SdError::AutoCmd12RecoverableB)
    );
    assert_eq!(sim.command_indices(), vec![18, 12]);
    assert_eq!(sim.line_resets(), vec![RESET_ALL, RESET_DAT]);
}

#[test]
fn auto_cmd12_issued_without_data_error() {
    let sim = SimController::new();
    sim.fail_next(18, AUTO_CMD);
    sim.set_auto_cmd_status(AUTO_CMD_TIMEOUT);
    let mut host = common::host(&sim);
    assert_eq!(
        common::run(&mut host, &auto_cmd12_read()),
        RequestStatus::Failed(SdError::AutoCmd12RecoverableA)
    );
    assert_eq!(sim.line_resets(), vec![RESET_ALL]);
}

#[test]
fn auto_cmd12_not_executed() {
    let sim = SimController::new();
    sim.fail_next(18, AUTO_CMD);
    sim.set_auto_cmd_status(AUTO_CMD12_NOT_EXECUTED);
    let mut host = common::host(&sim);
    assert_eq!(
        common::run(&mut host, &auto_cmd12_read()),
        RequestStatus::Failed(SdError::AutoCmd12RecoverableC)
    );
    assert_eq!(sim.line_resets(), vec![RESET_ALL, RESET_CMD]);
}

#[test]
fn auto_cmd12_not_executed_with_data_error() {
    let sim = SimController::new();
    sim.fail_next(18, AUTO_CMD | DATA_TIMEOUT);
    sim.set_auto_cmd_status(AUTO_CMD12_NOT_EXECUTED);
    let mut host = common::host(&sim);
    assert_eq!(
        common::run(&mut host, &auto_cmd12_read()),
        RequestStatus::Failed(SdError::AutoCmd12RecoverableD)
    );
    assert_eq!(sim.line_resets(), vec![RESET_ALL, RESET_CMD, RESET_DAT]);
}

#[test]
fn auto_cmd12_abort_failure_is_unrecoverable() {
    let sim = SimController::new();
    sim.fail_next(18, AUTO_CMD);
    sim.fail_next(12, CMD_TIMEOUT);
    sim.set_auto_cmd_status(AUTO_CMD_TIMEOUT);
    let mut host = common::host(&sim);
    assert_eq!(
        common::run(&mut host, &auto_cmd12_read()),
        RequestStatus::Failed(SdError::AutoCmd12Unrecoverable)
    );
    assert_eq!(sim.line_resets(), vec![RESET_ALL, RESET_CMD | RESET_DAT]);
}

#[test]
fn stuck_dat_lines_are_unrecoverable() {
    let sim = SimController::new();
    sim.fail_next(13, CMD_TIMEOUT);
    let mut host = common::host(&sim);
    sim.set_dat_level(0);
    let req = Arc::new(Request::new(Command::new(13, 0, ResponseType::R1)));
    assert_eq!(
        common::run(&mut host, &req),
        RequestStatus::Failed(SdError::Unrecoverable)
    );
}

#[test]
fn error_without_request_is_cleared() {
    let sim = SimController::new();
    let mut host = common::host(&sim);
    sim.raise(CMD_TIMEOUT);
    assert!(host.check_interrupt(0, None).unwrap());
    assert_eq!(sim.reg(0x230), 0);
    assert!(sim.commands().is_empty(), "no abort without a request");
}
