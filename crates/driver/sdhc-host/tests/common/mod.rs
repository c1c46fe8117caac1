//! Shared setup for the host integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sdhc_driver_api::capability::DmaCapability;
use sdhc_host::{DeviceRegistry, Host, HostConfig, Request, RequestStatus, Timeouts};
use sdhc_mmio::IoHandle;
use sdhc_sim::SimController;

/// Polls the dispatcher at most this many times before giving up.
const MAX_POLLS: usize = 10_000;

/// Short budgets so the timeout paths finish quickly against the simulator.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        poll_interval_us: 1,
        line_idle_us: 200,
        reset_us: 200,
        request_us: 2_000,
        cq_handshake_us: 200,
        dat_idle_us: 200,
    }
}

pub fn config() -> HostConfig {
    HostConfig {
        timeouts: fast_timeouts(),
        ..HostConfig::default()
    }
}

pub fn host_with(
    sim: &Arc<SimController>,
    config: HostConfig,
    dma: Option<Arc<dyn DmaCapability>>,
    registry: DeviceRegistry,
) -> Host {
    sdhc_sim::install_logger();
    let io: IoHandle = sim.clone();
    Host::new(config, io, dma, registry).expect("host bring-up")
}

pub fn host(sim: &Arc<SimController>) -> Host {
    host_with(sim, config(), None, DeviceRegistry::default())
}

/// Issues `req` on slot 0 and polls until it is terminal.
pub fn run(host: &mut Host, req: &Arc<Request>) -> RequestStatus {
    host.issue_command(0, req).expect("issue");
    poll(host, req)
}

/// Polls slot 0 until `req` is terminal.
pub fn poll(host: &mut Host, req: &Arc<Request>) -> RequestStatus {
    for _ in 0..MAX_POLLS {
        if req.status().is_terminal() {
            break;
        }
        host.check_interrupt(0, None).expect("dispatch");
    }
    req.status()
}
