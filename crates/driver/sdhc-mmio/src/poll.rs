//! Bounded register polling.
//!
//! Every hardware handshake in the driver is a poll with a fixed iteration
//! budget. Budgets count delay intervals rather than wall-clock time, so a
//! simulated backend with a no-op delay finishes instantly.

use crate::RegisterIo;

/// An iteration budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Maximum number of polls.
    pub iterations: u32,
    /// Delay between polls in microseconds.
    pub interval_us: u32,
}

impl PollBudget {
    /// Builds a budget covering `timeout_us` in steps of `interval_us`.
    #[must_use]
    pub const fn from_timeout(timeout_us: u32, interval_us: u32) -> Self {
        let interval_us = if interval_us == 0 { 1 } else { interval_us };
        let iterations = timeout_us / interval_us;
        Self {
            iterations: if iterations == 0 { 1 } else { iterations },
            interval_us,
        }
    }
}

/// Polls the register at `offset` until `value & mask == expected`.
///
/// Returns the matching value, or the last value read on timeout.
pub fn poll_until(
    io: &dyn RegisterIo,
    offset: u32,
    mask: u32,
    expected: u32,
    budget: PollBudget,
) -> Result<u32, u32> {
    let mut value = io.read32(offset);
    for _ in 0..budget.iterations {
        if value & mask == expected {
            return Ok(value);
        }
        io.delay_us(budget.interval_us);
        value = io.read32(offset);
    }
    if value & mask == expected {
        Ok(value)
    } else {
        Err(value)
    }
}

/// Polls `done` until it returns `true`. Returns `false` on timeout.
pub fn wait_for(io: &dyn RegisterIo, budget: PollBudget, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..budget.iterations {
        if done() {
            return true;
        }
        io.delay_us(budget.interval_us);
    }
    done()
}
