//! Host configuration.
//!
//! Plain data handed to [`Host::new`](crate::Host::new). Every field has a
//! working default, so platforms normally override only the slot count and
//! the interrupt mode.

use sdhc_mmio::PollBudget;

use crate::cq::CoalescingConfig;

/// Maximum slots a single controller exposes.
pub const MAX_SLOTS: u8 = 4;

/// Polling budgets for hardware handshakes, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Delay between polls.
    pub poll_interval_us: u32,
    /// Command/data inhibit release before issuing a command.
    pub line_idle_us: u32,
    /// Self-clearing software reset bits.
    pub reset_us: u32,
    /// A whole request, from issue to terminal status.
    pub request_us: u32,
    /// CQ halt, un-halt and task clear handshakes.
    pub cq_handshake_us: u32,
    /// DAT lines returning to idle after recovery.
    pub dat_idle_us: u32,
}

impl Timeouts {
    const fn budget(&self, timeout_us: u32) -> PollBudget {
        PollBudget::from_timeout(timeout_us, self.poll_interval_us)
    }

    /// Budget for the inhibit wait.
    #[must_use]
    pub const fn line_idle(&self) -> PollBudget {
        self.budget(self.line_idle_us)
    }

    /// Budget for software reset completion.
    #[must_use]
    pub const fn reset(&self) -> PollBudget {
        self.budget(self.reset_us)
    }

    /// Budget for a full request.
    #[must_use]
    pub const fn request(&self) -> PollBudget {
        self.budget(self.request_us)
    }

    /// Budget for CQ handshakes.
    #[must_use]
    pub const fn cq_handshake(&self) -> PollBudget {
        self.budget(self.cq_handshake_us)
    }

    /// Budget for the DAT idle check.
    #[must_use]
    pub const fn dat_idle(&self) -> PollBudget {
        self.budget(self.dat_idle_us)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval_us: 10,
            line_idle_us: 100_000,
            reset_us: 100_000,
            request_us: 3_000_000,
            cq_handshake_us: 100_000,
            dat_idle_us: 10_000,
        }
    }
}

/// Command queue settings applied when the queue is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqSettings {
    /// Reserve task 31 for direct commands.
    pub dcmd_enabled: bool,
    /// Send-status (CMD13) idle timer, in CQ clock periods.
    pub send_status_idle_timer: u16,
    /// Blocks remaining before the controller polls queue status.
    pub send_status_block_counter: u8,
    /// Initial interrupt coalescing.
    pub coalescing: CoalescingConfig,
}

impl Default for CqSettings {
    fn default() -> Self {
        Self {
            dcmd_enabled: true,
            send_status_idle_timer: 0x1000,
            send_status_block_counter: 1,
            coalescing: CoalescingConfig::disabled(),
        }
    }
}

/// Controller-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of slots to bring up (1..=4).
    pub slot_count: u8,
    /// Deliver completion through the interrupt line. When `false`, every
    /// wait polls the dispatcher instead.
    pub interrupts_enabled: bool,
    /// Use 64-bit DMA addressing (and 128-bit CQ descriptors).
    pub addressing_64: bool,
    /// Polling budgets.
    pub timeouts: Timeouts,
    /// Bytes transferred after which a retune is due, for modes with a
    /// retuning timer.
    pub retune_byte_threshold: u64,
    /// Command queue settings.
    pub cq: CqSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            slot_count: 1,
            interrupts_enabled: false,
            addressing_64: false,
            timeouts: Timeouts::default(),
            retune_byte_threshold: 64 * 1024 * 1024,
            cq: CqSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets() {
        let t = Timeouts::default();
        assert_eq!(t.request().iterations, 300_000);
        assert_eq!(t.line_idle().interval_us, 10);
    }

    #[test]
    fn default_config_is_single_slot_polling() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.slot_count, 1);
        assert!(!cfg.interrupts_enabled);
        assert!(cfg.cq.dcmd_enabled);
    }
}
