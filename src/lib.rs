// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! GPU command-submission core.
//!
//! Manages the fixed ring of hardware-visible primary command buffers, an
//! age-stamped pool of client-fillable secondary buffers and the policy
//! that decides when accumulated commands are handed to the device.
//! Register layout, command encoding and the ioctl surface stay with the
//! per-chip drivers; they reach this core through the [`hw::RegisterIo`]
//! and [`hw::DmaMemory`] seams.
//!
//! ```text
//!  producers                       scheduler                    device
//!  ---------                       ---------                    ------
//!  checkout ──► fill ──► submit ──► current primary
//!                 ▲                    │ should_fire?
//!                 │                    ▼
//!             freelist ◄── age ──── fire ── PRIM_ADDRESS/END ──► DMA
//!                 ▲                                               │
//!                 └── last completed ◄── completion event ◄── interrupt
//! ```
//!
//! Every buffer folded into a primary is stamped with that primary's
//! dispatch generation; the completion interrupt publishes the retired
//! generation, and "may this buffer be reused" reduces to one integer
//! comparison. See [`sched::DmaDevice`] for the full protocol.

use std::time::Duration;

use log::error;

pub mod error;
pub mod freelist;
pub mod hw;
pub mod lock;
pub mod ring;
pub mod sched;
pub mod sim;
pub mod stats;
pub mod wait;

pub use error::{Error, Result};
pub use freelist::{BufferId, ProcessId};
pub use sched::{DispatchFlags, DmaDevice, FlushFlags, LockFlags, SubmitFlags};
pub use stats::StatsSnapshot;
pub use wait::CancelToken;

/// Bounded hardware polling behaviour, explicit so lockup handling is
/// testable with short windows.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Wall-clock budget before a wait is declared a lockup.
    pub timeout: Duration,
    /// First inter-poll sleep; doubled after every miss.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling backoff.
    pub max_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            initial_backoff: Duration::from_micros(10),
            max_backoff: Duration::from_millis(1),
        }
    }
}

/// Submission core geometry and timing.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Primary ring depth.
    pub num_primary: usize,
    /// Bytes per primary buffer.
    pub primary_size: usize,
    /// Secondary pool depth.
    pub num_secondary: usize,
    /// Bytes per secondary buffer.
    pub secondary_size: usize,
    /// Offset of the secondary region inside the device memory window.
    pub region_offset: u64,
    /// Hardware readiness polling.
    pub poll: PollPolicy,
    /// How often sleeping waiters re-examine their condition.
    pub wait_recheck: Duration,
    /// Failed checkout attempts tolerated before the caller blocks
    /// instead of spinning.
    pub checkout_spin_threshold: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            num_primary: 2,
            primary_size: 64 * 1024,
            num_secondary: 256,
            secondary_size: 16 * 1024,
            region_offset: 0,
            poll: PollPolicy::default(),
            wait_recheck: Duration::from_millis(50),
            checkout_spin_threshold: 1000,
        }
    }
}

impl DriverConfig {
    /// Reject bad geometry before any allocation takes place.
    pub fn validate(&self) -> Result<()> {
        if self.num_primary == 0 || self.num_secondary == 0 {
            error!("ring and pool must be non-empty");
            return Err(Error::InvalidConfiguration);
        }
        if self.primary_size % 4 != 0 || self.secondary_size % 4 != 0 {
            error!("buffer sizes must be word multiples");
            return Err(Error::InvalidConfiguration);
        }
        // room for at least one chain pair next to the trailer margin
        if self.primary_size / 4 < ring::TAIL_MARGIN + 2 {
            error!("primary size {} too small", self.primary_size);
            return Err(Error::InvalidConfiguration);
        }
        if self.secondary_size == 0 {
            error!("secondary size must be non-zero");
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let mut config = DriverConfig::default();
        config.num_primary = 0;
        assert_eq!(config.validate(), Err(Error::InvalidConfiguration));

        let mut config = DriverConfig::default();
        config.primary_size = 10;
        assert_eq!(config.validate(), Err(Error::InvalidConfiguration));

        let mut config = DriverConfig::default();
        config.primary_size = 16;
        assert_eq!(config.validate(), Err(Error::InvalidConfiguration));

        let mut config = DriverConfig::default();
        config.num_secondary = 0;
        assert_eq!(config.validate(), Err(Error::InvalidConfiguration));
    }
}
