// SPDX-License-Identifier: MIT

//! The datagram data-plane collaborator (§1, §6): "the core only starts/stops it and
//! observes its counters." The real tap/tun + UDP encapsulation path is out of scope;
//! this module is the seam C7 calls through.

use crate::config::Config;
use crate::error::DaemonError;

/// Cumulative counters the core surfaces through `DUMP_TRAFFIC` (§4.6, §4.9).
#[derive(Debug, Default, Clone, Copy)]
pub struct TapCounters {
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

/// What C7 needs from the data plane: bring it up with a config, tear it down, and
/// read its counters. Nothing here encodes how packets actually move.
pub trait DataPlane: Send {
    fn up(&mut self, config: &Config) -> Result<(), DaemonError>;
    fn down(&mut self);
    fn counters(&self) -> TapCounters;
}

/// A no-op data plane: `up`/`down` succeed trivially and counters never move. Used
/// wherever the core is exercised (tests, this specification's scenarios) without a
/// real tap device.
#[derive(Default)]
pub struct NullDataPlane {
    up: bool,
    counters: TapCounters,
}

impl DataPlane for NullDataPlane {
    fn up(&mut self, _config: &Config) -> Result<(), DaemonError> {
        self.up = true;
        Ok(())
    }

    fn down(&mut self) {
        self.up = false;
    }

    fn counters(&self) -> TapCounters {
        self.counters
    }
}

impl NullDataPlane {
    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Test/bench helper to simulate traffic having flowed.
    pub fn inject(&mut self, counters: TapCounters) {
        self.counters = counters;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_data_plane_tracks_up_down() {
        let mut dp = NullDataPlane::default();
        assert!(!dp.is_up());
        dp.up(&Config::default()).unwrap();
        assert!(dp.is_up());
        dp.down();
        assert!(!dp.is_up());
    }
}
