// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(unused_variables)]

use std::fmt;
use std::time::Instant;

use strum_macros::EnumIter;

pub use dummy::Dummy;

/// Congestion avoidance state of a connection.
///
/// The states are ordered: a state compares greater than another when it
/// reacts more strongly to congestion.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Default, EnumIter)]
pub enum CaState {
    /// Nothing bad has been observed recently.
    #[default]
    Open,

    /// Duplicate or selective acknowledgments have been seen.
    Disorder,

    /// The window was reduced in response to an explicit congestion signal.
    Cwr,

    /// Fast retransmission of lost segments is in progress.
    Recovery,

    /// The retransmission timer expired and all outstanding data is
    /// presumed lost.
    Loss,
}

impl CaState {
    /// Whether the state is in loss recovery, where time-based loss
    /// detection is allowed to mark segments lost.
    pub fn in_recovery(self) -> bool {
        self >= CaState::Recovery
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// The number of requested recovery entries.
    pub recovery_entries: u64,

    /// Total segments the window was asked to shrink by.
    pub reduced_segments: u64,
}

/// Congestion control interfaces consumed by loss recovery.
///
/// Loss recovery only reads the state and requests transitions. The
/// window arithmetic is up to the implementation.
pub trait CongestionOps {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Current congestion avoidance state.
    fn ca_state(&self) -> CaState;

    /// Enter fast recovery.
    fn enter_recovery(&mut self, now: Instant);

    /// Whether the algorithm handles congestion events itself. If not, loss
    /// recovery asks for a window reduction after marking losses.
    fn has_cong_control(&self) -> bool {
        false
    }

    /// Shrink the congestion window by the given number of segments.
    fn reduce_cwnd(&mut self, segments: u32) {}

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {} {:?}", self.name(), self.ca_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn ca_state_order() {
        let states: Vec<CaState> = CaState::iter().collect();
        assert_eq!(
            states,
            vec![
                CaState::Open,
                CaState::Disorder,
                CaState::Cwr,
                CaState::Recovery,
                CaState::Loss
            ]
        );
        assert!(states.windows(2).all(|w| w[0] < w[1]));

        let in_recovery: Vec<bool> = CaState::iter().map(|s| s.in_recovery()).collect();
        assert_eq!(in_recovery, vec![false, false, false, true, true]);
        assert_eq!(CaState::default(), CaState::Open);
    }

    #[test]
    fn congestion_ops_debug() {
        let cc: Box<dyn CongestionOps> = Box::new(Dummy::new());
        assert_eq!(format!("{:?}", cc), "congestion controller DUMMY Open");
    }
}

mod dummy;
