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

use std::time::Instant;

use log::*;

use super::CaState;
use super::CongestionOps;
use super::CongestionStats;

/// Dummy is a congestion controller that only tracks its state. It never
/// changes a window. It is intended to be used for testing and experiments.
#[derive(Debug, Default)]
pub struct Dummy {
    /// Congestion avoidance state.
    state: CaState,

    /// Whether the controller claims to handle congestion events itself.
    cong_control: bool,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Dummy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the congestion avoidance state.
    pub fn set_ca_state(&mut self, state: CaState) {
        self.state = state;
    }

    /// Set whether the controller handles congestion events itself.
    pub fn set_cong_control(&mut self, v: bool) {
        self.cong_control = v;
    }
}

impl CongestionOps for Dummy {
    fn name(&self) -> &str {
        "DUMMY"
    }

    fn ca_state(&self) -> CaState {
        self.state
    }

    fn enter_recovery(&mut self, now: Instant) {
        trace!("now={:?} dummy {:?} -> Recovery", now, self.state);
        self.state = CaState::Recovery;
        self.stats.recovery_entries = self.stats.recovery_entries.saturating_add(1);
    }

    fn has_cong_control(&self) -> bool {
        self.cong_control
    }

    fn reduce_cwnd(&mut self, segments: u32) {
        self.stats.reduced_segments = self.stats.reduced_segments.saturating_add(segments as u64);
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
