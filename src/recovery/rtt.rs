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

use std::cmp;
use std::time::Duration;

/// RTT estimation of a connection.
/// See RFC 6298 Section 2
pub struct RttEstimator {
    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The exponentially weighted moving average of the RTT samples.
    smoothed_rtt: Option<Duration>,

    /// The mean variation of the RTT samples.
    rttvar: Duration,

    /// The minimum RTT observed so far. It is used by loss detection to widen
    /// the reordering window and to reject ambiguous acknowledgments.
    min_rtt: Option<Duration>,

    /// The retransmission timeout before any RTT sample is taken.
    initial_rto: Duration,

    /// The lower bound of the retransmission timeout.
    min_rto: Duration,

    /// The upper bound of the retransmission timeout.
    max_rto: Duration,

    /// Granularity of the timer facility, the lower bound of the variance
    /// term of the retransmission timeout.
    granularity: Duration,
}

impl RttEstimator {
    pub fn new(
        initial_rto: Duration,
        min_rto: Duration,
        max_rto: Duration,
        granularity: Duration,
    ) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: None,
            rttvar: Duration::ZERO,
            min_rtt: None,
            initial_rto,
            min_rto,
            max_rto,
            granularity,
        }
    }

    /// Return the latest rtt sample
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the smoothed RTT, if any sample has been taken.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    /// Return the variation in the RTT samples using a mean variation.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Return the Minimum RTT observed so far for this estimator.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// Return the retransmission timeout.
    pub fn rto(&self) -> Duration {
        match self.smoothed_rtt {
            Some(srtt) => {
                let rto = srtt + cmp::max(4 * self.rttvar, self.granularity);
                cmp::max(cmp::min(rto, self.max_rto), self.min_rto)
            }
            None => self.initial_rto,
        }
    }

    /// Update estimator with the given RTT sample
    pub fn update(&mut self, rtt: Duration) {
        self.latest_rtt = rtt;
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| cmp::min(m, rtt)));

        if let Some(smoothed_rtt) = self.smoothed_rtt {
            let var_sample = if smoothed_rtt > rtt {
                smoothed_rtt - rtt
            } else {
                rtt - smoothed_rtt
            };

            self.rttvar = (3 * self.rttvar + var_sample) / 4;
            self.smoothed_rtt = Some((7 * smoothed_rtt + rtt) / 8);
        } else {
            self.smoothed_rtt = Some(rtt);
            self.rttvar = rtt / 2;
        }
    }
}
