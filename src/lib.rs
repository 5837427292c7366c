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

//! An implementation of RACK ("Recent ACK") loss detection for reliable,
//! ordered, retransmitting stream transports such as TCP.
//!
//! RACK orders the evidence of delivery by *send time* instead of by
//! sequence distance: once a segment sent later than some outstanding
//! segment has been acknowledged or selectively acknowledged, and more than
//! a reordering window has passed between the two transmissions, the older
//! segment is presumed lost. This applies to original transmissions and to
//! retransmissions alike.
//!
//! ## Components
//!
//! * [`SentSegmentStore`]: outstanding segments in an index-addressed arena.
//! * [`RackState`]: the per-connection reference time, reordering window and
//!   the advance and detection steps.
//! * [`LossRecovery`]: drives detection from acknowledgments and the
//!   reordering timer, and talks to the congestion control and transmission
//!   collaborators.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use std::time::Instant;
//!
//! use tcp_rack::congestion_control::CaState;
//! use tcp_rack::congestion_control::Dummy;
//! use tcp_rack::LossRecovery;
//! use tcp_rack::RackConfig;
//!
//! let mut cc = Dummy::new();
//! cc.set_ca_state(CaState::Recovery);
//! let mut recovery = LossRecovery::new(&RackConfig::default(), 0, Box::new(cc))?;
//!
//! let now = Instant::now();
//! for i in 0..3 {
//!     recovery.on_segment_sent(1000, now + Duration::from_millis(i * 10))?;
//! }
//!
//! // The last segment is selectively acknowledged long after the first one
//! // was sent, so the first two are presumed lost.
//! recovery.on_ack_received(0, &[2000..3000], now + Duration::from_millis(50))?;
//! assert_eq!(recovery.sent.lost_out(), 2);
//! # Ok::<(), tcp_rack::error::Error>(())
//! ```

use std::cmp;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use strum_macros::EnumIter;

/// Lower bound of the reordering window.
pub const REO_WND_MIN: Duration = Duration::from_micros(1000);

/// Extra delay added to the reordering timer so that it never fires ahead of
/// the computed deadline.
pub const REO_TIMEOUT_MIN: Duration = Duration::from_micros(2000);

/// Granularity of the timer facility. Timer delays are rounded up to it.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// The retransmission timeout before any RTT sample is taken.
/// See RFC 6298 Section 2.1
pub const INITIAL_RTO: Duration = Duration::from_secs(1);

/// The lower bound of the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// The upper bound of the retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(120);

/// A specialized [`Result`] type for loss recovery operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Operating mode of RACK loss detection.
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, EnumIter)]
pub enum RackMode {
    /// RACK is not used. Acknowledgments are still accounted, but segments
    /// are never marked lost by RACK.
    Disabled,

    /// Segments are marked lost when acknowledgments arrive, without a
    /// reordering timer.
    LostRetrans,

    /// Segments are marked lost when acknowledgments arrive, and a reordering
    /// timer re-checks the segments whose loss could not be confirmed yet.
    #[default]
    ReoTimeout,
}

impl RackMode {
    /// Whether RACK marks segments lost in this mode.
    pub fn marks_lost(self) -> bool {
        self != RackMode::Disabled
    }

    /// Whether the reordering timer is used in this mode.
    pub fn uses_reo_timer(self) -> bool {
        self == RackMode::ReoTimeout
    }
}

impl FromStr for RackMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<RackMode> {
        if mode.eq_ignore_ascii_case("off") || mode.eq_ignore_ascii_case("disabled") {
            Ok(RackMode::Disabled)
        } else if mode.eq_ignore_ascii_case("lost-retrans") {
            Ok(RackMode::LostRetrans)
        } else if mode.eq_ignore_ascii_case("reo-timeout") {
            Ok(RackMode::ReoTimeout)
        } else {
            Err(Error::InvalidConfig(format!("unknown rack mode {}", mode)))
        }
    }
}

impl TryFrom<u8> for RackMode {
    type Error = Error;

    /// Convert from the historical integer knob.
    fn try_from(v: u8) -> Result<RackMode> {
        match v {
            0 => Ok(RackMode::Disabled),
            1 => Ok(RackMode::LostRetrans),
            2 => Ok(RackMode::ReoTimeout),
            _ => Err(Error::InvalidConfig(format!("unknown rack mode {}", v))),
        }
    }
}

/// Configurations about RACK loss detection and the retransmission timer.
#[derive(Debug, Clone)]
pub struct RackConfig {
    /// Operating mode.
    mode: RackMode,

    /// The lower bound of the reordering window.
    reo_wnd_min: Duration,

    /// Extra delay added to the reordering timer.
    reo_timeout_min: Duration,

    /// Granularity of the timer facility.
    timer_granularity: Duration,

    /// The retransmission timeout used before any RTT sample is taken.
    initial_rto: Duration,

    /// The lower bound of the retransmission timeout.
    min_rto: Duration,

    /// The upper bound of the retransmission timeout.
    max_rto: Duration,
}

impl RackConfig {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operating mode.
    pub fn set_mode(&mut self, mode: RackMode) {
        self.mode = mode;
    }

    /// Return the operating mode.
    pub fn mode(&self) -> RackMode {
        self.mode
    }

    /// Set the lower bound of the reordering window in microseconds. The
    /// window is never shorter than one microsecond.
    pub fn set_reo_wnd_min(&mut self, v: u64) {
        self.reo_wnd_min = cmp::max(Duration::from_micros(v), Duration::from_micros(1));
    }

    /// Return the lower bound of the reordering window.
    pub fn reo_wnd_min(&self) -> Duration {
        self.reo_wnd_min
    }

    /// Set the extra delay of the reordering timer in microseconds.
    pub fn set_reo_timeout_min(&mut self, v: u64) {
        self.reo_timeout_min = Duration::from_micros(v);
    }

    /// Return the extra delay of the reordering timer.
    pub fn reo_timeout_min(&self) -> Duration {
        self.reo_timeout_min
    }

    /// Set the granularity of the timer facility in microseconds. Zero is
    /// raised to one microsecond.
    pub fn set_timer_granularity(&mut self, v: u64) {
        self.timer_granularity = cmp::max(Duration::from_micros(v), Duration::from_micros(1));
    }

    /// Return the granularity of the timer facility.
    pub fn timer_granularity(&self) -> Duration {
        self.timer_granularity
    }

    /// Set the initial retransmission timeout in milliseconds.
    pub fn set_initial_rto(&mut self, v: u64) {
        self.initial_rto = cmp::max(Duration::from_millis(v), TIMER_GRANULARITY);
    }

    /// Return the initial retransmission timeout.
    pub fn initial_rto(&self) -> Duration {
        self.initial_rto
    }

    /// Set the lower bound of the retransmission timeout in milliseconds.
    pub fn set_min_rto(&mut self, v: u64) {
        self.min_rto = cmp::max(Duration::from_millis(v), TIMER_GRANULARITY);
    }

    /// Return the lower bound of the retransmission timeout.
    pub fn min_rto(&self) -> Duration {
        self.min_rto
    }

    /// Set the upper bound of the retransmission timeout in milliseconds.
    pub fn set_max_rto(&mut self, v: u64) {
        self.max_rto = cmp::max(Duration::from_millis(v), TIMER_GRANULARITY);
    }

    /// Return the upper bound of the retransmission timeout.
    pub fn max_rto(&self) -> Duration {
        self.max_rto
    }

    /// Check the configuration for contradicting values.
    pub fn validate(&self) -> Result<()> {
        if self.min_rto > self.max_rto {
            return Err(Error::InvalidConfig(format!(
                "min_rto {:?} exceeds max_rto {:?}",
                self.min_rto, self.max_rto
            )));
        }
        if self.initial_rto < self.min_rto || self.initial_rto > self.max_rto {
            return Err(Error::InvalidConfig(format!(
                "initial_rto {:?} is out of [{:?}, {:?}]",
                self.initial_rto, self.min_rto, self.max_rto
            )));
        }
        Ok(())
    }
}

impl Default for RackConfig {
    fn default() -> RackConfig {
        RackConfig {
            mode: RackMode::default(),
            reo_wnd_min: REO_WND_MIN,
            reo_timeout_min: REO_TIMEOUT_MIN,
            timer_granularity: TIMER_GRANULARITY,
            initial_rto: INITIAL_RTO,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
        }
    }
}

/// Statistics about RACK loss detection on a connection.
#[repr(C)]
#[derive(Debug, Default, Clone, Serialize)]
pub struct RackStats {
    /// The number of scans of the sent segments.
    pub scans: u64,

    /// The number of segments marked lost.
    pub lost_count: u64,

    /// The number of retransmissions presumed lost as well.
    pub lost_retransmits: u64,

    /// The number of expired reordering timers.
    pub reo_timeouts: u64,

    /// The number of times the reordering timer requested recovery entry.
    pub recovery_entries: u64,

    /// The number of reordering events inferred from acknowledgments.
    pub reordering_events: u64,

    /// The number of retransmissions requested from the transmitter.
    pub retransmits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn default_config() {
        let conf = RackConfig::new();
        assert_eq!(conf.mode(), RackMode::ReoTimeout);
        assert_eq!(conf.reo_wnd_min(), Duration::from_micros(1000));
        assert_eq!(conf.reo_timeout_min(), Duration::from_micros(2000));
        assert_eq!(conf.timer_granularity(), TIMER_GRANULARITY);
        assert_eq!(conf.initial_rto(), INITIAL_RTO);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn reo_wnd_min() {
        let mut conf = RackConfig::new();
        conf.set_reo_wnd_min(0);
        assert_eq!(conf.reo_wnd_min(), Duration::from_micros(1));

        conf.set_reo_wnd_min(8);
        assert_eq!(conf.reo_wnd_min(), Duration::from_micros(8));
    }

    #[test]
    fn timer_granularity() {
        let mut conf = RackConfig::new();
        conf.set_timer_granularity(0);
        assert_eq!(conf.timer_granularity(), Duration::from_micros(1));

        conf.set_timer_granularity(4000);
        assert_eq!(conf.timer_granularity(), Duration::from_millis(4));
    }

    #[test]
    fn rto_bounds() {
        let mut conf = RackConfig::new();
        conf.set_min_rto(0);
        assert_eq!(conf.min_rto(), TIMER_GRANULARITY);
        assert!(conf.validate().is_ok());

        conf.set_max_rto(100);
        assert!(conf.validate().is_err());

        conf.set_max_rto(2000);
        conf.set_initial_rto(3000);
        assert_eq!(
            conf.validate(),
            Err(Error::InvalidConfig(
                "initial_rto 3s is out of [1ms, 2s]".into()
            ))
        );
    }

    #[test]
    fn rack_mode() {
        for mode in RackMode::iter() {
            assert_eq!(RackMode::try_from(mode as u8), Ok(mode));
        }
        assert!(RackMode::try_from(3).is_err());

        assert_eq!("OFF".parse::<RackMode>(), Ok(RackMode::Disabled));
        assert_eq!("lost-retrans".parse::<RackMode>(), Ok(RackMode::LostRetrans));
        assert_eq!("Reo-Timeout".parse::<RackMode>(), Ok(RackMode::ReoTimeout));
        assert!("fack".parse::<RackMode>().is_err());

        assert!(!RackMode::Disabled.marks_lost());
        assert!(RackMode::LostRetrans.marks_lost());
        assert!(!RackMode::LostRetrans.uses_reo_timer());
        assert!(RackMode::ReoTimeout.uses_reo_timer());
    }

    #[test]
    fn stats_export() {
        let stats = RackStats {
            scans: 3,
            lost_count: 2,
            ..RackStats::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.starts_with("{\"scans\":3,\"lost_count\":2,"));
    }
}

pub use crate::error::Error;
pub use crate::rack::RackState;
pub use crate::recovery::LossRecovery;
pub use crate::recovery::Transmitter;
pub use crate::segment::SegmentFlags;
pub use crate::segment::SegmentHandle;
pub use crate::segment::SentSegment;
pub use crate::segment::SentSegmentStore;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

#[path = "recovery/recovery.rs"]
pub mod recovery;

pub mod error;
pub mod rack;
pub mod segment;
