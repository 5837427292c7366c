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

use std::time::Duration;
use std::time::Instant;

use strum_macros::EnumIter;

/// Kinds of the transmit timer of a connection.
///
/// A connection has a single transmit timer slot that is shared by these
/// purposes, so arming one of them replaces whichever is pending.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, EnumIter)]
pub enum TimerKind {
    /// When to retransmit the oldest outstanding segment
    Retransmit,

    /// When to re-check the segments whose loss could not be confirmed yet
    ReoTimeout,

    /// When to probe a zero receive window
    ZeroWindowProbe,
}

/// The transmit timer slot.
#[derive(Debug, Copy, Clone, Default)]
pub struct TimerTable {
    pending: Option<(TimerKind, Instant)>,
}

impl TimerTable {
    /// Arm the given timer, replacing any pending one.
    pub fn set(&mut self, kind: TimerKind, time: Instant) {
        self.pending = Some((kind, time));
    }

    /// Get expiration time for the given timer
    pub fn get(&self, kind: TimerKind) -> Option<Instant> {
        match self.pending {
            Some((k, time)) if k == kind => Some(time),
            _ => None,
        }
    }

    /// Return the kind of the pending timer.
    pub fn pending(&self) -> Option<TimerKind> {
        self.pending.map(|(k, _)| k)
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending() == Some(kind)
    }

    /// Cancel the pending timer
    pub fn stop(&mut self) {
        self.pending = None;
    }

    /// Get the expiration time of the pending timer
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.map(|(_, time)| time)
    }

    /// Check whether the pending timer is expired
    pub fn is_expired(&self, after: Instant) -> bool {
        self.pending.map_or(false, |(_, time)| time <= after)
    }

    /// Disarm the pending timer and return its kind if it is expired.
    pub fn take_expired(&mut self, after: Instant) -> Option<TimerKind> {
        if !self.is_expired(after) {
            return None;
        }
        self.pending.take().map(|(k, _)| k)
    }
}

/// Round `d` up to a multiple of the timer granularity.
pub(crate) fn round_to_granularity(d: Duration, granularity: Duration) -> Duration {
    let g = granularity.as_nanos();
    if g == 0 {
        return d;
    }
    let n = d.as_nanos();
    let rounded = (n + g - 1) / g * g;
    Duration::from_nanos(u64::try_from(rounded).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Add;
    use strum::IntoEnumIterator;

    #[test]
    fn timer_operation() {
        let mut timers = TimerTable::default();
        assert_eq!(timers.next_timeout(), None);
        assert_eq!(timers.pending(), None);

        let now = Instant::now();
        let rto_time = now.add(Duration::from_millis(200));
        let reo_time = now.add(Duration::from_millis(3));
        timers.set(TimerKind::Retransmit, rto_time);
        assert_eq!(timers.get(TimerKind::Retransmit), Some(rto_time));
        assert!(timers.is_pending(TimerKind::Retransmit));
        assert_eq!(timers.next_timeout(), Some(rto_time));

        // The slot is shared.
        timers.set(TimerKind::ReoTimeout, reo_time);
        assert_eq!(timers.get(TimerKind::Retransmit), None);
        assert_eq!(timers.get(TimerKind::ReoTimeout), Some(reo_time));
        assert_eq!(timers.pending(), Some(TimerKind::ReoTimeout));
        for kind in TimerKind::iter().filter(|&k| k != TimerKind::ReoTimeout) {
            assert!(!timers.is_pending(kind));
        }

        timers.stop();
        assert_eq!(timers.get(TimerKind::ReoTimeout), None);
        assert_eq!(timers.next_timeout(), None);
    }

    #[test]
    fn timer_expiration() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        let reo_time = now.add(Duration::from_millis(3));
        timers.set(TimerKind::ReoTimeout, reo_time);

        assert!(!timers.is_expired(now));
        assert_eq!(timers.take_expired(now), None);
        assert!(timers.is_pending(TimerKind::ReoTimeout));

        // Advance ticks
        let now = reo_time;
        assert!(timers.is_expired(now));
        assert_eq!(timers.take_expired(now), Some(TimerKind::ReoTimeout));
        assert_eq!(timers.pending(), None);
        assert_eq!(timers.take_expired(now), None);
    }

    #[test]
    fn granularity() {
        let ms = Duration::from_millis(1);
        assert_eq!(round_to_granularity(Duration::ZERO, ms), Duration::ZERO);
        assert_eq!(round_to_granularity(Duration::from_micros(1), ms), ms);
        assert_eq!(round_to_granularity(ms, ms), ms);
        assert_eq!(
            round_to_granularity(Duration::from_micros(5001), ms),
            Duration::from_millis(6)
        );
        assert_eq!(
            round_to_granularity(Duration::from_micros(5001), Duration::ZERO),
            Duration::from_micros(5001)
        );
    }
}
