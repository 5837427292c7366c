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

//! Loss recovery of a connection: acknowledgment ingestion, RACK loss
//! detection and the reordering timer.

use std::cmp;
use std::ops::Range;
use std::time::Duration;
use std::time::Instant;

use log::*;
use smallvec::SmallVec;

use crate::congestion_control::CongestionOps;
use crate::rack::RackState;
use crate::segment::is_retransmission;
use crate::segment::seq_after;
use crate::segment::seq_before;
use crate::segment::SegmentFlags;
use crate::segment::SegmentHandle;
use crate::segment::SentSegment;
use crate::segment::SentSegmentStore;
use crate::Error;
use crate::RackConfig;
use crate::RackMode;
use crate::RackStats;
use crate::Result;
use rtt::RttEstimator;
use timer::round_to_granularity;
use timer::TimerKind;
use timer::TimerTable;

pub mod rtt;
pub mod timer;

/// The retransmission collaborator.
pub trait Transmitter {
    /// Retransmit the given segment now.
    ///
    /// Return false if the segment could not be sent, for example because
    /// the congestion window is full. Loss recovery then stops retransmitting
    /// until the next opportunity.
    fn retransmit(&mut self, handle: SegmentHandle, segment: &SentSegment) -> bool;
}

/// RACK loss recovery of a connection.
///
/// All entry points must be serialized by the caller. None of them blocks.
pub struct LossRecovery {
    /// Operating mode.
    mode: RackMode,

    /// Extra delay added to the reordering timer.
    reo_timeout_min: Duration,

    /// Granularity of the timer facility.
    timer_granularity: Duration,

    /// RACK state.
    pub rack: RackState,

    /// Segments sent and not yet cumulatively acknowledged.
    pub sent: SentSegmentStore,

    /// RTT estimation for the connection.
    pub rtt: RttEstimator,

    /// The transmit timer.
    pub timers: TimerTable,

    /// Congestion controller for the connection.
    pub congestion: Box<dyn CongestionOps>,

    /// Loss detection statistics.
    pub stats: RackStats,

    /// Trace id.
    trace_id: String,
}

impl LossRecovery {
    /// Create loss recovery for a connection whose initial sequence number
    /// is `isn`.
    pub fn new(conf: &RackConfig, isn: u32, congestion: Box<dyn CongestionOps>) -> Result<Self> {
        conf.validate()?;

        Ok(LossRecovery {
            mode: conf.mode(),
            reo_timeout_min: conf.reo_timeout_min(),
            timer_granularity: conf.timer_granularity(),
            rack: RackState::new(conf.reo_wnd_min()),
            sent: SentSegmentStore::new(isn),
            rtt: RttEstimator::new(
                conf.initial_rto(),
                conf.min_rto(),
                conf.max_rto(),
                conf.timer_granularity(),
            ),
            timers: TimerTable::default(),
            congestion,
            stats: RackStats::default(),
            trace_id: String::from(""),
        })
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
        self.rack.set_trace_id(trace_id);
    }

    /// Return the operating mode.
    pub fn mode(&self) -> RackMode {
        self.mode
    }

    /// Record the transmission of `len` new bytes.
    pub fn on_segment_sent(&mut self, len: u32, now: Instant) -> Result<SegmentHandle> {
        let handle = self.sent.on_sent(len, now)?;
        if self.timers.pending().is_none() {
            self.timers.set(TimerKind::Retransmit, now + self.rtt.rto());
        }

        trace!(
            "now={:?} {} ON_SENT {:?} inflight={}",
            now,
            self.trace_id,
            self.sent.get(handle),
            self.sent.in_flight()
        );
        Ok(handle)
    }

    /// Record a retransmission of the segment.
    pub fn on_retransmit(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        self.sent.on_retransmit(handle, now)?;
        if self.timers.pending().is_none() {
            self.timers.set(TimerKind::Retransmit, now + self.rtt.rto());
        }

        trace!(
            "now={:?} {} ON_RETRANSMIT {:?} retrans_out={}",
            now,
            self.trace_id,
            self.sent.get(handle),
            self.sent.retrans_out()
        );
        Ok(())
    }

    /// Process an incoming acknowledgment with the cumulative ack `ack` and
    /// the SACK blocks `sacks`.
    pub fn on_ack_received(&mut self, ack: u32, sacks: &[Range<u32>], now: Instant) -> Result<()> {
        let snd_nxt = self.sent.snd_nxt();
        if sacks.iter().any(|r| seq_after(r.end, snd_nxt)) {
            return Err(Error::InvalidAck);
        }

        trace!(
            "now={:?} {} BEGIN_ACK ack={} sacks={:?} inflight={}",
            now,
            self.trace_id,
            ack,
            sacks,
            self.sent.in_flight()
        );

        let prior_snd_una = self.sent.snd_una();
        let prior_highest_sack = self.sent.highest_sack_end();
        let mut delivered = self.sent.on_cumulative_ack(ack)?;
        for range in sacks {
            delivered.extend(self.sent.sack_range(range.clone()));
        }

        // Previously sacked segments already took part in an earlier ack.
        delivered.retain(|d| !d.flags.contains(SegmentFlags::Sacked));

        // Take an RTT sample from the latest sent segment that was never
        // retransmitted. See Karn's algorithm.
        let rtt_sample = delivered
            .iter()
            .filter(|d| !is_retransmission(d.flags))
            .map(|d| d.sent_time)
            .max()
            .map(|sent_time| now.saturating_duration_since(sent_time));
        if let Some(rtt) = rtt_sample {
            self.rtt.update(rtt);
        }

        if self.mode.marks_lost() {
            let min_rtt = self.rtt.min_rtt();
            let mut reordered = false;
            for d in delivered.iter() {
                self.rack.advance(d.flags, d.end_seq, d.sent_time, now, min_rtt);

                // An original delivered below the highest sacked sequence, or
                // after it was marked lost, arrived out of order.
                if !is_retransmission(d.flags)
                    && (prior_highest_sack.map_or(false, |h| seq_before(d.end_seq, h))
                        || d.flags.contains(SegmentFlags::Lost))
                {
                    reordered = true;
                }
            }
            if reordered {
                self.rack.note_reordering();
                self.stats.reordering_events = self.stats.reordering_events.saturating_add(1);
            }
        }

        self.sent.drain_acked();
        if seq_after(self.sent.snd_una(), prior_snd_una) {
            // Restart the retransmission timer on forward progress.
            // See RFC 6298 Section 5.3
            self.rearm_rto(now);
        }

        self.on_ack_batch(now);

        trace!(
            "now={:?} {} END_ACK delivered={} inflight={} lost_out={} sacked_out={} retrans_out={} timer={:?}",
            now,
            self.trace_id,
            delivered.len(),
            self.sent.in_flight(),
            self.sent.lost_out(),
            self.sent.sacked_out(),
            self.sent.retrans_out(),
            self.timers.pending()
        );
        Ok(())
    }

    /// Run loss detection once for the acknowledgments processed so far, and
    /// arm the reordering timer if some segments could not be judged yet.
    ///
    /// RACK is only used after loss recovery starts, so nothing is done in
    /// the states below `Recovery`.
    pub fn on_ack_batch(&mut self, now: Instant) {
        if !self.mode.marks_lost() || !self.congestion.ca_state().in_recovery() {
            return;
        }

        let timeout = self
            .rack
            .detect_loss(&mut self.sent, self.rtt.min_rtt(), now, &mut self.stats);
        if let Some(timeout) = timeout {
            if self.mode.uses_reo_timer() {
                self.arm_reo_timer(timeout, now);
            }
        }
    }

    /// Arm the reordering timer to expire `timeout` from now, bounded by the
    /// retransmission timeout.
    fn arm_reo_timer(&mut self, timeout: Duration, now: Instant) {
        match self.timers.pending() {
            None | Some(TimerKind::Retransmit) | Some(TimerKind::ReoTimeout) => (),
            Some(kind) => {
                trace!(
                    "now={:?} {} reo timer deferred to {:?}",
                    now,
                    self.trace_id,
                    kind
                );
                return;
            }
        }

        let delay = round_to_granularity(timeout + self.reo_timeout_min, self.timer_granularity);
        let delay = cmp::min(delay, self.rtt.rto());
        self.timers.set(TimerKind::ReoTimeout, now + delay);

        trace!(
            "now={:?} {} SET_REO_TIMER timeout={:?} delay={:?}",
            now,
            self.trace_id,
            timeout,
            delay
        );
    }

    /// Handle the expiry of the reordering timer.
    ///
    /// Segments found lost are retransmitted. Fast recovery is entered first
    /// only from the states below `Recovery`; a connection in `Loss` stays
    /// there. Return the number of segments newly marked lost.
    pub fn on_reo_timeout(&mut self, now: Instant, tx: &mut dyn Transmitter) -> usize {
        if !self.mode.uses_reo_timer() {
            return 0;
        }
        self.stats.reo_timeouts = self.stats.reo_timeouts.saturating_add(1);

        let prior_in_flight = self.sent.in_flight();
        let prior_lost = self.stats.lost_count;

        // The remaining segments are re-checked against the current reference
        // even if it did not move.
        self.rack.mark_dirty();
        self.rack.detect_loss(&mut self.sent, self.rtt.min_rtt(), now, &mut self.stats);
        let lost = self.stats.lost_count.saturating_sub(prior_lost) as usize;

        if self.sent.in_flight() < prior_in_flight {
            if !self.congestion.ca_state().in_recovery() {
                debug!(
                    "now={:?} {} reo timeout enters recovery from {:?}",
                    now,
                    self.trace_id,
                    self.congestion.ca_state()
                );
                self.congestion.enter_recovery(now);
                self.stats.recovery_entries = self.stats.recovery_entries.saturating_add(1);
                if !self.congestion.has_cong_control() {
                    self.congestion.reduce_cwnd(1);
                }
            }
            self.retransmit_lost(now, tx);
        }

        if !self.timers.is_pending(TimerKind::Retransmit) {
            self.rearm_rto(now);
        }

        trace!(
            "now={:?} {} ON_REO_TIMEOUT lost={} inflight={}->{} timer={:?}",
            now,
            self.trace_id,
            lost,
            prior_in_flight,
            self.sent.in_flight(),
            self.timers.pending()
        );
        lost
    }

    /// Retransmit the segments marked lost that have no outstanding
    /// retransmission, in sequence order. Return the number of segments
    /// retransmitted.
    pub fn retransmit_lost(&mut self, now: Instant, tx: &mut dyn Transmitter) -> usize {
        let lost: SmallVec<[SegmentHandle; 16]> = self
            .sent
            .iter()
            .filter(|(_, seg)| seg.is_lost() && !seg.is_retransmitted())
            .map(|(handle, _)| handle)
            .collect();

        let mut count = 0;
        for handle in lost {
            let accepted = match self.sent.get(handle) {
                Some(seg) => tx.retransmit(handle, seg),
                None => continue,
            };
            if !accepted {
                break;
            }
            if self.sent.on_retransmit(handle, now).is_ok() {
                count += 1;
            }
        }

        self.stats.retransmits = self.stats.retransmits.saturating_add(count as u64);
        count
    }

    /// Restart the retransmission timer, or stop it if nothing is
    /// outstanding. A pending zero window probe is left alone.
    fn rearm_rto(&mut self, now: Instant) {
        if self.timers.is_pending(TimerKind::ZeroWindowProbe) {
            return;
        }

        if self.sent.packets_out() == 0 {
            self.timers.stop();
            return;
        }
        self.timers.set(TimerKind::Retransmit, now + self.rtt.rto());
    }

    /// Handle the expiry of the transmit timer.
    ///
    /// It returns the kind of the expired timer, if any. The reordering timer
    /// is handled here, the other kinds are left to the caller.
    pub fn on_timeout(&mut self, now: Instant, tx: &mut dyn Transmitter) -> Option<TimerKind> {
        let kind = self.timers.take_expired(now)?;
        if kind == TimerKind::ReoTimeout {
            self.on_reo_timeout(now, tx);
        }
        Some(kind)
    }

    /// Return the expiration time of the transmit timer.
    pub fn timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }
}
