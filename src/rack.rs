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

//! Time-domain loss detection state of a connection.
//!
//! A segment is presumed lost once a segment sent more than a reordering
//! window after it has been delivered. Retransmissions are judged the same
//! way as original transmissions.

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use smallvec::SmallVec;

use crate::segment::is_retransmission;
use crate::segment::seq_after;
use crate::segment::SegmentFlags;
use crate::segment::SegmentHandle;
use crate::segment::SentSegmentStore;
use crate::RackStats;

/// Per-connection RACK state.
#[derive(Debug, Clone)]
pub struct RackState {
    /// The send time of the most recently sent segment known to have been
    /// acknowledged or selectively acknowledged.
    reference_time: Option<Instant>,

    /// The end sequence number of the segment that set `reference_time`.
    reference_end_seq: u32,

    /// The RTT sample taken when `reference_time` was set.
    rtt: Duration,

    /// Whether reordering has been observed on the connection.
    reorder_observed: bool,

    /// Whether the reference changed since the last scan.
    dirty: bool,

    /// The lower bound of the reordering window.
    reo_wnd_min: Duration,

    /// Trace id.
    trace_id: String,
}

impl RackState {
    pub fn new(reo_wnd_min: Duration) -> Self {
        RackState {
            reference_time: None,
            reference_end_seq: 0,
            rtt: Duration::ZERO,
            reorder_observed: false,
            dirty: false,
            reo_wnd_min,
            trace_id: String::from(""),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    pub fn reference_time(&self) -> Option<Instant> {
        self.reference_time
    }

    pub fn reference_end_seq(&self) -> u32 {
        self.reference_end_seq
    }

    /// The RTT sample recorded together with the reference time.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn reorder_observed(&self) -> bool {
        self.reorder_observed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record that the connection has seen reordering. From now on the
    /// reordering window adapts to the minimum RTT.
    pub fn note_reordering(&mut self) {
        if !self.reorder_observed {
            debug!("{} rack reordering observed", self.trace_id);
        }
        self.reorder_observed = true;
    }

    /// Force the next scan to run even if the reference did not move.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Record the most recently (re)sent time among the delivered segments.
    ///
    /// It is called once per segment newly acknowledged or selectively
    /// acknowledged, and returns whether the reference moved.
    pub fn advance(
        &mut self,
        flags: BitFlags<SegmentFlags>,
        end_seq: u32,
        sent_time: Instant,
        now: Instant,
        min_rtt: Option<Duration>,
    ) -> bool {
        if let Some(reference_time) = self.reference_time {
            if reference_time >= sent_time {
                return false;
            }
        }

        // The delivery of a retransmitted segment may belong to any of its
        // transmissions. It cannot be for the latest one if it came back
        // sooner than min_rtt.
        let rtt = now.saturating_duration_since(sent_time);
        if is_retransmission(flags) {
            if let Some(min_rtt) = min_rtt {
                if rtt < min_rtt {
                    trace!(
                        "{} rack ambiguous ack end_seq={} rtt={:?} min_rtt={:?}",
                        self.trace_id,
                        end_seq,
                        rtt,
                        min_rtt
                    );
                    return false;
                }
            }
        }

        self.reference_time = Some(sent_time);
        self.reference_end_seq = end_seq;
        self.rtt = rtt;
        self.dirty = true;
        true
    }

    /// Return the reordering window.
    ///
    /// Once reordering has been observed the window widens to a quarter of
    /// the minimum RTT, never below the configured floor.
    pub fn reo_wnd(&self, min_rtt: Option<Duration>) -> Duration {
        match min_rtt {
            Some(min_rtt) if self.reorder_observed => cmp::max(min_rtt / 4, self.reo_wnd_min),
            _ => self.reo_wnd_min,
        }
    }

    /// Mark the segments sent more than a reordering window before the
    /// reference time as lost.
    ///
    /// It returns how long after the reference time the earliest segment
    /// still inside the reordering window can be declared lost, if any.
    pub fn detect_loss(
        &mut self,
        sent: &mut SentSegmentStore,
        min_rtt: Option<Duration>,
        now: Instant,
        stats: &mut RackStats,
    ) -> Option<Duration> {
        if !self.dirty {
            return None;
        }

        self.dirty = false;

        let reference_time = self.reference_time?;
        let reo_wnd = self.reo_wnd(min_rtt);
        let snd_una = sent.snd_una();
        stats.scans = stats.scans.saturating_add(1);

        let mut timeout: Option<Duration> = None;
        let mut expired: SmallVec<[SegmentHandle; 16]> = SmallVec::new();
        for (handle, seg) in sent.iter() {
            if seg.is_acked() || seg.is_sacked() || !seq_after(seg.end_seq(), snd_una) {
                continue;
            }

            if seg.sent_time < reference_time {
                let elapsed = reference_time - seg.sent_time;
                if elapsed <= reo_wnd {
                    let remaining = reo_wnd - elapsed;
                    timeout = Some(timeout.map_or(remaining, |t| cmp::min(t, remaining)));
                    continue;
                }

                // A segment sent later has been delivered.
                expired.push(handle);
            } else if !seg.is_retransmission() {
                // Later originals were sent even later.
                break;
            }
        }

        for handle in expired {
            if sent.mark_lost(handle) {
                stats.lost_count = stats.lost_count.saturating_add(1);
            }
            if sent.clear_retransmitted(handle) {
                stats.lost_retransmits = stats.lost_retransmits.saturating_add(1);
                debug!(
                    "now={:?} {} rack lost retransmit {:?}",
                    now,
                    self.trace_id,
                    sent.get(handle)
                );
            }
            trace!(
                "now={:?} {} rack ON_LOST {:?} reo_wnd={:?} lost_out={} retrans_out={}",
                now,
                self.trace_id,
                sent.get(handle),
                reo_wnd,
                sent.lost_out(),
                sent.retrans_out()
            );
        }

        timeout
    }
}
